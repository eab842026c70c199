//! Back-off polling of the recording database.
//!
//! The service answers `station.database_query_by_date` with a broadcast
//! event instead of a reply, so the poller cannot use the correlator. Each
//! attempt registers a one-shot hand-off slot that the dispatcher fills via
//! [`QueryPoller::on_query_result`]; the slot has its own timeout so an
//! answer that never comes cannot wedge the cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use camrelay_core::{BridgeConfig, RecordingRecord, SeenSet, commands};
use chrono::{Days, Local, NaiveDate};
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::correlator::CommandSender;

/// Poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Station the query is addressed to.
    pub station_serial: String,
    /// Only records from this device count as results.
    pub device_serial: String,
    /// Sleep before each attempt.
    pub schedule: Vec<Duration>,
    /// How long one attempt waits for its query-result event.
    pub response_timeout: Duration,
}

impl From<&BridgeConfig> for PollerConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            station_serial: config.station_serial.clone(),
            device_serial: config.device_serial.clone(),
            schedule: config.poll_schedule(),
            response_timeout: config.query_response_timeout(),
        }
    }
}

/// The single occupant of the hand-off slot.
struct Handoff {
    ticket: u64,
    resolver: oneshot::Sender<Vec<RecordingRecord>>,
}

/// Resets the polling flag however the cycle ends.
struct PollCycle<'a> {
    active: &'a AtomicBool,
}

impl Drop for PollCycle<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub struct QueryPoller {
    sender: Arc<dyn CommandSender>,
    config: PollerConfig,
    polling: AtomicBool,
    handoff: Mutex<Option<Handoff>>,
    next_ticket: AtomicU64,
}

impl QueryPoller {
    pub fn new(sender: Arc<dyn CommandSender>, config: PollerConfig) -> Self {
        Self {
            sender,
            config,
            polling: AtomicBool::new(false),
            handoff: Mutex::new(None),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Whether a poll cycle is running.
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Whether an attempt is waiting for a query result.
    pub fn is_waiting(&self) -> bool {
        self.handoff.lock().is_some()
    }

    /// Deliver query results to the waiting attempt, if any.
    pub fn on_query_result(&self, records: Vec<RecordingRecord>) -> bool {
        match self.handoff.lock().take() {
            Some(handoff) => handoff.resolver.send(records).is_ok(),
            None => false,
        }
    }

    /// Poll until records for the target device that are not in `seen` show
    /// up, or the schedule is exhausted.
    ///
    /// Returns `[]` immediately when a cycle is already running. `seen` is
    /// read, never written.
    pub async fn poll_for_new_events(&self, seen: &SeenSet) -> Vec<RecordingRecord> {
        if self
            .polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Poll already in progress, skipping");
            return Vec::new();
        }
        let _cycle = PollCycle {
            active: &self.polling,
        };

        for delay in &self.config.schedule {
            info!("Waiting {}s before querying", delay.as_secs_f64());
            tokio::time::sleep(*delay).await;

            let records = self.query_and_wait().await;
            let fresh: Vec<RecordingRecord> = records
                .into_iter()
                .filter(|r| r.device_sn == self.config.device_serial && !seen.contains(&r.storage_path))
                .collect();

            if !fresh.is_empty() {
                info!("Found {} new recording(s) after back-off", fresh.len());
                return fresh;
            }
            debug!("No new recordings yet, retrying");
        }

        warn!("No new recordings found after all retries");
        Vec::new()
    }

    /// Send one query without waiting for its result.
    pub fn fire_query(&self) {
        if let Err(e) = self
            .sender
            .send(commands::DATABASE_QUERY_BY_DATE, self.query_params())
        {
            warn!("Failed to send database query: {}", e);
        }
    }

    async fn query_and_wait(&self) -> Vec<RecordingRecord> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (resolver, waiter) = oneshot::channel();
        *self.handoff.lock() = Some(Handoff { ticket, resolver });

        if let Err(e) = self
            .sender
            .send(commands::DATABASE_QUERY_BY_DATE, self.query_params())
        {
            warn!("Failed to send database query: {}", e);
            self.clear_handoff(ticket);
            return Vec::new();
        }

        match tokio::time::timeout(self.config.response_timeout, waiter).await {
            Ok(Ok(records)) => records,
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                warn!("Query response timeout");
                self.clear_handoff(ticket);
                Vec::new()
            }
        }
    }

    fn clear_handoff(&self, ticket: u64) {
        let mut slot = self.handoff.lock();
        if slot.as_ref().is_some_and(|h| h.ticket == ticket) {
            *slot = None;
        }
    }

    /// Query covering today and tomorrow.
    pub fn query_params(&self) -> JsonValue {
        let today = Local::now().date_naive();
        query_params_for(&self.config.station_serial, today)
    }
}

fn query_params_for(station_serial: &str, day: NaiveDate) -> JsonValue {
    let next = day.checked_add_days(Days::new(1)).unwrap_or(day);
    json!({
        "serialNumber": station_serial,
        "serialNumbers": [],
        "startDate": day.format("%Y%m%d").to_string(),
        "endDate": next.format("%Y%m%d").to_string(),
        "eventType": 0,
        "detectionType": 0,
        "storageType": 0,
    })
}
