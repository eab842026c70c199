//! Inbound message routing.
//!
//! The dispatcher is the single consumer of the transport's event channel and
//! the only component that holds references to all the others. Each inbound
//! message lands in exactly one [`Route`].

use std::sync::Arc;
use std::time::Duration;

use camrelay_core::{
    BridgeConfig, DeviceEvent, DownloadJob, InboundMessage, RecordingRecord, SeenSet, commands,
    message_id, parse_message, parse_reply,
};
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::captcha::CaptchaChannel;
use crate::correlator::{Correlator, RequestError};
use crate::pipeline::DownloadPipeline;
use crate::poller::QueryPoller;
use crate::transport::TransportEvent;

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Only detections from this device start a poll.
    pub device_serial: String,
    pub schema_version: u32,
    /// Timeout for `set_api_schema` and `start_listening`.
    pub request_timeout: Duration,
    /// How long `driver.connect` may take before the startup query is sent
    /// regardless.
    pub connect_timeout: Duration,
}

impl From<&BridgeConfig> for DispatcherConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            device_serial: config.device_serial.clone(),
            schema_version: config.schema_version,
            request_timeout: config.request_timeout(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Where an inbound message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Reply handed to a pending request.
    Reply,
    /// `success: false` reply nobody was waiting for.
    FailedReply,
    /// The service refused the start-download in flight; the queue moved on.
    StartRejected,
    Captcha,
    QueryResult,
    /// Detection for the monitored device; a poll cycle was started.
    Detection,
    /// Detection for some other device.
    IgnoredDetection,
    Download,
    Ignored,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    correlator: Arc<Correlator>,
    poller: Arc<QueryPoller>,
    pipeline: Arc<DownloadPipeline>,
    captcha: Arc<CaptchaChannel>,
    seen: SeenSet,
    handshake: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        correlator: Arc<Correlator>,
        poller: Arc<QueryPoller>,
        pipeline: Arc<DownloadPipeline>,
        captcha: Arc<CaptchaChannel>,
        seen: SeenSet,
    ) -> Self {
        Self {
            config,
            correlator,
            poller,
            pipeline,
            captcha,
            seen,
            handshake: None,
        }
    }

    /// Consume transport events until the transport shuts down.
    pub async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event);
        }
        info!("Transport closed, dispatcher stopping");
        self.abort_handshake();
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                let failed = self.correlator.fail_all();
                if failed > 0 {
                    debug!("Failed {} stale request(s) before handshake", failed);
                }
                self.start_handshake();
            }
            TransportEvent::Disconnected { reason } => {
                warn!("Connection lost: {}", reason);
                self.abort_handshake();
                let failed = self.correlator.fail_all();
                if failed > 0 {
                    info!("Failed {} pending request(s)", failed);
                }
                self.pipeline.abandon_active();
            }
            TransportEvent::Message(json) => {
                self.dispatch(&json);
            }
        }
    }

    /// Route one inbound frame.
    ///
    /// A frame carrying the id of a pending request is a reply whatever its
    /// `type` says.
    pub fn dispatch(&self, json: &JsonValue) -> Route {
        if message_id(json).is_some_and(|id| self.correlator.is_pending(&id))
            && self.correlator.resolve(parse_reply(json))
        {
            return Route::Reply;
        }

        match parse_message(json) {
            InboundMessage::Reply(reply) => {
                let id = reply.message_id.clone().unwrap_or_default();
                if reply.success {
                    debug!("Unmatched reply (messageId={})", id);
                    return Route::Ignored;
                }

                let error = reply.error_text();
                if self.pipeline.on_start_rejected(&id, &error) {
                    Route::StartRejected
                } else {
                    warn!("Command failed (messageId={}): {}", id, error);
                    Route::FailedReply
                }
            }
            InboundMessage::Event(event) => self.dispatch_event(event),
            InboundMessage::Other { message_type } => {
                debug!("Ignoring {} message", message_type);
                Route::Ignored
            }
        }
    }

    fn dispatch_event(&self, event: DeviceEvent) -> Route {
        if !event.is_streaming() {
            debug!("Event: {:?}", event);
        }

        match event {
            DeviceEvent::CaptchaRequest {
                captcha_id,
                captcha,
            } => {
                self.captcha.on_captcha_request(captcha_id, captcha);
                Route::Captcha
            }
            DeviceEvent::DatabaseQueryResult { records } => {
                info!("Query result: {} record(s)", records.len());
                let handed_off = self.poller.on_query_result(records.clone());
                if !handed_off && !self.poller.is_polling() {
                    self.discover(&records);
                }
                Route::QueryResult
            }
            DeviceEvent::Detection {
                kind,
                serial_number,
                ..
            } => {
                if serial_number.as_deref() != Some(self.config.device_serial.as_str()) {
                    debug!("{} on {:?}, not monitored", kind.label(), serial_number);
                    return Route::IgnoredDetection;
                }
                info!("{} on {}", kind.label(), self.config.device_serial);
                self.spawn_poll();
                Route::Detection
            }
            DeviceEvent::DownloadStarted {
                serial_number,
                metadata,
            } => {
                self.pipeline.on_download_started(&serial_number, metadata);
                Route::Download
            }
            DeviceEvent::DownloadVideoData {
                serial_number,
                data,
            } => {
                self.pipeline.on_video_data(&serial_number, data);
                Route::Download
            }
            DeviceEvent::DownloadAudioData {
                serial_number,
                data,
            } => {
                self.pipeline.on_audio_data(&serial_number, data);
                Route::Download
            }
            DeviceEvent::DownloadFinished { serial_number } => {
                info!("Download finished for {}", serial_number);
                match self.pipeline.take_finished(&serial_number) {
                    Some(finished) => {
                        let pipeline = self.pipeline.clone();
                        tokio::spawn(async move {
                            let _ = pipeline.complete(finished).await;
                        });
                    }
                    None => self.pipeline.on_unknown_finish(&serial_number),
                }
                Route::Download
            }
            DeviceEvent::Other { .. } => Route::Ignored,
        }
    }

    /// Startup path: everything already on the device is marked seen and
    /// only the newest unseen recording is queued.
    fn discover(&self, records: &[RecordingRecord]) {
        let targets: Vec<&RecordingRecord> = records
            .iter()
            .filter(|r| r.device_sn == self.config.device_serial)
            .collect();
        if targets.is_empty() {
            info!("No recordings for {} in query result", self.config.device_serial);
            return;
        }

        let latest = RecordingRecord::most_recent(targets.iter().copied());
        let latest_is_new = latest.is_some_and(|r| !self.seen.contains(&r.storage_path));

        self.seen
            .extend(targets.iter().map(|r| r.storage_path.clone()));
        info!("Marked {} recording(s) as seen", targets.len());

        if let Some(latest) = latest.filter(|_| latest_is_new) {
            info!("Queueing most recent recording {}", latest.storage_path);
            self.pipeline.enqueue([DownloadJob::from(latest)]);
        }
    }

    fn spawn_poll(&self) {
        let poller = self.poller.clone();
        let pipeline = self.pipeline.clone();
        let seen = self.seen.clone();

        tokio::spawn(async move {
            let records = poller.poll_for_new_events(&seen).await;
            let jobs: Vec<DownloadJob> = records
                .into_iter()
                .filter(|r| seen.insert(r.storage_path.clone()))
                .map(DownloadJob::from)
                .collect();
            if !jobs.is_empty() {
                pipeline.enqueue(jobs);
            }
        });
    }

    fn start_handshake(&mut self) {
        self.abort_handshake();
        let task = run_handshake(
            self.config.clone(),
            self.correlator.clone(),
            self.poller.clone(),
            self.pipeline.clone(),
        );
        self.handshake = Some(tokio::spawn(task));
    }

    fn abort_handshake(&mut self) {
        if let Some(handle) = self.handshake.take() {
            handle.abort();
        }
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }
}

/// Replay the protocol handshake on a fresh connection, then send the
/// startup query and resume queued downloads.
async fn run_handshake(
    config: DispatcherConfig,
    correlator: Arc<Correlator>,
    poller: Arc<QueryPoller>,
    pipeline: Arc<DownloadPipeline>,
) {
    let steps = [
        (
            commands::SET_API_SCHEMA,
            json!({ "schemaVersion": config.schema_version }),
        ),
        (commands::START_LISTENING, json!({})),
    ];

    for (command, params) in steps {
        match correlator.request(command, params, config.request_timeout).await {
            Ok(reply) if reply.success => info!("{} ok", command),
            Ok(reply) => warn!("{} rejected: {}", command, reply.error_text()),
            Err(e) if e.is_timeout() => warn!("{}", e),
            Err(e) => {
                warn!("Handshake aborted at {}: {}", command, e);
                return;
            }
        }
    }

    let deadline = tokio::time::Instant::now() + config.connect_timeout;
    info!("Connecting driver");
    match correlator
        .request(commands::DRIVER_CONNECT, json!({}), config.connect_timeout)
        .await
    {
        Ok(reply) if reply.success => info!("Driver connected"),
        Ok(reply) => {
            warn!(
                "driver.connect rejected: {}; querying at connect deadline",
                reply.error_text()
            );
            tokio::time::sleep_until(deadline).await;
        }
        Err(RequestError::Timeout { .. }) => {
            warn!("driver.connect timed out; querying anyway");
        }
        Err(e) => {
            warn!("Handshake aborted at driver.connect: {}", e);
            return;
        }
    }

    info!("Sending startup query");
    poller.fire_query();
    pipeline.process_queue();
}
