//! Request/reply correlation over the push channel.
//!
//! Every outgoing command gets a fresh `messageId`. [`Correlator::request`]
//! parks a waiter under that id until the matching reply arrives, the timeout
//! fires, or the connection drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use camrelay_core::CommandReply;
use camrelay_core::protocol::command_frame;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::transport::{FrameSink, TransportError};

/// Errors surfaced to callers of [`Correlator::request`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Timed out after {timeout:?} waiting for {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("Connection lost before a reply arrived")]
    ConnectionLost,

    #[error("Send failed: {0}")]
    Send(#[from] TransportError),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Fire-and-forget command submission.
pub trait CommandSender: Send + Sync {
    /// Send a command and return the message id it was tagged with.
    fn send(&self, command: &str, params: JsonValue) -> Result<String, RequestError>;
}

/// A request waiting for its reply.
struct PendingRequest {
    command: String,
    issued_at: Instant,
    resolver: oneshot::Sender<Result<CommandReply, RequestError>>,
}

/// Outstanding-request table keyed by message id.
pub struct Correlator {
    sink: Arc<dyn FrameSink>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

/// Drops the pending entry if the request future goes away early.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.pending.lock().remove(&self.id);
    }
}

impl Correlator {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn allocate_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Send a command and wait for its reply.
    ///
    /// A reply with `success: false` is still `Ok`; the caller inspects it.
    pub async fn request(
        &self,
        command: &str,
        params: JsonValue,
        timeout: Duration,
    ) -> Result<CommandReply, RequestError> {
        let id = self.allocate_id();
        let (resolver, waiter) = oneshot::channel();

        self.pending.lock().insert(
            id.clone(),
            PendingRequest {
                command: command.to_string(),
                issued_at: Instant::now(),
                resolver,
            },
        );
        let _guard = PendingGuard {
            correlator: self,
            id: id.clone(),
        };

        debug!(">>> {} (messageId={})", command, id);
        self.sink.send_frame(command_frame(&id, command, params))?;

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                warn!("No reply to {} (messageId={}) within {:?}", command, id, timeout);
                Err(RequestError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Hand a reply to its waiter. Returns `false` when no request with that
    /// id is pending (unknown, or already timed out).
    pub fn resolve(&self, reply: CommandReply) -> bool {
        let Some(id) = reply.message_id.as_deref() else {
            return false;
        };
        let Some(pending) = self.pending.lock().remove(id) else {
            return false;
        };

        debug!(
            "<<< {} (messageId={}) after {:?}",
            pending.command,
            id,
            pending.issued_at.elapsed()
        );
        let _ = pending.resolver.send(Ok(reply));
        true
    }

    /// Fail every outstanding request with [`RequestError::ConnectionLost`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            debug!("Failing {} (messageId={}): connection lost", pending.command, id);
            let _ = pending.resolver.send(Err(RequestError::ConnectionLost));
        }
        count
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl CommandSender for Correlator {
    fn send(&self, command: &str, params: JsonValue) -> Result<String, RequestError> {
        let id = self.allocate_id();
        debug!(">>> {} (messageId={}, no reply expected)", command, id);
        self.sink.send_frame(command_frame(&id, command, params))?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Sink that records frames in memory.
    #[derive(Default)]
    struct MemorySink {
        frames: Mutex<Vec<JsonValue>>,
    }

    impl FrameSink for MemorySink {
        fn send_frame(&self, frame: JsonValue) -> Result<(), TransportError> {
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    struct DeadSink;

    impl FrameSink for DeadSink {
        fn send_frame(&self, _frame: JsonValue) -> Result<(), TransportError> {
            Err(TransportError::NotConnected)
        }
    }

    fn reply(id: &str, success: bool) -> CommandReply {
        CommandReply {
            message_id: Some(id.to_string()),
            success,
            result: None,
            error: None,
        }
    }

    #[test]
    fn test_send_assigns_unique_ids() {
        let sink = Arc::new(MemorySink::default());
        let correlator = Correlator::new(sink.clone());

        let a = correlator.send("start_listening", json!({})).unwrap();
        let b = correlator.send("start_listening", json!({})).unwrap();
        assert_ne!(a, b);

        let frames = sink.frames.lock();
        assert_eq!(frames[0]["messageId"], a.as_str());
        assert_eq!(frames[1]["messageId"], b.as_str());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_resolves_on_reply() {
        let sink = Arc::new(MemorySink::default());
        let correlator = Arc::new(Correlator::new(sink.clone()));

        let task = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .request("driver.connect", json!({}), Duration::from_secs(5))
                    .await
            })
        };

        while correlator.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let id = sink.frames.lock()[0]["messageId"].as_str().unwrap().to_string();
        assert!(correlator.resolve(reply(&id, true)));

        let result = task.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_and_late_reply_dropped() {
        let sink = Arc::new(MemorySink::default());
        let correlator = Correlator::new(sink.clone());

        let result = correlator
            .request("set_api_schema", json!({"schemaVersion": 21}), Duration::from_secs(2))
            .await;
        assert!(result.as_ref().unwrap_err().is_timeout());
        assert_eq!(correlator.pending_count(), 0);

        let id = sink.frames.lock()[0]["messageId"].as_str().unwrap().to_string();
        assert!(!correlator.resolve(reply(&id, true)));
    }

    #[tokio::test]
    async fn test_send_failure_clears_pending() {
        let correlator = Correlator::new(Arc::new(DeadSink));

        let result = correlator
            .request("driver.connect", json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(
            result,
            Err(RequestError::Send(TransportError::NotConnected))
        ));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_resolve_unknown_id() {
        let correlator = Correlator::new(Arc::new(MemorySink::default()));
        assert!(!correlator.resolve(reply("99", true)));
        assert!(!correlator.resolve(CommandReply {
            message_id: None,
            success: true,
            result: None,
            error: None,
        }));
    }
}
