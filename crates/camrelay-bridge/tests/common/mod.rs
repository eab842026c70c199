//! Fakes shared by the bridge integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use camrelay_bridge::{
    CommandSender, Delivery, DeliveryError, DeliveryReceipt, DeliverySink, FrameSink, MuxError,
    MuxRequest, Muxer, RequestError, TransportError,
};
use camrelay_core::{DownloadJob, RecordingRecord};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

/// Command sender that records every command and announces it on a channel.
pub struct RecordingSender {
    pub sent: Mutex<Vec<(String, JsonValue)>>,
    notify: mpsc::UnboundedSender<String>,
    fail: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let sender = Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            notify,
            fail: AtomicBool::new(false),
        });
        (sender, rx)
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(c, _)| c.clone()).collect()
    }

    /// `path` params of every start-download sent so far.
    pub fn started_paths(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| c == "device.start_download")
            .filter_map(|(_, p)| p["path"].as_str().map(str::to_string))
            .collect()
    }
}

impl CommandSender for RecordingSender {
    fn send(&self, command: &str, params: JsonValue) -> Result<String, RequestError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RequestError::Send(TransportError::NotConnected));
        }
        let id = {
            let mut sent = self.sent.lock();
            sent.push((command.to_string(), params));
            sent.len().to_string()
        };
        let _ = self.notify.send(command.to_string());
        Ok(id)
    }
}

/// Frame sink standing in for an open connection.
pub struct MemorySink {
    pub frames: Mutex<Vec<JsonValue>>,
    notify: mpsc::UnboundedSender<JsonValue>,
}

impl MemorySink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<JsonValue>) {
        let (notify, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            notify,
        });
        (sink, rx)
    }

    pub fn commands(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| f["command"].as_str().map(str::to_string))
            .collect()
    }
}

impl FrameSink for MemorySink {
    fn send_frame(&self, frame: JsonValue) -> Result<(), TransportError> {
        self.frames.lock().push(frame.clone());
        let _ = self.notify.send(frame);
        Ok(())
    }
}

/// What the muxer found on disk when it ran.
#[derive(Debug, Clone)]
pub struct MuxCall {
    pub request: MuxRequest,
    pub video: Vec<u8>,
    pub audio: Option<Vec<u8>>,
}

/// Muxer that snapshots its inputs and writes a placeholder container.
#[derive(Default)]
pub struct FakeMuxer {
    pub calls: Mutex<Vec<MuxCall>>,
    fail: AtomicBool,
}

impl FakeMuxer {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Muxer for FakeMuxer {
    async fn mux(&self, request: &MuxRequest) -> Result<(), MuxError> {
        let video = std::fs::read(&request.video_path).map_err(MuxError::Spawn)?;
        let audio = match &request.audio_path {
            Some(path) => Some(std::fs::read(path).map_err(MuxError::Spawn)?),
            None => None,
        };
        self.calls.lock().push(MuxCall {
            request: request.clone(),
            video: video.clone(),
            audio,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(MuxError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "Invalid data found when processing input".to_string(),
            });
        }

        let mut artifact = b"mp4:".to_vec();
        artifact.extend_from_slice(&video);
        std::fs::write(&request.output_path, artifact).map_err(MuxError::Spawn)?;
        Ok(())
    }
}

/// Delivery sink that keeps every delivery in memory.
#[derive(Default)]
pub struct FakeSink {
    pub deliveries: Mutex<Vec<Delivery>>,
    fail: AtomicBool,
}

impl FakeSink {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeliverySink for FakeSink {
    async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryReceipt, DeliveryError> {
        self.deliveries.lock().push(delivery.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeliveryError::Status {
                status: 500,
                body: "workflow error".to_string(),
            });
        }
        Ok(DeliveryReceipt {
            status: 200,
            body: "{}".to_string(),
        })
    }
}

pub fn record(device: &str, path: &str, start: &str) -> RecordingRecord {
    RecordingRecord {
        device_sn: device.to_string(),
        storage_path: path.to_string(),
        cipher_id: Some(1),
        start_time: Some(start.to_string()),
        end_time: None,
    }
}

pub fn job(device: &str, path: &str) -> DownloadJob {
    DownloadJob::from(record(device, path, "2024-01-01 12:00:00"))
}
