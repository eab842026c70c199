//! Core types for the camera event relay.
//!
//! Provides:
//! - Bridge configuration loaded from the environment
//! - The device-control wire protocol (command names, inbound message model)
//! - Recording records, download jobs and stream metadata
//! - The process-lifetime set of delivered recordings

pub mod config;
pub mod protocol;
pub mod recording;
pub mod seen;

// Re-exports
pub use config::{BridgeConfig, ConfigError};

pub use protocol::{
    CommandReply, DetectionKind, DeviceEvent, InboundMessage, commands, events, message_id,
    parse_message, parse_reply,
};

pub use recording::{DownloadJob, RecordingRecord, StreamMetadata, VideoCodec};

pub use seen::SeenSet;
