//! Device-control wire protocol.
//!
//! Outgoing commands are `{messageId, command, ...params}`. Incoming traffic
//! is either a command reply `{type: "result", messageId, success, ...}` or a
//! broadcast `{type: "event", event: {event, serialNumber?, ...}}`.
//!
//! [`parse_message`] is the only place that probes the loosely-typed vendor
//! payloads; everything downstream works on [`InboundMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::recording::{RecordingRecord, StreamMetadata, VideoCodec};

/// Command names sent to the service.
pub mod commands {
    pub const SET_API_SCHEMA: &str = "set_api_schema";
    pub const START_LISTENING: &str = "start_listening";
    pub const DRIVER_CONNECT: &str = "driver.connect";
    pub const DATABASE_QUERY_BY_DATE: &str = "station.database_query_by_date";
    pub const START_DOWNLOAD: &str = "device.start_download";
    pub const SET_CAPTCHA: &str = "driver.set_captcha";
}

/// Event names broadcast by the service.
pub mod events {
    pub const CAPTCHA_REQUEST: &str = "captcha request";
    pub const DATABASE_QUERY_BY_DATE: &str = "database query by date";
    pub const MOTION_DETECTED: &str = "motion detected";
    pub const PERSON_DETECTED: &str = "person detected";
    pub const RINGS: &str = "rings";
    pub const DOWNLOAD_STARTED: &str = "download started";
    pub const DOWNLOAD_VIDEO_DATA: &str = "download video data";
    pub const DOWNLOAD_AUDIO_DATA: &str = "download audio data";
    pub const DOWNLOAD_FINISHED: &str = "download finished";
}

/// Build an outgoing command frame.
pub fn command_frame(message_id: &str, command: &str, params: JsonValue) -> JsonValue {
    let mut frame = Map::new();
    frame.insert("messageId".to_string(), JsonValue::String(message_id.to_string()));
    frame.insert("command".to_string(), JsonValue::String(command.to_string()));
    if let JsonValue::Object(params) = params {
        for (key, value) in params {
            if key != "messageId" && key != "command" {
                frame.insert(key, value);
            }
        }
    }
    JsonValue::Object(frame)
}

/// Reply to a previously sent command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub message_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonValue>,
}

impl CommandReply {
    /// Human-readable failure reason.
    pub fn error_text(&self) -> String {
        match &self.error {
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        }
    }
}

/// Detection triggers that start a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionKind {
    Motion,
    Person,
    Ring,
}

impl DetectionKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Motion => "Motion detected",
            Self::Person => "Person detected",
            Self::Ring => "Doorbell ring",
        }
    }
}

/// Normalized broadcast event.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    CaptchaRequest {
        captcha_id: Option<String>,
        /// Base64 image, with or without a data-URI prefix.
        captcha: Option<String>,
    },
    DatabaseQueryResult {
        records: Vec<RecordingRecord>,
    },
    Detection {
        kind: DetectionKind,
        serial_number: Option<String>,
        state: Option<JsonValue>,
    },
    DownloadStarted {
        serial_number: String,
        metadata: StreamMetadata,
    },
    DownloadVideoData {
        serial_number: String,
        data: Vec<u8>,
    },
    DownloadAudioData {
        serial_number: String,
        data: Vec<u8>,
    },
    DownloadFinished {
        serial_number: String,
    },
    /// Any event the bridge does not act on.
    Other {
        name: String,
        serial_number: Option<String>,
    },
}

impl DeviceEvent {
    /// Chunk events are too frequent to log individually.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::DownloadVideoData { .. } | Self::DownloadAudioData { .. }
        )
    }

    pub fn serial_number(&self) -> Option<&str> {
        match self {
            Self::Detection { serial_number, .. } | Self::Other { serial_number, .. } => {
                serial_number.as_deref()
            }
            Self::DownloadStarted { serial_number, .. }
            | Self::DownloadVideoData { serial_number, .. }
            | Self::DownloadAudioData { serial_number, .. }
            | Self::DownloadFinished { serial_number } => Some(serial_number),
            Self::CaptchaRequest { .. } | Self::DatabaseQueryResult { .. } => None,
        }
    }
}

/// Classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Reply(CommandReply),
    Event(DeviceEvent),
    /// Server greetings and other frames with no routing meaning.
    Other { message_type: String },
}

/// Classify a raw JSON frame.
pub fn parse_message(json: &JsonValue) -> InboundMessage {
    let message_type = json.get("type").and_then(JsonValue::as_str).unwrap_or("");

    match message_type {
        "result" => InboundMessage::Reply(parse_reply(json)),
        "event" => match json.get("event") {
            Some(event) => InboundMessage::Event(parse_event(event)),
            None => InboundMessage::Other {
                message_type: message_type.to_string(),
            },
        },
        _ if json.get("success").is_some_and(JsonValue::is_boolean) => {
            InboundMessage::Reply(parse_reply(json))
        }
        other => InboundMessage::Other {
            message_type: other.to_string(),
        },
    }
}

/// Correlation id of a frame, accepting string or numeric ids.
pub fn message_id(json: &JsonValue) -> Option<String> {
    let raw = json.get("messageId").or_else(|| json.get("id"))?;
    match raw {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read any frame as a command reply. A frame without a `success` flag
/// counts as successful unless it carries an error.
pub fn parse_reply(json: &JsonValue) -> CommandReply {
    let error = json
        .get("errorCode")
        .or_else(|| json.get("error"))
        .filter(|v| !v.is_null())
        .cloned();

    CommandReply {
        message_id: message_id(json),
        success: json
            .get("success")
            .and_then(JsonValue::as_bool)
            .unwrap_or(error.is_none()),
        result: json.get("result").filter(|v| !v.is_null()).cloned(),
        error,
    }
}

fn parse_event(event: &JsonValue) -> DeviceEvent {
    let name = str_field(event, "event").unwrap_or_default();
    let serial_number = str_field(event, "serialNumber");

    match name.as_str() {
        events::CAPTCHA_REQUEST => DeviceEvent::CaptchaRequest {
            captcha_id: str_field(event, "captchaId"),
            captcha: str_field(event, "captcha"),
        },
        events::DATABASE_QUERY_BY_DATE => DeviceEvent::DatabaseQueryResult {
            records: parse_records(event.get("data")),
        },
        events::MOTION_DETECTED => detection(DetectionKind::Motion, serial_number, event),
        events::PERSON_DETECTED => detection(DetectionKind::Person, serial_number, event),
        events::RINGS => detection(DetectionKind::Ring, serial_number, event),
        events::DOWNLOAD_STARTED => match serial_number {
            Some(serial_number) => DeviceEvent::DownloadStarted {
                serial_number,
                metadata: parse_metadata(event.get("metadata")),
            },
            None => DeviceEvent::Other {
                name,
                serial_number: None,
            },
        },
        events::DOWNLOAD_VIDEO_DATA | events::DOWNLOAD_AUDIO_DATA => {
            match (serial_number, buffer_bytes(event.get("buffer"))) {
                (Some(serial_number), Some(data)) if name == events::DOWNLOAD_VIDEO_DATA => {
                    DeviceEvent::DownloadVideoData {
                        serial_number,
                        data,
                    }
                }
                (Some(serial_number), Some(data)) => DeviceEvent::DownloadAudioData {
                    serial_number,
                    data,
                },
                (serial_number, _) => DeviceEvent::Other {
                    name,
                    serial_number,
                },
            }
        }
        events::DOWNLOAD_FINISHED => match serial_number {
            Some(serial_number) => DeviceEvent::DownloadFinished { serial_number },
            None => DeviceEvent::Other {
                name,
                serial_number: None,
            },
        },
        _ => DeviceEvent::Other {
            name,
            serial_number,
        },
    }
}

fn detection(kind: DetectionKind, serial_number: Option<String>, event: &JsonValue) -> DeviceEvent {
    DeviceEvent::Detection {
        kind,
        serial_number,
        state: event.get("state").cloned(),
    }
}

fn str_field(json: &JsonValue, key: &str) -> Option<String> {
    json.get(key).and_then(JsonValue::as_str).map(str::to_string)
}

fn parse_records(data: Option<&JsonValue>) -> Vec<RecordingRecord> {
    let Some(JsonValue::Array(rows)) = data else {
        return Vec::new();
    };

    rows.iter()
        .filter_map(|row| match serde_json::from_value::<RecordingRecord>(row.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!("Skipping malformed recording row: {}", e);
                None
            }
        })
        .collect()
}

fn parse_metadata(metadata: Option<&JsonValue>) -> StreamMetadata {
    let Some(metadata) = metadata.filter(|m| m.is_object()) else {
        return StreamMetadata::default();
    };

    let dimension = |key: &str| {
        metadata
            .get(key)
            .and_then(JsonValue::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    };

    StreamMetadata {
        video_codec: metadata.get("videoCodec").and_then(VideoCodec::from_value),
        video_fps: dimension("videoFPS"),
        video_width: dimension("videoWidth"),
        video_height: dimension("videoHeight"),
    }
}

/// Decode a serialized Node buffer (`{type: "Buffer", data: [..]}`) or a bare
/// byte array.
fn buffer_bytes(buffer: Option<&JsonValue>) -> Option<Vec<u8>> {
    let array = match buffer? {
        JsonValue::Array(items) => items,
        JsonValue::Object(obj) => obj.get("data")?.as_array()?,
        _ => return None,
    };

    array
        .iter()
        .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_frame() {
        let frame = command_frame(
            "7",
            commands::START_DOWNLOAD,
            json!({"serialNumber": "T8200", "path": "/a.zxvideo"}),
        );
        assert_eq!(frame["messageId"], "7");
        assert_eq!(frame["command"], "device.start_download");
        assert_eq!(frame["serialNumber"], "T8200");

        let bare = command_frame("8", commands::START_LISTENING, JsonValue::Null);
        assert_eq!(bare.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_parse_reply() {
        let msg = parse_message(&json!({
            "type": "result",
            "messageId": "3",
            "success": false,
            "errorCode": "device_not_found"
        }));
        match msg {
            InboundMessage::Reply(reply) => {
                assert_eq!(reply.message_id.as_deref(), Some("3"));
                assert!(!reply.success);
                assert_eq!(reply.error_text(), "device_not_found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_reply_without_success_flag() {
        let reply = parse_reply(&json!({"messageId": "4", "result": {}}));
        assert_eq!(reply.message_id.as_deref(), Some("4"));
        assert!(reply.success);
        assert!(reply.result.is_some());

        let reply = parse_reply(&json!({"messageId": "5", "errorCode": "timeout"}));
        assert!(!reply.success);
        assert_eq!(reply.error_text(), "timeout");
    }

    #[test]
    fn test_parse_numeric_id() {
        assert_eq!(message_id(&json!({"id": 12})), Some("12".to_string()));
        assert_eq!(message_id(&json!({"type": "event"})), None);
    }

    #[test]
    fn test_parse_query_result_skips_bad_rows() {
        let msg = parse_message(&json!({
            "type": "event",
            "event": {
                "source": "station",
                "event": "database query by date",
                "data": [
                    {"device_sn": "T8200", "storage_path": "/a.zxvideo", "cipher_id": 1,
                     "start_time": "2024-01-01 10:00:00", "end_time": "2024-01-01 10:00:30"},
                    {"device_sn": "T8200"},
                ]
            }
        }));
        match msg {
            InboundMessage::Event(DeviceEvent::DatabaseQueryResult { records }) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].storage_path, "/a.zxvideo");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_video_chunk() {
        let msg = parse_message(&json!({
            "type": "event",
            "event": {
                "event": "download video data",
                "serialNumber": "T8200",
                "buffer": {"type": "Buffer", "data": [0, 0, 1, 255]}
            }
        }));
        assert_eq!(
            msg,
            InboundMessage::Event(DeviceEvent::DownloadVideoData {
                serial_number: "T8200".to_string(),
                data: vec![0, 0, 1, 255],
            })
        );
    }

    #[test]
    fn test_parse_chunk_without_buffer() {
        let msg = parse_message(&json!({
            "type": "event",
            "event": {"event": "download audio data", "serialNumber": "T8200"}
        }));
        assert!(matches!(
            msg,
            InboundMessage::Event(DeviceEvent::Other { .. })
        ));
    }

    #[test]
    fn test_parse_download_started_metadata() {
        let msg = parse_message(&json!({
            "type": "event",
            "event": {
                "event": "download started",
                "serialNumber": "T8200",
                "metadata": {"videoCodec": "h264", "videoFPS": 25, "videoWidth": 1600}
            }
        }));
        match msg {
            InboundMessage::Event(DeviceEvent::DownloadStarted { metadata, .. }) => {
                assert_eq!(metadata.codec(), VideoCodec::H264);
                assert_eq!(metadata.fps(), 25);
                assert_eq!(metadata.video_width, Some(1600));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_detection() {
        let msg = parse_message(&json!({
            "type": "event",
            "event": {"event": "rings", "serialNumber": "T8200", "state": true}
        }));
        match msg {
            InboundMessage::Event(DeviceEvent::Detection {
                kind,
                serial_number,
                ..
            }) => {
                assert_eq!(kind, DetectionKind::Ring);
                assert_eq!(serial_number.as_deref(), Some("T8200"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_other_frames() {
        let msg = parse_message(&json!({"type": "version", "serverVersion": "1.8.0"}));
        assert_eq!(
            msg,
            InboundMessage::Other {
                message_type: "version".to_string()
            }
        );
    }
}
