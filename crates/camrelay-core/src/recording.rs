//! Recordings, download jobs and stream metadata.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Extension the station gives to stored recordings.
const RECORDING_EXTENSION: &str = ".zxvideo";

/// One row of a `database query by date` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingRecord {
    pub device_sn: String,

    /// Storage path on the station; doubles as the recording identifier.
    pub storage_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
}

impl RecordingRecord {
    /// Start time as a sortable timestamp, if it parses.
    pub fn started_at(&self) -> Option<NaiveDateTime> {
        self.start_time.as_deref().and_then(parse_timestamp)
    }

    /// Pick the most recent record, ordering by parsed start time and
    /// falling back to the raw string.
    pub fn most_recent<'a, I>(records: I) -> Option<&'a RecordingRecord>
    where
        I: IntoIterator<Item = &'a RecordingRecord>,
    {
        records.into_iter().max_by(|a, b| {
            a.started_at()
                .cmp(&b.started_at())
                .then_with(|| a.start_time.cmp(&b.start_time))
        })
    }
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y%m%d%H%M%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

/// Video elementary stream codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    #[default]
    Hevc,
}

impl VideoCodec {
    /// Interpret the vendor's codec field, which is a name or a numeric code.
    pub fn from_value(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => match s.to_ascii_lowercase().as_str() {
                "h264" | "avc" => Some(Self::H264),
                "h265" | "hevc" => Some(Self::Hevc),
                _ => None,
            },
            JsonValue::Number(n) => match n.as_u64() {
                Some(0) => Some(Self::H264),
                Some(1) => Some(Self::Hevc),
                _ => None,
            },
            _ => None,
        }
    }

    /// Demuxer name for the raw stream.
    pub fn format_name(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
        }
    }
}

/// Stream parameters announced by the `download started` event.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<VideoCodec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_fps: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_height: Option<u32>,
}

impl StreamMetadata {
    pub const DEFAULT_FPS: u32 = 15;

    pub fn codec(&self) -> VideoCodec {
        self.video_codec.unwrap_or_default()
    }

    pub fn fps(&self) -> u32 {
        self.video_fps.filter(|fps| *fps > 0).unwrap_or(Self::DEFAULT_FPS)
    }
}

/// A recording waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJob {
    pub device_id: String,
    pub recording_path: String,
    pub cipher_id: Option<i64>,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    /// File stem used for staged raw streams and the muxed artifact.
    pub output_name: String,
}

impl DownloadJob {
    pub fn output_name_for(recording_path: &str) -> String {
        let file = recording_path
            .rsplit('/')
            .next()
            .unwrap_or(recording_path);
        let stem = file.strip_suffix(RECORDING_EXTENSION).unwrap_or(file);
        if stem.is_empty() {
            "recording".to_string()
        } else {
            stem.to_string()
        }
    }
}

impl From<&RecordingRecord> for DownloadJob {
    fn from(record: &RecordingRecord) -> Self {
        Self {
            device_id: record.device_sn.clone(),
            recording_path: record.storage_path.clone(),
            cipher_id: record.cipher_id,
            window_start: record.start_time.clone(),
            window_end: record.end_time.clone(),
            output_name: DownloadJob::output_name_for(&record.storage_path),
        }
    }
}

impl From<RecordingRecord> for DownloadJob {
    fn from(record: RecordingRecord) -> Self {
        Self::from(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(path: &str, start: &str) -> RecordingRecord {
        RecordingRecord {
            device_sn: "T8200".to_string(),
            storage_path: path.to_string(),
            cipher_id: Some(7),
            start_time: Some(start.to_string()),
            end_time: None,
        }
    }

    #[test]
    fn test_output_name_strips_extension() {
        assert_eq!(
            DownloadJob::output_name_for("/media/mmcblk0p1/Camera00/20240101120000.zxvideo"),
            "20240101120000"
        );
        assert_eq!(DownloadJob::output_name_for("clip.mp4"), "clip.mp4");
        assert_eq!(DownloadJob::output_name_for("/a/b/"), "recording");
    }

    #[test]
    fn test_most_recent_by_start_time() {
        let records = vec![
            record("/a.zxvideo", "2024-01-01 09:00:00"),
            record("/b.zxvideo", "2024-01-01 18:30:00"),
            record("/c.zxvideo", "2024-01-01 12:15:00"),
        ];
        let latest = RecordingRecord::most_recent(&records).unwrap();
        assert_eq!(latest.storage_path, "/b.zxvideo");
    }

    #[test]
    fn test_job_from_record() {
        let job = DownloadJob::from(&record("/x/20240101.zxvideo", "2024-01-01 09:00:00"));
        assert_eq!(job.device_id, "T8200");
        assert_eq!(job.cipher_id, Some(7));
        assert_eq!(job.output_name, "20240101");
        assert_eq!(job.window_start.as_deref(), Some("2024-01-01 09:00:00"));
    }

    #[test]
    fn test_codec_from_value() {
        assert_eq!(VideoCodec::from_value(&json!("h264")), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::from_value(&json!("H265")), Some(VideoCodec::Hevc));
        assert_eq!(VideoCodec::from_value(&json!(0)), Some(VideoCodec::H264));
        assert_eq!(VideoCodec::from_value(&json!("vp9")), None);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = StreamMetadata::default();
        assert_eq!(meta.codec(), VideoCodec::Hevc);
        assert_eq!(meta.fps(), 15);

        let meta = StreamMetadata {
            video_fps: Some(0),
            ..Default::default()
        };
        assert_eq!(meta.fps(), 15);
    }
}
