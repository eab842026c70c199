//! Muxing raw elementary streams into an MP4 container.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camrelay_core::VideoCodec;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Longest stderr excerpt carried in a failure.
const STDERR_TAIL: usize = 2048;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Failed to start muxer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Muxer exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Muxer did not finish within {0:?}")]
    Timeout(Duration),
}

/// Inputs and output of one mux run.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub video_path: PathBuf,
    pub audio_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub codec: VideoCodec,
    pub fps: u32,
}

/// Combines a raw video stream (and optional raw AAC audio) into one file.
#[async_trait]
pub trait Muxer: Send + Sync {
    async fn mux(&self, request: &MuxRequest) -> Result<(), MuxError>;
}

/// Muxer backed by the `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    program: String,
    timeout: Duration,
}

impl FfmpegMuxer {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Command-line arguments for a request. Streams are copied, not
    /// re-encoded.
    pub fn args(request: &MuxRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            request.codec.format_name().into(),
            "-framerate".into(),
            request.fps.to_string(),
            "-i".into(),
            request.video_path.display().to_string(),
        ];

        match &request.audio_path {
            Some(audio) => {
                args.extend([
                    "-f".into(),
                    "aac".into(),
                    "-i".into(),
                    audio.display().to_string(),
                    "-c:v".into(),
                    "copy".into(),
                    "-c:a".into(),
                    "copy".into(),
                ]);
            }
            None => {
                args.extend(["-c".to_string(), "copy".to_string()]);
            }
        }

        args.extend([
            "-movflags".into(),
            "+faststart".into(),
            request.output_path.display().to_string(),
        ]);
        args
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn mux(&self, request: &MuxRequest) -> Result<(), MuxError> {
        let args = Self::args(request);
        info!("Running: {} {}", self.program, args.join(" "));

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(MuxError::Spawn)?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| MuxError::Timeout(self.timeout))?
            .map_err(MuxError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let start = (start..stderr.len())
                .find(|i| stderr.is_char_boundary(*i))
                .unwrap_or(stderr.len());
            return Err(MuxError::Failed {
                status: output.status.to_string(),
                stderr: stderr[start..].trim().to_string(),
            });
        }

        info!("Converted to {}", request.output_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(audio: bool) -> MuxRequest {
        MuxRequest {
            video_path: PathBuf::from("/tmp/clip.video.raw"),
            audio_path: audio.then(|| PathBuf::from("/tmp/clip.audio.raw")),
            output_path: PathBuf::from("/tmp/clip.mp4"),
            codec: VideoCodec::H264,
            fps: 25,
        }
    }

    #[test]
    fn test_args_video_only() {
        let args = FfmpegMuxer::args(&request(false));
        let line = args.join(" ");

        assert!(line.contains("-f h264 -framerate 25 -i /tmp/clip.video.raw"));
        assert!(line.contains("-c copy"));
        assert!(!line.contains("aac"));
        assert_eq!(args.last().unwrap(), "/tmp/clip.mp4");
    }

    #[test]
    fn test_args_with_audio() {
        let args = FfmpegMuxer::args(&request(true));
        let line = args.join(" ");

        assert!(line.contains("-f aac -i /tmp/clip.audio.raw"));
        assert!(line.contains("-c:v copy -c:a copy"));
        assert!(line.contains("-movflags +faststart"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let muxer = FfmpegMuxer::new("/nonexistent/ffmpeg-binary", Duration::from_secs(5));
        let result = muxer.mux(&request(false)).await;
        assert!(matches!(result, Err(MuxError::Spawn(_))));
    }
}
