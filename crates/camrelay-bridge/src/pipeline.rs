//! Serial download queue.
//!
//! The service allows one download at a time, so jobs wait in a FIFO queue
//! and the next `device.start_download` is only issued after the previous
//! job's finish has been fully handled.
//!
//! Lifecycle:
//!   enqueue(jobs)
//!     → process_queue()                    (device.start_download)
//!     → on_download_started()              (reset buffers, keep metadata)
//!     → on_video_data() / on_audio_data()  (collect chunks in arrival order)
//!     → on_download_finished()             (stage, mux, deliver, next)

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use camrelay_core::{DownloadJob, StreamMetadata, commands};
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::correlator::CommandSender;
use crate::delivery::{Delivery, DeliveryError, DeliveryReceipt, DeliverySink};
use crate::mux::{MuxError, MuxRequest, Muxer};

/// Log a progress line every this many chunks.
const PROGRESS_INTERVAL: usize = 200;

const ARTIFACT_MIME_TYPE: &str = "video/mp4";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No video data received")]
    EmptyRecording,

    #[error("Staging I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mux failed: {0}")]
    Mux(#[from] MuxError),

    #[error("Delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Chunks collected for the download in flight.
#[derive(Debug, Clone, Default)]
pub struct DownloadSession {
    pub device_id: String,
    pub video_chunks: Vec<Vec<u8>>,
    pub audio_chunks: Vec<Vec<u8>>,
    pub metadata: Option<StreamMetadata>,
}

impl DownloadSession {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn video_bytes(&self) -> Vec<u8> {
        self.video_chunks.concat()
    }

    pub fn audio_bytes(&self) -> Vec<u8> {
        self.audio_chunks.concat()
    }

    pub fn has_audio(&self) -> bool {
        !self.audio_chunks.is_empty()
    }

    fn chunk_count(&self) -> usize {
        self.video_chunks.len() + self.audio_chunks.len()
    }
}

#[derive(Debug)]
struct ActiveDownload {
    job: DownloadJob,
    session: DownloadSession,
    /// Id the start-download command went out with.
    start_message_id: Option<String>,
}

/// A download whose finish event has arrived, taken out of the pipeline and
/// waiting to be muxed and delivered.
#[derive(Debug)]
pub struct FinishedDownload {
    active: ActiveDownload,
}

impl FinishedDownload {
    pub fn recording_path(&self) -> &str {
        &self.active.job.recording_path
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    queue: VecDeque<DownloadJob>,
    /// Set from start-download until the finish handler has completed.
    busy: bool,
    /// Cleared when the finish handler takes the buffers.
    active: Option<ActiveDownload>,
}

/// Paths of the files staged for one job.
struct StagedFiles {
    video: PathBuf,
    audio: Option<PathBuf>,
    output: PathBuf,
}

impl StagedFiles {
    fn new(dir: &Path, name: &str, with_audio: bool) -> Self {
        Self {
            video: dir.join(format!("{name}.video.raw")),
            audio: with_audio.then(|| dir.join(format!("{name}.audio.raw"))),
            output: dir.join(format!("{name}.mp4")),
        }
    }

    async fn remove_raw(&self) {
        let _ = tokio::fs::remove_file(&self.video).await;
        if let Some(audio) = &self.audio {
            let _ = tokio::fs::remove_file(audio).await;
        }
    }
}

/// Releases the busy flag and starts the next job however finishing ends.
struct FinishGuard<'a> {
    pipeline: &'a DownloadPipeline,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.state.lock().busy = false;
        self.pipeline.process_queue();
    }
}

pub struct DownloadPipeline {
    sender: Arc<dyn CommandSender>,
    muxer: Arc<dyn Muxer>,
    sink: Arc<dyn DeliverySink>,
    staging_dir: PathBuf,
    state: Mutex<PipelineState>,
}

impl DownloadPipeline {
    pub fn new(
        sender: Arc<dyn CommandSender>,
        muxer: Arc<dyn Muxer>,
        sink: Arc<dyn DeliverySink>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sender,
            muxer,
            sink,
            staging_dir: staging_dir.into(),
            state: Mutex::new(PipelineState::default()),
        }
    }

    /// Append jobs and start one if nothing is in flight.
    pub fn enqueue<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = DownloadJob>,
    {
        {
            let mut state = self.state.lock();
            for job in jobs {
                info!("Queued download: {}", job.recording_path);
                state.queue.push_back(job);
            }
        }
        self.process_queue();
    }

    /// Start the head job if idle. No-op while a download is in flight.
    pub fn process_queue(&self) {
        let job = {
            let mut state = self.state.lock();
            if state.busy {
                return;
            }
            let Some(job) = state.queue.pop_front() else {
                return;
            };
            state.busy = true;
            state.active = Some(ActiveDownload {
                session: DownloadSession::new(&job.device_id),
                job: job.clone(),
                start_message_id: None,
            });
            job
        };

        info!("start_download: {}", job.recording_path);
        let params = json!({
            "serialNumber": job.device_id,
            "path": job.recording_path,
            "cipherId": job.cipher_id,
        });

        match self.sender.send(commands::START_DOWNLOAD, params) {
            Ok(message_id) => {
                let mut state = self.state.lock();
                if let Some(active) = state
                    .active
                    .as_mut()
                    .filter(|a| a.job.recording_path == job.recording_path)
                {
                    active.start_message_id = Some(message_id);
                }
            }
            Err(e) => {
                warn!(
                    "Could not start download of {}: {}; keeping it queued",
                    job.recording_path, e
                );
                let mut state = self.state.lock();
                state.active = None;
                state.busy = false;
                state.queue.push_front(job);
            }
        }
    }

    /// The service refused the start-download sent with `message_id`. The
    /// job is dropped and the next one started. Returns `false` when the id
    /// does not belong to the download in flight.
    pub fn on_start_rejected(&self, message_id: &str, reason: &str) -> bool {
        let rejected = {
            let mut state = self.state.lock();
            let owned = state
                .active
                .as_ref()
                .is_some_and(|a| a.start_message_id.as_deref() == Some(message_id));
            if !owned {
                return false;
            }
            state.busy = false;
            state.active.take()
        };

        if let Some(active) = rejected {
            error!(
                "start_download of {} rejected: {}; dropping it",
                active.job.recording_path, reason
            );
        }
        self.process_queue();
        true
    }

    /// Drop the in-flight download after its connection went away. The job
    /// is not retried.
    pub fn abandon_active(&self) -> Option<DownloadJob> {
        let mut state = self.state.lock();
        let active = state.active.take()?;
        state.busy = false;
        warn!(
            "Dropping download of {} ({} chunks received): connection lost",
            active.job.recording_path,
            active.session.chunk_count()
        );
        Some(active.job)
    }

    pub fn on_download_started(&self, device_id: &str, metadata: StreamMetadata) {
        let mut state = self.state.lock();
        match state.active.as_mut() {
            Some(active) if active.session.device_id == device_id => {
                info!("Download started for {}", device_id);
                active.session.video_chunks.clear();
                active.session.audio_chunks.clear();
                active.session.metadata = Some(metadata);
            }
            _ => debug!("Ignoring download start for {} without a session", device_id),
        }
    }

    pub fn on_video_data(&self, device_id: &str, data: Vec<u8>) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut().filter(|a| a.session.device_id == device_id) {
            active.session.video_chunks.push(data);
            log_progress(&active.session);
        }
    }

    pub fn on_audio_data(&self, device_id: &str, data: Vec<u8>) {
        let mut state = self.state.lock();
        if let Some(active) = state.active.as_mut().filter(|a| a.session.device_id == device_id) {
            active.session.audio_chunks.push(data);
            log_progress(&active.session);
        }
    }

    /// Take the buffers of the download that just finished on `device_id`.
    ///
    /// The pipeline stays busy until [`DownloadPipeline::complete`] runs, so
    /// a connection loss in between cannot discard the recording.
    pub fn take_finished(&self, device_id: &str) -> Option<FinishedDownload> {
        let mut state = self.state.lock();
        let owned = state
            .active
            .as_ref()
            .is_some_and(|a| a.session.device_id == device_id);
        if owned {
            state.active.take().map(|active| FinishedDownload { active })
        } else {
            None
        }
    }

    /// Mux and deliver the finished download, then advance the queue.
    ///
    /// Failures are logged and returned; the queue advances regardless.
    pub async fn on_download_finished(&self, device_id: &str) -> Result<(), PipelineError> {
        match self.take_finished(device_id) {
            Some(finished) => self.complete(finished).await,
            None => {
                self.on_unknown_finish(device_id);
                Ok(())
            }
        }
    }

    /// A finish event with no download in flight for that device.
    pub fn on_unknown_finish(&self, device_id: &str) {
        warn!("Download finished for unknown device {}", device_id);
        self.process_queue();
    }

    /// Second half of [`DownloadPipeline::on_download_finished`].
    pub async fn complete(&self, finished: FinishedDownload) -> Result<(), PipelineError> {
        let active = finished.active;
        let _guard = FinishGuard { pipeline: self };
        let path = active.job.recording_path.clone();

        match self.finalize(active).await {
            Ok(receipt) => {
                info!("Delivered {} (status {})", path, receipt.status);
                Ok(())
            }
            Err(e) => {
                error!("Failed to convert/send {}: {}", path, e);
                Err(e)
            }
        }
    }

    async fn finalize(&self, active: ActiveDownload) -> Result<DeliveryReceipt, PipelineError> {
        let ActiveDownload { job, session, .. } = active;

        if session.video_chunks.is_empty() {
            return Err(PipelineError::EmptyRecording);
        }

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = StagedFiles::new(&self.staging_dir, &job.output_name, session.has_audio());

        let result = self.mux_and_deliver(&job, &session, &staged).await;
        staged.remove_raw().await;
        result
    }

    async fn mux_and_deliver(
        &self,
        job: &DownloadJob,
        session: &DownloadSession,
        staged: &StagedFiles,
    ) -> Result<DeliveryReceipt, PipelineError> {
        let video = session.video_bytes();
        tokio::fs::write(&staged.video, &video).await?;
        info!(
            "Video: {} bytes ({} chunks) -> {}",
            video.len(),
            session.video_chunks.len(),
            staged.video.display()
        );

        if let Some(audio_path) = &staged.audio {
            let audio = session.audio_bytes();
            tokio::fs::write(audio_path, &audio).await?;
            info!(
                "Audio: {} bytes ({} chunks) -> {}",
                audio.len(),
                session.audio_chunks.len(),
                audio_path.display()
            );
        }

        let metadata = session.metadata.clone().unwrap_or_default();
        let request = MuxRequest {
            video_path: staged.video.clone(),
            audio_path: staged.audio.clone(),
            output_path: staged.output.clone(),
            codec: metadata.codec(),
            fps: metadata.fps(),
        };
        self.muxer.mux(&request).await?;

        let artifact = tokio::fs::read(&staged.output).await?;
        let delivery = Delivery {
            device_id: job.device_id.clone(),
            window_start: job.window_start.clone(),
            window_end: job.window_end.clone(),
            filename: format!("{}.mp4", job.output_name),
            mime_type: ARTIFACT_MIME_TYPE.to_string(),
            artifact,
        };

        Ok(self.sink.deliver(&delivery).await?)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Recording path of the download in flight.
    pub fn active_recording(&self) -> Option<String> {
        self.state
            .lock()
            .active
            .as_ref()
            .map(|a| a.job.recording_path.clone())
    }
}

fn log_progress(session: &DownloadSession) {
    if session.chunk_count() % PROGRESS_INTERVAL == 0 {
        debug!(
            "{}v / {}a chunks",
            session.video_chunks.len(),
            session.audio_chunks.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_concatenates_in_arrival_order() {
        let mut session = DownloadSession::new("T8200");
        session.video_chunks.push(b"v1".to_vec());
        session.audio_chunks.push(b"a1".to_vec());
        session.video_chunks.push(b"v2".to_vec());
        session.video_chunks.push(b"v3".to_vec());
        session.audio_chunks.push(b"a2".to_vec());

        assert_eq!(session.video_bytes(), b"v1v2v3");
        assert_eq!(session.audio_bytes(), b"a1a2");
        assert!(session.has_audio());
    }

    #[test]
    fn test_staged_file_names() {
        let staged = StagedFiles::new(Path::new("/out"), "20240101", false);
        assert_eq!(staged.video, PathBuf::from("/out/20240101.video.raw"));
        assert!(staged.audio.is_none());
        assert_eq!(staged.output, PathBuf::from("/out/20240101.mp4"));
    }
}
