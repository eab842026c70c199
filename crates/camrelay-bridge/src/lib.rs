//! Camera event relay.
//!
//! Listens to a device-control service over WebSocket, discovers new
//! recordings after detections, downloads them one at a time, muxes the raw
//! streams into MP4 and posts each one to a webhook.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐  TransportEvent   ┌────────────┐
//! │ Transport │ ────────────────▶ │ Dispatcher │
//! └───────────┘                   └─────┬──────┘
//!       ▲                               │
//!       │ frames      ┌─────────────────┼─────────────────┐
//!       │             ▼                 ▼                 ▼
//! ┌────────────┐ ┌──────────┐   ┌──────────────┐   ┌──────────┐
//! │ Correlator │ │  Poller  │   │   Pipeline   │   │ Captcha  │
//! └────────────┘ └──────────┘   │ mux/delivery │   └──────────┘
//!                               └──────────────┘
//! ```

pub mod bridge;
pub mod captcha;
pub mod correlator;
pub mod delivery;
pub mod dispatcher;
pub mod mux;
pub mod pipeline;
pub mod poller;
pub mod transport;

pub use bridge::{BridgeError, run_bridge};
pub use captcha::{CaptchaChannel, PendingCaptcha};
pub use correlator::{CommandSender, Correlator, RequestError};
pub use delivery::{Delivery, DeliveryError, DeliveryReceipt, DeliverySink, WebhookSink};
pub use dispatcher::{Dispatcher, DispatcherConfig, Route};
pub use mux::{FfmpegMuxer, MuxError, MuxRequest, Muxer};
pub use pipeline::{DownloadPipeline, DownloadSession, FinishedDownload, PipelineError};
pub use poller::{PollerConfig, QueryPoller};
pub use transport::{Backoff, FrameSink, Transport, TransportError, TransportEvent, TransportHandle};
