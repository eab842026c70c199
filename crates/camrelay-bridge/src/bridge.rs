//! Wiring of the relay components.

use std::sync::Arc;

use camrelay_core::{BridgeConfig, SeenSet};
use thiserror::Error;
use tracing::{error, info};

use crate::captcha::{self, CaptchaChannel};
use crate::correlator::Correlator;
use crate::delivery::{DeliveryError, WebhookSink};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::mux::FfmpegMuxer;
use crate::pipeline::DownloadPipeline;
use crate::poller::{PollerConfig, QueryPoller};
use crate::transport::{Backoff, Transport};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Webhook client setup failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Output directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the relay until the transport shuts down.
pub async fn run_bridge(config: BridgeConfig) -> Result<(), BridgeError> {
    tokio::fs::create_dir_all(&config.output_dir).await?;

    info!("Service: {}", config.ws_url);
    info!(
        "Station: {}, device: {}",
        config.station_serial, config.device_serial
    );
    info!("Webhook: {}", config.webhook.url);
    info!("Output: {}", config.output_dir.display());

    let backoff = Backoff::new(config.reconnect_floor(), config.reconnect_ceiling());
    let (transport, handle, events) = Transport::new(config.ws_url.clone(), backoff);

    let correlator = Arc::new(Correlator::new(Arc::new(handle)));
    let poller = Arc::new(QueryPoller::new(
        correlator.clone(),
        PollerConfig::from(&config),
    ));
    let muxer = Arc::new(FfmpegMuxer::new(
        config.ffmpeg_path.clone(),
        config.mux_timeout(),
    ));
    let sink = Arc::new(WebhookSink::new(
        config.webhook.clone(),
        config.station_serial.clone(),
    )?);
    let pipeline = Arc::new(DownloadPipeline::new(
        correlator.clone(),
        muxer,
        sink,
        config.output_dir.clone(),
    ));
    let captcha_channel = Arc::new(CaptchaChannel::new(
        correlator.clone(),
        config.captcha_port,
    ));

    let dispatcher = Dispatcher::new(
        DispatcherConfig::from(&config),
        correlator,
        poller,
        pipeline,
        captcha_channel.clone(),
        SeenSet::new(),
    );

    let port = config.captcha_port;
    let captcha_server = tokio::spawn(async move {
        if let Err(e) = captcha::serve(captcha_channel, port).await {
            error!("Captcha server on port {} stopped: {}", port, e);
        }
    });
    let transport_task = tokio::spawn(transport.run());

    dispatcher.run(events).await;

    captcha_server.abort();
    transport_task.abort();
    Ok(())
}
