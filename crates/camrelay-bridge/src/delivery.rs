//! Webhook delivery of finished recordings.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use camrelay_core::config::WebhookConfig;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook returned error: {status}")]
    Status { status: u16, body: String },
}

/// A muxed recording ready to leave the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub device_id: String,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub filename: String,
    pub mime_type: String,
    pub artifact: Vec<u8>,
}

/// What the sink answered.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub body: String,
}

/// Downstream consumer of recordings.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryReceipt, DeliveryError>;
}

/// JSON body posted to the webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub received_at: String,
    pub device_id: String,
    pub station_serial_number: String,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
    pub media: WebhookMedia,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMedia {
    pub mime_type: String,
    pub base64: String,
    pub filename: String,
}

impl WebhookEnvelope {
    pub fn new(delivery: &Delivery, station_serial: &str, received_at: DateTime<Utc>) -> Self {
        Self {
            received_at: received_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            device_id: delivery.device_id.clone(),
            station_serial_number: station_serial.to_string(),
            window_start: delivery.window_start.clone(),
            window_end: delivery.window_end.clone(),
            media: WebhookMedia {
                mime_type: delivery.mime_type.clone(),
                base64: BASE64.encode(&delivery.artifact),
                filename: delivery.filename.clone(),
            },
        }
    }
}

/// HTTP POST sink. One attempt per recording, no retry.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    config: WebhookConfig,
    station_serial: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig, station_serial: impl Into<String>) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            config,
            station_serial: station_serial.into(),
            client,
        })
    }
}

#[async_trait]
impl DeliverySink for WebhookSink {
    async fn deliver(&self, delivery: &Delivery) -> Result<DeliveryReceipt, DeliveryError> {
        let envelope = WebhookEnvelope::new(delivery, &self.station_serial, Utc::now());

        let mut request = self.client.post(&self.config.url).json(&envelope);
        if let Some((user, password)) = self.config.basic_auth() {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!("Sent {} to webhook ({})", delivery.filename, status);
        Ok(DeliveryReceipt {
            status: status.as_u16(),
            body,
        })
    }
}
