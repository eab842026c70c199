//! Out-of-band captcha solving.
//!
//! The service occasionally asks for a captcha before the driver can log in.
//! The request is parked here until an operator submits a code through the
//! HTTP surface in [`server`].

pub mod server;

use std::sync::Arc;

use camrelay_core::commands;
use parking_lot::Mutex;
use serde_json::json;
use tracing::info;

use crate::correlator::{CommandSender, RequestError};

pub use server::{captcha_router, serve};

/// A captcha waiting for a solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCaptcha {
    pub id: Option<String>,
    /// Base64 image, possibly already a data URI.
    pub image: Option<String>,
}

impl PendingCaptcha {
    /// Image as something an `<img src>` accepts.
    pub fn image_src(&self) -> Option<String> {
        self.image.as_ref().map(|image| {
            if image.starts_with("data:") {
                image.clone()
            } else {
                format!("data:image/png;base64,{image}")
            }
        })
    }
}

pub struct CaptchaChannel {
    sender: Arc<dyn CommandSender>,
    port: u16,
    pending: Mutex<Option<PendingCaptcha>>,
}

impl CaptchaChannel {
    pub fn new(sender: Arc<dyn CommandSender>, port: u16) -> Self {
        Self {
            sender,
            port,
            pending: Mutex::new(None),
        }
    }

    pub fn on_captcha_request(&self, id: Option<String>, image: Option<String>) {
        info!("CAPTCHA REQUIRED");
        if let Some(id) = &id {
            info!("Captcha id: {}", id);
        }
        info!("Open http://localhost:{}/captcha to view & solve", self.port);

        *self.pending.lock() = Some(PendingCaptcha { id, image });
    }

    /// Forward a solution to the service and clear the pending captcha.
    pub fn solve(&self, code: &str) -> Result<(), RequestError> {
        let captcha_id = self.pending.lock().as_ref().and_then(|p| p.id.clone());
        info!("Sending captcha solution {} (id={:?})", code, captcha_id);

        self.sender.send(
            commands::SET_CAPTCHA,
            json!({
                "captchaId": captcha_id,
                "captcha": code,
            }),
        )?;

        *self.pending.lock() = None;
        Ok(())
    }

    pub fn pending(&self) -> Option<PendingCaptcha> {
        self.pending.lock().clone()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}
