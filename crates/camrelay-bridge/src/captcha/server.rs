//! HTTP surface for submitting captcha solutions.
//!
//! ```text
//! curl -X POST http://localhost:8080/captcha -d '{"captcha":"ABCD"}'
//! curl -X POST 'http://localhost:8080/captcha?code=ABCD'
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::Html;
use axum::routing::get;
use axum::{Form, Json, Router};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use super::{CaptchaChannel, PendingCaptcha};

/// Build the captcha router.
pub fn captcha_router(channel: Arc<CaptchaChannel>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/captcha",
            get(captcha_page_handler).post(submit_captcha_handler),
        )
        .fallback(not_found_handler)
        .with_state(channel)
}

/// Listen on all interfaces until the server fails.
pub async fn serve(channel: Arc<CaptchaChannel>, port: u16) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Captcha server listening on :{}", port);
    axum::serve(listener, captcha_router(channel)).await
}

async fn health_handler(State(channel): State<Arc<CaptchaChannel>>) -> Json<JsonValue> {
    Json(json!({
        "status": "ok",
        "captchaPending": channel.is_pending(),
    }))
}

async fn captcha_page_handler(State(channel): State<Arc<CaptchaChannel>>) -> Html<String> {
    Html(render_captcha_page(channel.pending().as_ref()))
}

async fn submit_captcha_handler(
    State(channel): State<Arc<CaptchaChannel>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> (StatusCode, Json<JsonValue>) {
    if let Some(code) = query.get("code").filter(|c| !c.is_empty()) {
        return submit(&channel, code);
    }

    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let value = if is_form {
        match Form::<HashMap<String, String>>::from_request(request, &()).await {
            Ok(Form(mut fields)) => fields.remove("code").or_else(|| fields.remove("captcha")),
            Err(rejection) => {
                return (
                    rejection.status(),
                    Json(json!({ "error": rejection.body_text() })),
                );
            }
        }
    } else {
        let body = match Bytes::from_request(request, &()).await {
            Ok(body) => body,
            Err(rejection) => {
                return (
                    rejection.status(),
                    Json(json!({ "error": rejection.body_text() })),
                );
            }
        };
        match serde_json::from_slice::<JsonValue>(&body) {
            Ok(parsed) => parsed
                .get("captcha")
                .or_else(|| parsed.get("code"))
                .and_then(JsonValue::as_str)
                .map(str::to_string),
            Err(_) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid JSON" })),
                );
            }
        }
    };

    match value.filter(|v| !v.is_empty()) {
        Some(code) => submit(&channel, &code),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Missing captcha/code field" })),
        ),
    }
}

async fn not_found_handler() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found\n")
}

fn submit(channel: &CaptchaChannel, code: &str) -> (StatusCode, Json<JsonValue>) {
    match channel.solve(code) {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true, "code": code }))),
        Err(e) => {
            warn!("Captcha submission failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn render_captcha_page(pending: Option<&PendingCaptcha>) -> String {
    let Some(src) = pending.and_then(PendingCaptcha::image_src) else {
        return r#"<!DOCTYPE html><html><body style="font-family:sans-serif;text-align:center;padding:4rem">
  <h1>No captcha pending</h1>
  <p>Waiting for the service to request one…</p>
  <script>setTimeout(()=>location.reload(), 5000)</script>
</body></html>"#
            .to_string();
    };

    let id = pending
        .and_then(|p| p.id.as_deref())
        .map(escape_html)
        .unwrap_or_else(|| "unknown".to_string());

    format!(
        r#"<!DOCTYPE html><html><body style="font-family:sans-serif;text-align:center;padding:2rem">
  <h1>Captcha Required</h1>
  <p>ID: <code>{id}</code></p>
  <img src="{src}" style="border:2px solid #333;margin:1rem auto;display:block;max-width:400px" />
  <form method="POST" action="/captcha" style="margin-top:1rem">
    <input name="code" type="text" placeholder="Enter captcha code" autofocus required
           style="font-size:1.5rem;padding:0.5rem;text-align:center;width:200px" />
    <br/><br/>
    <button type="submit" style="font-size:1.2rem;padding:0.5rem 2rem;cursor:pointer">Submit</button>
  </form>
</body></html>"#,
        id = id,
        src = escape_html(&src),
    )
}
