//! HTTP surface: the Telegram webhook plus liveness and debug routes.
//!
//! The webhook always answers `200 OK` and only then hands the update to
//! [`bot::route`] on a separate task. Telegram retries anything that is not
//! acknowledged promptly, and updates carry no idempotency key.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::Poll;

use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use futures::{future, stream, FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::bot::{self, AppState, WEBHOOK_PATH};
use crate::config::Environment;
use crate::update::{Update, UpdateKind};

const INDEX_TEXT: &str = "Project Orion Telegram Bot is running! 🚀";

const BODY_PREVIEW_CHARS: usize = 200;

/// Telegram updates are a few KiB; anything past this is acknowledged and dropped.
pub const MAX_UPDATE_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DebugInfo {
    telegram_token_available: bool,
    telegram_token_length: usize,
    node_env: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/debug", get(debug_info))
        .route(WEBHOOK_PATH, post(receive_update))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Bind and serve until Ctrl-C.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let environment = state.config.environment();
    let port = state.config.server.port;
    let host = match environment {
        Environment::Production => [0, 0, 0, 0],
        Environment::Development => [127, 0, 0, 1],
    };
    let addr = SocketAddr::from((host, port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Server running on {} ({})", addr, environment);
    if environment == Environment::Development {
        info!("For local development, expose the port with a tunnel (e.g. `ngrok http {port}`)");
        info!("then register it with: orion-bot set-webhook <TUNNEL_URL>");
    }
    info!("Waiting for Telegram updates...");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}

async fn log_request(request: Request, next: Next) -> Response {
    info!(
        "[{}] {} {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        request.method(),
        request.uri().path()
    );
    next.run(request).await
}

async fn index() -> &'static str {
    INDEX_TEXT
}

async fn debug_info(State(state): State<Arc<AppState>>) -> Json<DebugInfo> {
    let telegram = &state.config.telegram;
    Json(DebugInfo {
        telegram_token_available: telegram.has_token(),
        telegram_token_length: telegram.bot_token.chars().count(),
        node_env: state.config.environment_label().to_string(),
    })
}

async fn receive_update(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let (response, delivered) = acknowledge();

    // Buffered here rather than through the `Bytes` extractor so that an
    // oversized or broken body is still answered with `200 OK`.
    let body = match axum::body::to_bytes(body, MAX_UPDATE_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Ignoring unreadable webhook body: {}", e);
            return response;
        }
    };

    debug!("Webhook headers: {:?}", headers);
    debug!("Webhook query: {}", uri.query().unwrap_or_default());
    debug!(
        "Webhook body snippet: {}...",
        String::from_utf8_lossy(&body)
            .chars()
            .take(BODY_PREVIEW_CHARS)
            .collect::<String>()
    );

    let update: Update = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(e) => {
            warn!("Ignoring webhook body that is not a Telegram update: {}", e);
            return response;
        }
    };

    info!("Telegram update type: {}", update.kind().label());
    if let (UpdateKind::Message(message), Some(text)) = (update.kind(), update.text()) {
        match &message.from {
            Some(user) => info!("Message from {} ({}): {:?}", user.first_name, user.id, text),
            None => info!("Message from unknown sender: {:?}", text),
        }
    }

    spawn_processing(state, update, delivered);
    info!("Acknowledging update with 200 OK");
    response
}

/// `200 OK` with body `OK`. The receiver resolves once the body has been
/// handed to the transport, or as soon as the response is dropped.
fn acknowledge() -> (Response, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);

    let body = stream::once(future::ready(Ok::<_, Infallible>(Bytes::from_static(b"OK"))))
        .chain(stream::poll_fn(move |_| {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
            Poll::Ready(None)
        }));

    let response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response();

    (response, rx)
}

fn spawn_processing(state: Arc<AppState>, update: Update, delivered: oneshot::Receiver<()>) {
    tokio::spawn(async move {
        // A closed channel means the response was dropped; the update is still processed.
        let _ = delivered.await;

        let processing = AssertUnwindSafe(bot::route(&state, update)).catch_unwind();
        if let Err(panic) = processing.await {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("Error in webhook processing: {}", reason);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::testing::{Call, RecordingMessenger};
    use crate::config::Config;
    use axum::http::{Method, Request as HttpRequest};
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Collects formatted log output for the current thread.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let writer = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || writer.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn hello_payload() -> String {
        serde_json::json!({
            "message": {"text": "hello", "chat": {"id": 1}, "from": {"id": 2, "first_name": "B"}}
        })
        .to_string()
    }

    fn app(messenger: Arc<RecordingMessenger>, token: &str) -> Router {
        let mut config = Config::default();
        config.telegram.bot_token = token.to_string();
        config.server.environment = Some("test".to_string());
        router(Arc::new(AppState::new(config, messenger)))
    }

    fn post_webhook(body: impl Into<Body>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(Method::POST)
            .uri(WEBHOOK_PATH)
            .header("content-type", "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn read_body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_help_scenario() {
        let messenger = Arc::new(RecordingMessenger::default());
        let payload = serde_json::json!({
            "message": {"text": "/help", "chat": {"id": 42}, "from": {"id": 7, "first_name": "A"}}
        });

        let response = app(messenger.clone(), "token")
            .oneshot(post_webhook(payload.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, "OK");

        let calls = messenger.wait_for_calls(1).await;
        assert_eq!(calls.len(), 1);
        assert!(matches!(&calls[0], Call::Send { chat_id: 42, text } if text.starts_with("Here's what I can do:")));
    }

    #[tokio::test]
    async fn test_echo_scenario() {
        let messenger = Arc::new(RecordingMessenger::default());
        let payload = serde_json::json!({
            "message": {"text": "hello", "chat": {"id": 1}, "from": {"id": 2, "first_name": "B"}}
        });

        let response = app(messenger.clone(), "token")
            .oneshot(post_webhook(payload.to_string()))
            .await
            .unwrap();
        assert_eq!(read_body(response).await, "OK");

        messenger.wait_for_calls(1).await;
        assert_eq!(messenger.sends(), vec![(1, "You said: hello".to_string())]);
    }

    #[tokio::test]
    async fn test_processing_waits_for_acknowledgment() {
        let messenger = Arc::new(RecordingMessenger::default());
        let payload = serde_json::json!({
            "message": {"text": "hello", "chat": {"id": 1}, "from": {"id": 2, "first_name": "B"}}
        });

        let response = app(messenger.clone(), "token")
            .oneshot(post_webhook(payload.to_string()))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.calls().is_empty());

        assert_eq!(read_body(response).await, "OK");
        assert_eq!(messenger.wait_for_calls(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_send_does_not_delay_response() {
        let messenger = Arc::new(RecordingMessenger::gated());
        let payload = serde_json::json!({
            "message": {"text": "hello", "chat": {"id": 1}, "from": {"id": 2, "first_name": "B"}}
        });

        let response = tokio::time::timeout(
            Duration::from_secs(1),
            app(messenger.clone(), "token").oneshot(post_webhook(payload.to_string())),
        )
        .await
        .expect("webhook response was delayed")
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, "OK");
        assert!(messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_acknowledged() {
        let messenger = Arc::new(RecordingMessenger::default());

        for body in ["not json", "", "[1,2,3]", r#"{"message": {"text": "no chat"}}"#] {
            let response = app(messenger.clone(), "token")
                .oneshot(post_webhook(body))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(read_body(response).await, "OK");
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_acknowledged_without_send() {
        let messenger = Arc::new(RecordingMessenger::default());
        let text = "a".repeat(3 * 1024 * 1024);
        let payload = serde_json::json!({
            "message": {"text": text, "chat": {"id": 1}, "from": {"id": 2, "first_name": "B"}}
        });

        let response = app(messenger.clone(), "token")
            .oneshot(post_webhook(payload.to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, "OK");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_panic_in_processing_is_contained() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let messenger = Arc::new(RecordingMessenger::panicking_sends(1));
        let app = app(messenger.clone(), "token");

        let response = app
            .clone()
            .oneshot(post_webhook(hello_payload()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, "OK");

        for _ in 0..100 {
            if logs.contents().contains("Error in webhook processing") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(logs
            .contents()
            .contains("Error in webhook processing: send_message blew up"));
        assert!(messenger.calls().is_empty());

        let response = app.oneshot(post_webhook(hello_payload())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, "OK");

        messenger.wait_for_calls(1).await;
        assert_eq!(messenger.sends(), vec![(1, "You said: hello".to_string())]);
    }

    #[tokio::test]
    async fn test_requests_are_logged_with_method_and_path() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let messenger = Arc::new(RecordingMessenger::default());
        let request = HttpRequest::builder()
            .uri("/debug?verbose=1")
            .body(Body::empty())
            .unwrap();
        let response = app(messenger, "token").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let output = logs.contents();
        let line = output
            .lines()
            .find(|l| l.contains("GET /debug"))
            .expect("request was not logged");
        assert!(!line.contains("verbose=1"));
        // RFC 3339 timestamp in brackets, e.g. [2026-10-17T12:00:00.000Z]
        assert!(line.contains("Z] GET /debug"));
    }

    #[tokio::test]
    async fn test_missing_content_type_is_acknowledged() {
        let messenger = Arc::new(RecordingMessenger::default());
        let request = HttpRequest::builder()
            .method(Method::POST)
            .uri(WEBHOOK_PATH)
            .body(Body::from(r#"{"update_id": 1}"#))
            .unwrap();

        let response = app(messenger, "token").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, "OK");
    }

    #[tokio::test]
    async fn test_incomplete_message_is_acknowledged_without_send() {
        let messenger = Arc::new(RecordingMessenger::default());
        let payload = serde_json::json!({"message": {"text": "", "chat": {"id": 1}}});

        let response = app(messenger.clone(), "token")
            .oneshot(post_webhook(payload.to_string()))
            .await
            .unwrap();
        assert_eq!(read_body(response).await, "OK");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_index() {
        let messenger = Arc::new(RecordingMessenger::default());
        let request = HttpRequest::builder().uri("/").body(Body::empty()).unwrap();

        let response = app(messenger, "token").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_body(response).await, INDEX_TEXT);
    }

    #[tokio::test]
    async fn test_debug_reports_token_presence_only() {
        let messenger = Arc::new(RecordingMessenger::default());
        let request = HttpRequest::builder().uri("/debug").body(Body::empty()).unwrap();

        let response = app(messenger, "123456:secret-value")
            .oneshot(request)
            .await
            .unwrap();
        let body = read_body(response).await;
        assert!(!body.contains("secret-value"));

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["telegramTokenAvailable"], true);
        assert_eq!(json["telegramTokenLength"], 19);
        assert_eq!(json["nodeEnv"], "test");
    }

    #[tokio::test]
    async fn test_debug_without_token() {
        let messenger = Arc::new(RecordingMessenger::default());
        let request = HttpRequest::builder().uri("/debug").body(Body::empty()).unwrap();

        let response = app(messenger, "").oneshot(request).await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&read_body(response).await).unwrap();
        assert_eq!(json["telegramTokenAvailable"], false);
        assert_eq!(json["telegramTokenLength"], 0);
    }
}
