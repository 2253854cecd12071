//! HTTP endpoint for Slack Events API callbacks.
//!
//! - `POST /slack/events`: URL verification handshake and event callbacks
//! - `GET  /healthz`: liveness probe
//!
//! Decoded events are forwarded as [`ChatEvent`] values over an mpsc channel
//! to the [`EventListener`](crate::listener::EventListener).

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::chat::ChatEvent;

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct AppState {
    /// Sender side of the listener's event channel.
    pub events: mpsc::Sender<ChatEvent>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/slack/events", post(slack_events))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind the webhook address. Done before anything else is started so an
/// address in use fails startup.
pub async fn bind(listen_addr: &str) -> crate::error::Result<TcpListener> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Slack events endpoint listening on {}", listen_addr);
    Ok(listener)
}

/// Serve the router on `listener` until `shutdown` flips to `true`.
pub async fn start(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> crate::error::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

// ─── Payloads ───────────────────────────────────────────────────────────────

/// Outer Events API envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
    UrlVerification { challenge: String },
    EventCallback { event: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ReactionItem {
    #[serde(default)]
    channel: String,
    #[serde(default)]
    ts: String,
}

#[derive(Debug, Deserialize)]
struct ReactionAdded {
    reaction: String,
    #[serde(default)]
    user: String,
    item: ReactionItem,
}

#[derive(Debug, Deserialize)]
struct AppMention {
    channel: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: String,
}

/// Decode the inner `event` object of a callback.
fn decode_event(event: serde_json::Value) -> serde_json::Result<ChatEvent> {
    let kind = event["type"].as_str().unwrap_or_default().to_string();
    match kind.as_str() {
        "reaction_added" => {
            let r: ReactionAdded = serde_json::from_value(event)?;
            Ok(ChatEvent::ReactionAdded {
                channel: r.item.channel,
                item_ts: r.item.ts,
                reaction: r.reaction,
                user: r.user,
            })
        }
        "app_mention" => {
            let m: AppMention = serde_json::from_value(event)?;
            Ok(ChatEvent::Mention {
                channel: m.channel,
                text: m.text,
                ts: m.ts,
            })
        }
        _ => Ok(ChatEvent::Other(kind)),
    }
}

// ─── Handlers ───────────────────────────────────────────────────────────────

/// `POST /slack/events`: answer the URL handshake or forward an event.
async fn slack_events(State(state): State<Arc<AppState>>, body: String) -> Response {
    let envelope: Envelope = match serde_json::from_str(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Rejecting malformed Slack payload: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match envelope {
        Envelope::UrlVerification { challenge } => {
            info!("Answering Slack URL verification");
            ([(CONTENT_TYPE, "text/plain")], challenge).into_response()
        }
        Envelope::EventCallback { event } => {
            let event = match decode_event(event) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Rejecting malformed Slack event: {}", e);
                    return StatusCode::BAD_REQUEST.into_response();
                }
            };
            debug!("Received {:?}", event);
            if state.events.send(event).await.is_err() {
                warn!("Event listener is gone, dropping event");
                return StatusCode::SERVICE_UNAVAILABLE.into_response();
            }
            StatusCode::OK.into_response()
        }
        Envelope::Unknown => StatusCode::OK.into_response(),
    }
}

/// `GET /healthz`
async fn healthz() -> &'static str {
    "ok"
}
