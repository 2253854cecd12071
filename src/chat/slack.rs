use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::chat::{ChatGateway, ChatMessage, OutgoingMessage};
use crate::error::{Result, SgGuardError};

/// Posts to and reads from Slack via the Web API.
pub struct SlackGateway {
    token: String,
    api_url: String,
    client: reqwest::Client,
}

impl SlackGateway {
    pub fn new(token: String, api_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            token,
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    #[serde(default)]
    ts: String,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    error: Option<String>,
}

/// Map a Slack `ok: false` error code to our error type.
fn api_error(method: &str, error: Option<String>) -> SgGuardError {
    match error.as_deref() {
        Some("invalid_auth") | Some("not_authed") | Some("account_inactive") => {
            SgGuardError::InvalidAuth
        }
        _ => SgGuardError::Chat(format!(
            "{} failed: {}",
            method,
            error.unwrap_or_else(|| "unknown".to_string())
        )),
    }
}

#[async_trait::async_trait]
impl ChatGateway for SlackGateway {
    async fn post_message(&self, message: &OutgoingMessage) -> Result<String> {
        let url = format!("{}/chat.postMessage", self.api_url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(message)
            .send()
            .await
            .map_err(|e| SgGuardError::Chat(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(SgGuardError::Chat(format!(
                "Slack API error {}: {}",
                status, body
            )));
        }

        let body: PostMessageResponse = resp
            .json()
            .await
            .map_err(|e| SgGuardError::Chat(e.to_string()))?;
        if !body.ok {
            return Err(api_error("chat.postMessage", body.error));
        }
        debug!("Posted message {} to {}", body.ts, message.channel);
        Ok(body.ts)
    }

    async fn history(
        &self,
        channel: &str,
        anchor_ts: &str,
        lookback: usize,
    ) -> Result<Vec<ChatMessage>> {
        let url = format!("{}/conversations.history", self.api_url);
        let limit = lookback.to_string();

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("channel", channel),
                ("latest", anchor_ts),
                ("limit", limit.as_str()),
                ("inclusive", "true"),
            ])
            .send()
            .await
            .map_err(|e| SgGuardError::Chat(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
            return Err(SgGuardError::Chat(format!(
                "Slack API error {}: {}",
                status, body
            )));
        }

        let body: HistoryResponse = resp
            .json()
            .await
            .map_err(|e| SgGuardError::Chat(e.to_string()))?;
        if !body.ok {
            return Err(api_error("conversations.history", body.error));
        }
        Ok(body.messages)
    }

    fn name(&self) -> &str {
        "slack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{Attachment, Field};
    use axum::Router;
    use axum::extract::{Json, Query};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use std::collections::HashMap;

    /// Slack Web API stand-in. Rejects any token other than `xoxb-good`.
    async fn spawn_fake_slack() -> String {
        fn authorized(headers: &HeaderMap) -> bool {
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some("Bearer xoxb-good")
        }

        async fn post_message(
            headers: HeaderMap,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            if !authorized(&headers) {
                return Json(serde_json::json!({"ok": false, "error": "invalid_auth"}));
            }
            if body["channel"] == "CMISSING" {
                return Json(serde_json::json!({"ok": false, "error": "channel_not_found"}));
            }
            let ts = if body["thread_ts"].is_string() {
                "1700000001.000200"
            } else {
                "1700000001.000100"
            };
            Json(serde_json::json!({"ok": true, "ts": ts}))
        }

        async fn history(
            headers: HeaderMap,
            Query(params): Query<HashMap<String, String>>,
        ) -> Json<serde_json::Value> {
            if !authorized(&headers) {
                return Json(serde_json::json!({"ok": false, "error": "invalid_auth"}));
            }
            // Echo the query back through the text of the message.
            let echo = format!(
                "{}|{}|{}",
                params.get("latest").map(String::as_str).unwrap_or(""),
                params.get("limit").map(String::as_str).unwrap_or(""),
                params.get("inclusive").map(String::as_str).unwrap_or(""),
            );
            Json(serde_json::json!({
                "ok": true,
                "messages": [{
                    "ts": "1700000000.000100",
                    "text": echo,
                    "attachments": [{
                        "color": "#ff6347",
                        "fields": [{"title": "ID", "value": "web-sg-uuid", "short": false}]
                    }]
                }]
            }))
        }

        let app = Router::new()
            .route("/chat.postMessage", post(post_message))
            .route("/conversations.history", get(history));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn gateway(url: &str, token: &str) -> SlackGateway {
        SlackGateway::new(token.to_string(), url, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn auth_errors_map_to_invalid_auth() {
        assert!(matches!(
            api_error("x", Some("invalid_auth".to_string())),
            SgGuardError::InvalidAuth
        ));
        assert!(matches!(
            api_error("x", Some("ratelimited".to_string())),
            SgGuardError::Chat(_)
        ));
    }

    #[tokio::test]
    async fn post_message_returns_ts() {
        let url = spawn_fake_slack().await;
        let msg = OutgoingMessage::text("C123", "open groups found").with_attachments(vec![
            Attachment {
                color: "#ff6347".to_string(),
                fields: vec![Field::new("ID", "g1")],
            },
        ]);
        let ts = gateway(&url, "xoxb-good").post_message(&msg).await.unwrap();
        assert_eq!(ts, "1700000001.000100");
    }

    #[tokio::test]
    async fn threaded_reply_is_sent_with_thread_ts() {
        let url = spawn_fake_slack().await;
        let msg = OutgoingMessage::text("C123", "ok").in_thread("1700000000.000100");
        let ts = gateway(&url, "xoxb-good").post_message(&msg).await.unwrap();
        assert_eq!(ts, "1700000001.000200");
    }

    #[tokio::test]
    async fn ok_false_is_chat_error() {
        let url = spawn_fake_slack().await;
        let err = gateway(&url, "xoxb-good")
            .post_message(&OutgoingMessage::text("CMISSING", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, SgGuardError::Chat(ref m) if m.contains("channel_not_found")));
    }

    #[tokio::test]
    async fn bad_token_is_invalid_auth() {
        let url = spawn_fake_slack().await;
        let err = gateway(&url, "xoxb-bad")
            .history("C123", "1700000000.000100", 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SgGuardError::InvalidAuth));
    }

    #[tokio::test]
    async fn history_ends_at_the_anchor_message() {
        let url = spawn_fake_slack().await;
        let messages = gateway(&url, "xoxb-good")
            .history("C123", "1700000000.000100", 10)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "1700000000.000100|10|true");
        assert_eq!(messages[0].attachments[0].field("ID"), Some("web-sg-uuid"));
    }
}
