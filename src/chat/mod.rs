//! Chat platform types and the [`ChatGateway`] trait.
//!
//! Outbound warnings and replies go through a [`ChatGateway`]; inbound
//! activity arrives as [`ChatEvent`] values. The only shipped gateway is
//! [`slack::SlackGateway`].

pub mod slack;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Title/value pair shown inside an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub title: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub short: bool,
}

impl Field {
    pub fn new(title: &str, value: impl Into<String>) -> Self {
        Self {
            title: title.to_string(),
            value: value.into(),
            short: false,
        }
    }

    /// Field rendered side by side with its neighbour.
    pub fn short(title: &str, value: impl Into<String>) -> Self {
        Self {
            short: true,
            ..Self::new(title, value)
        }
    }
}

/// A colored block of fields attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub color: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Attachment {
    /// Value of the first field titled `title`.
    pub fn field(&self, title: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.title == title)
            .map(|f| f.value.as_str())
    }
}

/// A message read back from channel history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChatMessage {
    pub ts: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A message to post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon_emoji: String,
    /// Parent message timestamp when replying in a thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
}

impl OutgoingMessage {
    /// Plain text message to `channel`.
    pub fn text(channel: &str, text: impl Into<String>) -> Self {
        Self {
            channel: channel.to_string(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Post under the given display identity.
    pub fn as_identity(mut self, username: &str, icon_emoji: &str) -> Self {
        self.username = username.to_string();
        self.icon_emoji = icon_emoji.to_string();
        self
    }

    pub fn in_thread(mut self, thread_ts: &str) -> Self {
        self.thread_ts = Some(thread_ts.to_string());
        self
    }
}

/// Inbound chat activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// Connection established.
    Hello,
    /// The platform rejected our credentials.
    InvalidAuth,
    /// A reaction was added to the message `item_ts` in `channel`.
    ReactionAdded {
        channel: String,
        item_ts: String,
        reaction: String,
        user: String,
    },
    /// The bot was mentioned.
    Mention {
        channel: String,
        text: String,
        ts: String,
    },
    /// Any other event type, by name.
    Other(String),
}

/// Trait for chat backends.
///
/// Implementations must be `Send + Sync` for use across async tasks.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    /// Post a message and return its timestamp.
    async fn post_message(&self, message: &OutgoingMessage) -> Result<String>;

    /// Up to `lookback` messages of `channel` posted at or before `anchor_ts`,
    /// newest first. The anchor message itself comes first when it exists.
    async fn history(
        &self,
        channel: &str,
        anchor_ts: &str,
        lookback: usize,
    ) -> Result<Vec<ChatMessage>>;

    /// Return the backend name (e.g., `"slack"`).
    fn name(&self) -> &str;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory gateway shared by unit tests across modules.

    use super::*;
    use std::sync::{Arc, Mutex};

    pub struct MockGateway {
        pub sent: Arc<Mutex<Vec<OutgoingMessage>>>,
        pub history: Vec<ChatMessage>,
        pub fail_posts: bool,
        /// Serve posted messages as history instead of `history`.
        pub echo_history: bool,
    }

    impl MockGateway {
        pub fn new() -> (Self, Arc<Mutex<Vec<OutgoingMessage>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    sent: sent.clone(),
                    history: Vec::new(),
                    fail_posts: false,
                    echo_history: false,
                },
                sent,
            )
        }
    }

    #[async_trait::async_trait]
    impl ChatGateway for MockGateway {
        async fn post_message(&self, message: &OutgoingMessage) -> Result<String> {
            if self.fail_posts {
                return Err(crate::error::SgGuardError::Chat("channel_not_found".into()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(message.clone());
            Ok(format!("1700000000.{:06}", sent.len()))
        }

        async fn history(
            &self,
            _channel: &str,
            _anchor_ts: &str,
            lookback: usize,
        ) -> Result<Vec<ChatMessage>> {
            if self.echo_history {
                let sent = self.sent.lock().unwrap();
                return Ok(sent
                    .iter()
                    .enumerate()
                    .rev()
                    .take(lookback)
                    .map(|(i, m)| ChatMessage {
                        ts: format!("1700000000.{:06}", i + 1),
                        text: m.text.clone(),
                        attachments: m.attachments.clone(),
                    })
                    .collect());
            }
            Ok(self.history.iter().take(lookback).cloned().collect())
        }

        fn name(&self) -> &str {
            "mock"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_field_lookup() {
        let attachment = Attachment {
            color: "#ff6347".to_string(),
            fields: vec![Field::new("Name", "web-sg"), Field::new("ID", "web-sg-uuid")],
        };
        assert_eq!(attachment.field("ID"), Some("web-sg-uuid"));
        assert_eq!(attachment.field("Rules"), None);
    }

    #[test]
    fn outgoing_message_skips_empty_fields() {
        let msg = OutgoingMessage::text("C123", "pong");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"channel": "C123", "text": "pong"}));
    }

    #[test]
    fn outgoing_message_builders() {
        let msg = OutgoingMessage::text("C123", "warn")
            .with_attachments(vec![Attachment::default()])
            .as_identity("sgguard", ":shield:")
            .in_thread("1.2");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["username"], "sgguard");
        assert_eq!(json["icon_emoji"], ":shield:");
        assert_eq!(json["thread_ts"], "1.2");
        assert_eq!(json["attachments"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn chat_message_tolerates_missing_attachments() {
        let msg: ChatMessage = serde_json::from_str(r#"{"ts": "1.2", "text": "hi"}"#).unwrap();
        assert!(msg.attachments.is_empty());
    }
}
