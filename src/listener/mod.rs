//! Inbound chat events.
//!
//! An approve reaction on a finding message grants a temporary exception for
//! the security group named in the message's first attachment. A mention of
//! the form `@bot ping` is answered with `pong`. Everything else is ignored.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::chat::{ChatEvent, ChatGateway, OutgoingMessage};
use crate::config::AppConfig;
use crate::error::{Result, SgGuardError};
use crate::exception::ExceptionStore;

/// Reply posted when the exception could not be stored.
const GRANT_FAILED_MESSAGE: &str = "Could not record the exception, please try again.";

/// What handling one event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    Ignored,
    Connected,
    Granted { group_id: String },
    Pong,
}

/// Reacts to chat events.
pub struct EventListener {
    gateway: Arc<dyn ChatGateway>,
    exceptions: ExceptionStore,
    approve_reaction: String,
    history_lookback: usize,
    grant_message: String,
    username: String,
    icon_emoji: String,
}

impl EventListener {
    pub fn new(gateway: Arc<dyn ChatGateway>, exceptions: ExceptionStore, config: &AppConfig) -> Self {
        Self {
            gateway,
            exceptions,
            approve_reaction: config.slack.approve_reaction.clone(),
            history_lookback: config.slack.history_lookback,
            grant_message: config.slack.grant_message.clone(),
            username: config.username.clone(),
            icon_emoji: config.icon_emoji.clone(),
        }
    }

    /// Handle a single event.
    pub async fn handle(&self, event: ChatEvent) -> Result<ListenerOutcome> {
        match event {
            ChatEvent::Hello => {
                info!("Connected to chat via {}", self.gateway.name());
                Ok(ListenerOutcome::Connected)
            }
            ChatEvent::InvalidAuth => Err(SgGuardError::InvalidAuth),
            ChatEvent::ReactionAdded {
                channel,
                item_ts,
                reaction,
                user,
            } => {
                if reaction != self.approve_reaction {
                    return Ok(ListenerOutcome::Ignored);
                }
                info!("{} approved message {} in {}", user, item_ts, channel);
                self.grant(&channel, &item_ts).await
            }
            ChatEvent::Mention { channel, text, .. } => {
                if text.split_whitespace().nth(1) != Some("ping") {
                    debug!("Ignoring mention: {}", text);
                    return Ok(ListenerOutcome::Ignored);
                }
                self.gateway
                    .post_message(&OutgoingMessage::text(&channel, "pong"))
                    .await?;
                Ok(ListenerOutcome::Pong)
            }
            ChatEvent::Other(kind) => {
                debug!("Ignoring {} event", kind);
                Ok(ListenerOutcome::Ignored)
            }
        }
    }

    async fn grant(&self, channel: &str, item_ts: &str) -> Result<ListenerOutcome> {
        if item_ts.parse::<f64>().is_err() {
            return Err(SgGuardError::Chat(format!("bad message timestamp {}", item_ts)));
        }

        let history = self
            .gateway
            .history(channel, item_ts, self.history_lookback)
            .await?;
        let message = history
            .iter()
            .find(|m| m.ts == item_ts)
            .ok_or_else(|| SgGuardError::MessageNotFound {
                channel: channel.to_string(),
                ts: item_ts.to_string(),
            })?;

        let group_id = message
            .attachments
            .first()
            .and_then(|a| a.field("ID"))
            .ok_or_else(|| SgGuardError::MissingGroupId(item_ts.to_string()))?
            .to_string();

        let reply = |text: &str| {
            OutgoingMessage::text(channel, text)
                .as_identity(&self.username, &self.icon_emoji)
                .in_thread(item_ts)
        };

        if let Err(e) = self.exceptions.add(&group_id).await {
            if let Err(post_err) = self.gateway.post_message(&reply(GRANT_FAILED_MESSAGE)).await {
                warn!("Failed to post failure reply: {}", post_err);
            }
            return Err(e);
        }
        if let Ok(ids) = self.exceptions.list().await {
            info!("Temporary allowed security groups: {:?}", ids);
        }

        self.gateway.post_message(&reply(&self.grant_message)).await?;
        Ok(ListenerOutcome::Granted { group_id })
    }

    /// Consume events until the channel closes, shutdown fires or the
    /// platform reports invalid credentials.
    pub async fn run(
        &self,
        events: mpsc::Receiver<ChatEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut events = ReceiverStream::new(events);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = events.next() => {
                    let Some(event) = next else { break };
                    match self.handle(event).await {
                        Ok(outcome) => debug!("Event handled: {:?}", outcome),
                        Err(SgGuardError::InvalidAuth) => {
                            error!("Chat platform rejected our credentials");
                            return Err(SgGuardError::InvalidAuth);
                        }
                        Err(e) => error!("Failed to handle chat event: {}", e),
                    }
                }
            }
        }
        info!("Event listener stopped");
        Ok(())
    }
}
