//! Warning messages for compliance findings.
//!
//! A warning is a prefix text message, then the finding attachments split into
//! messages of at most `batch_size` attachments, then a suffix text message.
//! All messages are posted to the configured channel under the configured
//! display identity through a [`ChatGateway`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::chat::{Attachment, ChatGateway, Field, OutgoingMessage};
use crate::config::AppConfig;
use crate::error::{Result, SgGuardError};
use crate::inventory::{Rule, SecurityGroup};

/// Attachments per message when none is configured (Slack's per-message cap).
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Attachment color for every finding.
pub const FINDING_COLOR: &str = "#ff6347";

/// Split `items` into consecutive batches of at most `size` (0 counts as 1).
pub fn batches<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// Attachment describing one full-open rule.
pub fn full_open_attachment(group: &SecurityGroup, rule: &Rule, owner: &str) -> Attachment {
    Attachment {
        color: FINDING_COLOR.to_string(),
        fields: vec![
            Field::new("Tenant", owner),
            Field::new("ID", group.id.clone()),
            Field::new("Name", group.name.clone()),
            Field::new("PortRange", rule.port_range()),
        ],
    }
}

/// Attachment describing a group flagged by a policy.
pub fn policy_attachment(group: &SecurityGroup, owner: &str) -> Attachment {
    Attachment {
        color: FINDING_COLOR.to_string(),
        fields: vec![
            Field::new("Name", group.name.clone()),
            Field::short("Tenant", owner),
            Field::short("ID", group.id.clone()),
            Field::new("Created", format_created(group.created_at)),
            Field::new("Rules", rules_summary(&group.rules)),
        ],
    }
}

fn format_created(created_at: Option<DateTime<Utc>>) -> String {
    created_at
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// One line per rule: `ingress, IP Range: 0.0.0.0/0, Port Range: 22-22`.
fn rules_summary(rules: &[Rule]) -> String {
    rules
        .iter()
        .map(|r| {
            format!(
                "{}, IP Range: {}, Port Range: {}",
                r.direction,
                r.remote_ip_prefix.as_deref().unwrap_or(""),
                r.port_range()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Posts batched warnings to one channel.
pub struct Notifier {
    gateway: Arc<dyn ChatGateway>,
    channel: String,
    username: String,
    icon_emoji: String,
    batch_size: usize,
}

impl Notifier {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        channel: String,
        username: String,
        icon_emoji: String,
        batch_size: usize,
    ) -> Self {
        Self {
            gateway,
            channel,
            username,
            icon_emoji,
            batch_size,
        }
    }

    pub fn from_config(gateway: Arc<dyn ChatGateway>, config: &AppConfig) -> Self {
        Self::new(
            gateway,
            config.slack.channel.clone(),
            config.username.clone(),
            config.icon_emoji.clone(),
            config.slack.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
        )
    }

    async fn post(&self, message: OutgoingMessage) -> Result<()> {
        let message = message.as_identity(&self.username, &self.icon_emoji);
        self.gateway
            .post_message(&message)
            .await
            .map_err(|e| SgGuardError::Notification(e.to_string()))?;
        Ok(())
    }

    /// Send prefix, attachment batches and suffix. Stops at the first failed
    /// post. Returns the number of messages sent.
    pub async fn post_warning(
        &self,
        attachments: &[Attachment],
        prefix: &str,
        suffix: &str,
    ) -> Result<usize> {
        let mut sent = 0;

        self.post(OutgoingMessage::text(&self.channel, prefix)).await?;
        sent += 1;

        for batch in batches(attachments, self.batch_size) {
            self.post(OutgoingMessage::text(&self.channel, "").with_attachments(batch.to_vec()))
                .await?;
            sent += 1;
        }

        self.post(OutgoingMessage::text(&self.channel, suffix)).await?;
        sent += 1;

        debug!("Warning sent via {}: {} messages", self.gateway.name(), sent);
        info!(
            "Posted {} findings to {}",
            attachments.len(),
            self.channel
        );
        Ok(sent)
    }
}
