//! TOML configuration types for sgguard.
//!
//! The top-level [`AppConfig`] is deserialized from `sgguard.toml`. It is loaded
//! once at startup, validated, and then shared read-only (behind an `Arc`) by
//! every component.
//!
//! # Example `sgguard.toml`
//!
//! ```toml
//! username = "sgguard"
//! icon_emoji = ":shield:"
//! check_interval = "0 0 10 * * *"
//! reset_interval = "0 0 10 * * *"
//! prefix_message = "Security groups open to 0.0.0.0/0 were found"
//! suffix_message = "React with :white_check_mark: to allow until the next reset"
//!
//! [[rules]]
//! tenant = "web"
//! sg = "web-sg"
//! port = ["80", "443"]
//!
//! [openstack]
//! auth_url = "${OS_AUTH_URL}"
//! username = "${OS_USERNAME}"
//! password = "${OS_PASSWORD}"
//! project_name = "admin"
//!
//! [slack]
//! token = "${SLACK_TOKEN}"
//! channel = "C0123456789"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SgGuardError};

/// A static allow-list entry (`[[rules]]`).
///
/// `tenant_id` is never read from the file; it is resolved from the tenant
/// name at the start of every compliance run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowEntry {
    /// Tenant (project) name.
    pub tenant: String,
    /// Resolved tenant id. `None` until resolved; unresolved entries never match.
    #[serde(skip)]
    pub tenant_id: Option<String>,
    /// Security group name.
    pub sg: String,
    /// Port specs, either a single port (`"22"`) or a range (`"8000-8080"`).
    #[serde(default)]
    pub port: Vec<String>,
}

/// A policy bundle evaluated against every security group (`[[policies]]`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Path to the Rego source file.
    pub policy: PathBuf,
    /// Optional path to a JSON data document.
    #[serde(default)]
    pub data: Option<PathBuf>,
    /// Rule queried for the verdict.
    #[serde(default = "default_query")]
    pub query: String,
    /// Text posted before this policy's findings.
    pub prefix_message: String,
    /// Text posted after this policy's findings.
    pub suffix_message: String,
}

fn default_query() -> String {
    "data.example.allow".to_string()
}

/// OpenStack credentials and endpoint (`[openstack]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenStackConfig {
    /// Keystone endpoint, e.g. `https://keystone.example.com:5000`.
    pub auth_url: String,
    pub username: String,
    pub password: String,
    /// Project used to scope the token.
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub domain_name: String,
    #[serde(default)]
    pub region_name: Option<String>,
    /// Client certificate (PEM) for mTLS.
    #[serde(default)]
    pub cert: Option<PathBuf>,
    /// Client key (PEM) for mTLS.
    #[serde(default)]
    pub key: Option<PathBuf>,
    /// Extra CA bundle (PEM) to trust.
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
}

fn default_domain() -> String {
    "Default".to_string()
}

/// Slack settings (`[slack]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlackConfig {
    /// Bot token (`xoxb-...`).
    pub token: String,
    /// Channel that receives warnings and approve reactions.
    pub channel: String,
    /// Reaction glyph that grants a temporary exception.
    #[serde(default = "default_approve_reaction")]
    pub approve_reaction: String,
    /// Number of history messages searched for the reacted message.
    #[serde(default = "default_history_lookback")]
    pub history_lookback: usize,
    /// Maximum attachments per message. Unset means 20 for one-off checks
    /// and 1 in server mode.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Threaded reply posted after an exception is granted.
    #[serde(default = "default_grant_message")]
    pub grant_message: String,
    /// Base URL of the Slack Web API.
    #[serde(default = "default_slack_api_url")]
    pub api_url: String,
}

fn default_approve_reaction() -> String {
    "white_check_mark".to_string()
}

fn default_history_lookback() -> usize {
    10
}

fn default_grant_message() -> String {
    "Allowed until the next reset.".to_string()
}

fn default_slack_api_url() -> String {
    "https://slack.com/api".to_string()
}

/// OPA server settings (`[opa]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpaConfig {
    #[serde(default = "default_opa_url")]
    pub url: String,
}

impl Default for OpaConfig {
    fn default() -> Self {
        Self {
            url: default_opa_url(),
        }
    }
}

fn default_opa_url() -> String {
    "http://127.0.0.1:8181".to_string()
}

/// Exception store settings (`[store]` section).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// SQLite database file. When absent the store lives in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Webhook listener settings (`[server]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

/// Top-level application configuration deserialized from `sgguard.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Compute findings without posting to chat.
    #[serde(default)]
    pub dry_run: bool,
    /// Display name used for posted messages.
    pub username: String,
    /// Display icon used for posted messages.
    pub icon_emoji: String,
    /// Cron expression (seconds first) for compliance runs.
    pub check_interval: String,
    /// Cron expression (seconds first) for clearing exceptions.
    pub reset_interval: String,
    /// Glob of extra TOML files whose `[[rules]]` are appended.
    #[serde(default)]
    pub include: Option<String>,
    /// Text posted before full-open findings.
    pub prefix_message: String,
    /// Text posted after full-open findings.
    pub suffix_message: String,
    /// Per-call timeout for inventory, policy and chat requests.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Static allow-list.
    #[serde(default)]
    pub rules: Vec<AllowEntry>,
    /// Policy bundles.
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    pub openstack: OpenStackConfig,
    pub slack: SlackConfig,
    #[serde(default)]
    pub opa: OpaConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Shape of a file pulled in through `include`; only its rules are used.
#[derive(Debug, Deserialize)]
struct IncludedRules {
    #[serde(default)]
    rules: Vec<AllowEntry>,
}

impl AppConfig {
    /// Load, parse and validate the configuration at the given path.
    ///
    /// `${VAR}` and `$VAR` placeholders in string values are replaced with the
    /// corresponding environment variable values. An error is returned if a
    /// referenced variable is not set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(pattern) = config.include.clone().filter(|p| !p.trim().is_empty()) {
            config.rules.extend(load_included_rules(&pattern)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration text and substitute environment variables. Does
    /// not follow `include` and does not validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        parse_with_env(content)
    }

    /// Check required fields and cron expressions.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("username", &self.username),
            ("icon_emoji", &self.icon_emoji),
            ("check_interval", &self.check_interval),
            ("reset_interval", &self.reset_interval),
            ("prefix_message", &self.prefix_message),
            ("suffix_message", &self.suffix_message),
            ("slack.token", &self.slack.token),
            ("slack.channel", &self.slack.channel),
            ("openstack.auth_url", &self.openstack.auth_url),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(SgGuardError::Config(format!("{} is required", field)));
            }
        }

        for (i, policy) in self.policies.iter().enumerate() {
            if policy.policy.as_os_str().is_empty() {
                return Err(SgGuardError::Config(format!(
                    "policies[{}].policy is required",
                    i
                )));
            }
            if policy.prefix_message.trim().is_empty() || policy.suffix_message.trim().is_empty()
            {
                return Err(SgGuardError::Config(format!(
                    "policies[{}] needs prefix_message and suffix_message",
                    i
                )));
            }
        }

        if self.openstack.cert.is_some() != self.openstack.key.is_some() {
            return Err(SgGuardError::Config(
                "openstack.cert and openstack.key must be set together".to_string(),
            ));
        }

        crate::scheduler::parse_schedule(&self.check_interval)?;
        crate::scheduler::parse_schedule(&self.reset_interval)?;
        Ok(())
    }

    /// Settle options for the long-running server.
    ///
    /// An approve reaction grants the group in the first attachment of the
    /// reacted message only, so every finding goes out in its own message
    /// unless `batch_size` is set, and a larger batch is rejected.
    pub fn for_server(mut self) -> Result<Self> {
        match self.slack.batch_size {
            None => self.slack.batch_size = Some(1),
            Some(size) if size > 1 => {
                return Err(SgGuardError::Config(format!(
                    "slack.batch_size = {} cannot be approved per finding; use 1 in server mode",
                    size
                )));
            }
            Some(_) => {}
        }
        Ok(self)
    }

    /// Per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Read `[[rules]]` from every file matching `pattern`, in path order.
fn load_included_rules(pattern: &str) -> Result<Vec<AllowEntry>> {
    let paths = glob::glob(pattern)
        .map_err(|e| SgGuardError::Config(format!("invalid include pattern {}: {}", pattern, e)))?;

    let mut rules = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| SgGuardError::Config(e.to_string()))?;
        let content = std::fs::read_to_string(&path)?;
        let included: IncludedRules = parse_with_env(&content)?;
        tracing::debug!(
            "Included {} rules from {}",
            included.rules.len(),
            path.display()
        );
        rules.extend(included.rules);
    }
    Ok(rules)
}

/// Parse TOML, then replace `${VAR_NAME}` and `$VAR_NAME` placeholders inside
/// string values with environment variable values.
///
/// Substituted text is never parsed again, so values may hold quotes,
/// backslashes or further `$` signs. Returns an error containing the variable
/// name if a variable is not set.
fn parse_with_env<T: DeserializeOwned>(content: &str) -> Result<T> {
    // Bare form is uppercase-only so Slack emoji and prose are left alone.
    let placeholder = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Z_][A-Z0-9_]*)")
        .map_err(|e| SgGuardError::Config(e.to_string()))?;

    let mut document: toml::Value = toml::from_str(content)?;
    substitute_env_vars(&placeholder, &mut document)?;
    let parsed: T = document.try_into()?;
    Ok(parsed)
}

fn substitute_env_vars(placeholder: &Regex, value: &mut toml::Value) -> Result<()> {
    match value {
        toml::Value::String(text) => *text = expand_env(placeholder, text)?,
        toml::Value::Array(items) => {
            for item in items {
                substitute_env_vars(placeholder, item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                substitute_env_vars(placeholder, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_env(placeholder: &Regex, input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for cap in placeholder.captures_iter(input) {
        let (Some(whole), Some(name)) = (cap.get(0), cap.get(1).or_else(|| cap.get(2))) else {
            continue;
        };
        let value = std::env::var(name.as_str())
            .map_err(|_| SgGuardError::ConfigEnvVar(name.as_str().to_string()))?;
        out.push_str(&input[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
