use thiserror::Error;

/// Unified error type for the sgguard library.
#[derive(Debug, Error)]
pub enum SgGuardError {
    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Inventory fetch error: {0}")]
    InventoryFetch(String),

    #[error("Policy load error ({policy}): {reason}")]
    PolicyLoad { policy: String, reason: String },

    #[error("Policy evaluation error: {0}")]
    PolicyEval(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Exception store error: {0}")]
    ExceptionStore(String),

    #[error("Chat API error: {0}")]
    Chat(String),

    #[error("Reacted message {ts} not found in channel {channel} history")]
    MessageNotFound { channel: String, ts: String },

    #[error("Message {0} has no attachment with an ID field")]
    MissingGroupId(String),

    #[error("Chat gateway rejected the credentials")]
    InvalidAuth,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Environment variable not set: {0}")]
    ConfigEnvVar(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, SgGuardError>;
