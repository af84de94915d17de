use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Status channel open failed: {0}")]
    ChannelOpenFailure(String),

    #[error("Status channel closed by peer")]
    ChannelClosedByPeer,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Notifications unavailable: {0}")]
    NotificationUnavailable(String),

    #[error("Stored registry is corrupt: {0}")]
    PersistenceCorrupt(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Printer not found: {0}")]
    PrinterNotFound(i64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
