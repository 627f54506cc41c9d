use thiserror::Error;

/// Failures surfaced by a market source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("venue returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode venue payload: {0}")]
    Decode(String),

    #[error("websocket is not connected")]
    NotConnected,

    #[error("subscribe rejected: {0}")]
    Subscribe(String),

    #[error("source is closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Failures surfaced by the broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("broker request failed: {0}")]
    Transport(String),
}
