// src/error.rs
// Standardized error types for the bot core

use thiserror::Error;

/// Main error type for the bot library.
///
/// Variants are distinguished by behavior, not by origin: handlers pick the
/// user-facing reply and the retry policy off the variant alone.
#[derive(Error, Debug)]
pub enum BotError {
    /// Upstream timed out, returned 5xx, or refused with 429. Retried by the
    /// scrape client; surfaces only after every mirror is exhausted.
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// The query was valid but upstream holds no matching data. Counted
    /// separately from errors.
    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Request denied by the keyed rate limiter. Carries the seconds until
    /// the bucket refills enough for one more request.
    #[error("rate limited, retry in {0}s")]
    RateLimited(u64),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An LLM-parsed intent arrived without a required parameter.
    #[error("missing parameter: {0}")]
    MissingParameter(String),

    /// The request context was cancelled. Never shown to the user.
    #[error("cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using BotError
pub type Result<T> = std::result::Result<T, BotError>;

impl BotError {
    /// Whether this error should be retried by the scrape client.
    pub fn is_transient(&self) -> bool {
        matches!(self, BotError::Upstream(_))
    }
}

impl From<String> for BotError {
    fn from(s: String) -> Self {
        BotError::Other(s)
    }
}

impl From<tokio::task::JoinError> for BotError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            BotError::Cancelled
        } else {
            BotError::Other(err.to_string())
        }
    }
}

impl From<BotError> for String {
    fn from(err: BotError) -> Self {
        err.to_string()
    }
}
