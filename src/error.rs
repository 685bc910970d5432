use thiserror::Error;

/// All errors produced while collecting funding data.
///
/// The variants mirror how the collection loop reacts:
/// - `Transient`: retried with exponential backoff
/// - `Protocol`: logged, the affected cycle is aborted, no immediate retry
/// - `NotFound`: the contract is dropped from polling until rediscovered
/// - `Fatal`: the exchange loop stops (the instance keeps running)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectorError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("contract not found: {0}")]
    NotFound(String),

    #[error("fatal for exchange {exchange}: {reason}")]
    Fatal { exchange: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type CollectorResult<T> = Result<T, CollectorError>;

impl CollectorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return Self::Transient(e.to_string());
        }

        if let Some(status) = e.status() {
            return classify_status(status.as_u16(), &e.to_string());
        }

        if e.is_body() {
            return Self::Transient(e.to_string());
        }

        Self::Protocol(e.to_string())
    }
}

impl From<sqlx::Error> for CollectorError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::Transient(e.to_string()),
            // serialization failure, deadlock, admin shutdown
            sqlx::Error::Database(ref db)
                if matches!(db.code().as_deref(), Some("40001" | "40P01" | "57P01")) =>
            {
                Self::Transient(e.to_string())
            }
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed response: {e}"))
    }
}

/// Maps an HTTP status code to the collector error taxonomy.
///
/// 429 and 418 are rate-limit signals (Binance answers 418 once an IP is
/// banned for ignoring 429s).
pub fn classify_status(status: u16, body: &str) -> CollectorError {
    match status {
        408 | 418 | 425 | 429 | 500..=599 => {
            CollectorError::Transient(format!("http {status}: {body}"))
        }
        404 => CollectorError::NotFound(format!("http {status}: {body}")),
        _ => CollectorError::Protocol(format!("http {status}: {body}")),
    }
}
