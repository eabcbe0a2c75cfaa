use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{service} responded with status {status}")]
    Upstream { service: &'static str, status: u16 },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bad webhook payload: {0}")]
    Payload(#[from] serde_urlencoded::de::Error),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("tts error: {0}")]
    Tts(String),

    #[error("{0}")]
    Internal(&'static str),
}

impl AppError {
    /// Rate limiting, upstream 5xx and dropped connections are worth another attempt; anything
    /// else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Upstream { status, .. } => *status == 429 || (500..600).contains(status),
            AppError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
