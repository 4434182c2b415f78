use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("remote error ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("event stream failed: {0}")]
    Stream(String),
    #[error("{binary} failed: {stderr}")]
    ChildProcess { binary: String, stderr: String },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("operation conflict: {0}")]
    Concurrency(String),
    #[error("input required: {0}")]
    NeedsInput(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Sql(#[from] sqlx::Error),
}

impl AppError {
    /// True when the caller should gather more input and retry instead of
    /// treating this as a hard failure.
    pub fn is_needs_input(&self) -> bool {
        matches!(self, AppError::NeedsInput(_))
    }
}

pub type AppResult<T> = Result<T, AppError>;
