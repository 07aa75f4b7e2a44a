use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error("provider {provider} rejected the request: {message}")]
    ProviderRejected { provider: String, message: String },
    #[error("provider {provider} rate limited the request")]
    RateLimited { provider: String },
    #[error("operation timed out after {0}ms")]
    Timeout(u64),
    #[error("http error: {0}")]
    Http(String),
    #[error("vector store error: {0}")]
    Store(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

impl AppError {
    /// Whether the retry executor should attempt the operation again.
    /// Rate limits and transient transport failures are retryable; auth
    /// rejections and malformed requests are fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Timeout(_) | AppError::RateLimited { .. } => true,
            AppError::Http(_) | AppError::Store(_) => true,
            AppError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return AppError::Timeout(0);
        }
        if let Some(status) = err.status() {
            let provider = err
                .url()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "unknown".into());
            let code = status.as_u16();
            if code == 429 {
                return AppError::RateLimited { provider };
            }
            if matches!(code, 408 | 502 | 503 | 504) {
                return AppError::Http(format!("transient status {code}"));
            }
            return AppError::ProviderRejected {
                provider,
                message: format!("status {code}"),
            };
        }
        AppError::Http(err.to_string())
    }
}
