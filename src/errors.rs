use std::io;
use std::time::Duration;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rate limit budget not available within {0:?}")]
    RateLimitTimeout(Duration),
    #[error("geocoding provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("geocoding provider throttled the request")]
    Throttled { retry_after: Option<Duration> },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AppError::InvalidInput(message.into())
    }

    /// Whether a caller may usefully repeat the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::RateLimitTimeout(_)
                | AppError::ProviderUnavailable(_)
                | AppError::Throttled { .. }
                | AppError::Http(_)
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            AppError::InvalidInput(message) => message.clone(),
            AppError::RateLimitTimeout(_) => {
                "Location service is busy, please try again in a moment".into()
            }
            AppError::ProviderUnavailable(_) | AppError::Throttled { .. } | AppError::Http(_) => {
                "Geocoding service temporarily unavailable, please try again".into()
            }
            _ => "Failed to process location".into(),
        }
    }

    /// Collapses transport level failures into the provider taxonomy.
    pub(crate) fn into_provider_error(self) -> Self {
        match self {
            AppError::Http(err) => AppError::ProviderUnavailable(err.to_string()),
            AppError::Json(err) => {
                AppError::ProviderUnavailable(format!("malformed provider response: {err}"))
            }
            AppError::Throttled { .. } => {
                AppError::ProviderUnavailable("upstream rate limit reached".into())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_errors() {
        assert!(AppError::RateLimitTimeout(Duration::from_secs(1)).is_retryable());
        assert!(AppError::ProviderUnavailable("down".into()).is_retryable());
        assert!(!AppError::invalid("bad").is_retryable());
        assert!(!AppError::Config("missing".into()).is_retryable());
    }

    #[test]
    fn throttling_surfaces_as_unavailable() {
        let err = AppError::Throttled {
            retry_after: Some(Duration::from_secs(3)),
        }
        .into_provider_error();
        assert!(matches!(err, AppError::ProviderUnavailable(_)));
        assert!(err.user_message().contains("try again"));
    }
}
