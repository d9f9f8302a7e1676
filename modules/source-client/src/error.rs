use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited by upstream, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl GatewayError {
    /// 4xx other than 408/429 means the request itself is wrong and will not
    /// succeed on retry.
    pub fn is_permanent(&self) -> bool {
        match self {
            GatewayError::Api { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            GatewayError::Parse(_) => true,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_permanent_except_throttling() {
        let api = |status| GatewayError::Api {
            status,
            message: String::new(),
        };
        assert!(api(404).is_permanent());
        assert!(api(422).is_permanent());
        assert!(!api(429).is_permanent());
        assert!(!api(408).is_permanent());
        assert!(!api(503).is_permanent());
        assert!(!GatewayError::Timeout("slow".into()).is_permanent());
    }
}
