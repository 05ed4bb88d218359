use reqwest::StatusCode;

/// Everything that can go wrong between asking for an update and holding a
/// verified, decrypted package on disk.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    Verification { expected: String, actual: String },
    #[error("file error: {0}")]
    File(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid server response: {0}")]
    Parse(String),
    #[error("no version found")]
    NoVersion,
}

impl UpdateError {
    /// Transport failures and server-side errors may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Server { .. })
    }

    /// Classify a non-success HTTP response. Consumes the body for the message.
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_owned()
            });

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Auth(message),
            _ => Self::Server {
                status: status.as_u16(),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Parse(e.to_string())
        } else {
            Self::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_server_errors_retry() {
        assert!(UpdateError::Network("reset".into()).is_retryable());
        assert!(UpdateError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_retryable());

        assert!(!UpdateError::Auth("invalid token".into()).is_retryable());
        assert!(!UpdateError::NoVersion.is_retryable());
        assert!(!UpdateError::Config("bad key".into()).is_retryable());
        assert!(!UpdateError::Verification {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }
}
