//! Errors raised while talking to the upstream recognition service.

use thiserror::Error;

/// Signer and transport failures.
///
/// None of these are fatal to a relay session: the session turns them into a
/// `false` return (and, where the client must know, an `error` event) and the
/// next `send_audio` call tries again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection lost - upstream socket is closed")]
    ConnectionLost,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_error_display() {
        assert_eq!(
            UpstreamError::Timeout(250).to_string(),
            "Connection timed out after 250ms"
        );
        assert_eq!(
            UpstreamError::ConnectionLost.to_string(),
            "Connection lost - upstream socket is closed"
        );
        assert!(UpstreamError::Signing("missing app key".into())
            .to_string()
            .contains("missing app key"));
    }
}
