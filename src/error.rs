use crate::signature::SignatureError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("background client already initialized")]
    AlreadyInitialized,
    #[error("background client not initialized")]
    NotInitialized,
    #[error("failed to send message to background service: port not connected")]
    NotConnected,
    #[error("failed to connect to background service: {0}")]
    Connect(#[source] io::Error),
    #[error("session replaced before a response arrived")]
    SessionReplaced,
    #[error("no response within {0:?}")]
    Timeout(std::time::Duration),
    #[error("{0}")]
    Protocol(&'static str),
    #[error("unexpected response payload `{0}`")]
    UnexpectedResponse(String),
    #[error("payload codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("background error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Remote { code: Option<i64>, message: String },
    #[error(transparent)]
    Signature(#[from] SignatureError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_display_includes_code_when_present() {
        let err = ClientError::Remote {
            code: Some(7),
            message: "Wrong password".to_string(),
        };
        assert_eq!(err.to_string(), "background error 7: Wrong password");

        let err = ClientError::Remote {
            code: None,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "background error: boom");
    }
}
