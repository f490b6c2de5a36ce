// ABOUTME: Error types for the buildwire-client crate.
// ABOUTME: Structured errors for addressing, connecting, streaming and reconnection.

use buildwire_core::ProtocolError;
use thiserror::Error;

/// Errors that can occur in the connection layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// Invalid server address format.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Failed to connect to the server.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection dropped or went silent.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A send was attempted while no connection is established.
    #[error("not connected")]
    NotConnected,

    /// The connection manager is gone.
    #[error("stream closed unexpectedly")]
    StreamClosed,

    /// Error on the WebSocket stream.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Every reconnection attempt failed.
    #[error("reconnection abandoned after {attempts} attempts")]
    ReconnectAbandoned { attempts: u32 },
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectionError::WebSocket(err.to_string())
    }
}

impl From<url::ParseError> for ConnectionError {
    fn from(err: url::ParseError) -> Self {
        ConnectionError::InvalidAddress(err.to_string())
    }
}

impl From<ConnectionError> for ProtocolError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotConnected => ProtocolError::NotConnected,
            ConnectionError::ConnectionLost(reason) => ProtocolError::ConnectionLost(reason),
            other => ProtocolError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectionError::InvalidAddress("not a url".to_string());
        assert_eq!(err.to_string(), "invalid server address: not a url");

        let err = ConnectionError::ReconnectAbandoned { attempts: 5 };
        assert_eq!(err.to_string(), "reconnection abandoned after 5 attempts");
    }

    #[test]
    fn test_into_protocol_error() {
        assert!(matches!(
            ProtocolError::from(ConnectionError::NotConnected),
            ProtocolError::NotConnected
        ));
        assert!(matches!(
            ProtocolError::from(ConnectionError::ConnectionLost("silent".into())),
            ProtocolError::ConnectionLost(reason) if reason == "silent"
        ));
        assert!(matches!(
            ProtocolError::from(ConnectionError::StreamClosed),
            ProtocolError::Transport(_)
        ));
    }

    #[test]
    fn test_from_url_error() {
        let err: ConnectionError = url::Url::parse("::nope").unwrap_err().into();
        assert!(matches!(err, ConnectionError::InvalidAddress(_)));
    }
}
