// ABOUTME: Error types for the buildwire-proto crate.
// ABOUTME: Decode-time rejections are non-fatal to a connection; the message is logged and dropped.

use thiserror::Error;

/// Reasons an inbound payload is rejected by the codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not a JSON object, or a required field is missing or has the wrong type.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The `version` field names a protocol version this build does not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The `type` field is not one of the recognized message types.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Serializer failure while encoding an envelope.
#[derive(Error, Debug)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::MalformedPayload("missing field `threadId`".to_string());
        assert_eq!(err.to_string(), "malformed payload: missing field `threadId`");

        let err = DecodeError::UnsupportedVersion("2.0".to_string());
        assert_eq!(err.to_string(), "unsupported protocol version: 2.0");

        let err = DecodeError::UnknownType("deploy".to_string());
        assert_eq!(err.to_string(), "unknown message type: deploy");
    }
}
