// ABOUTME: JSON codec for protocol envelopes.
// ABOUTME: Validates version and type before full deserialization so errors are specific.

use serde_json::Value;

use crate::envelope::{Envelope, MessageType};
use crate::error::{DecodeError, EncodeError};

/// Version stamped on every envelope this build emits.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Versions this build accepts on decode.
pub const SUPPORTED_VERSIONS: &[&str] = &[PROTOCOL_VERSION];

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Parse raw bytes into an envelope.
///
/// Checks run in order: JSON object, `version`, `type`, then the full
/// structure. An unrecognized version or type is reported as such even when
/// other fields are also broken.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    check_header(&value)?;

    serde_json::from_value(value).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}

fn check_header(value: &Value) -> Result<(), DecodeError> {
    let object = value.as_object().ok_or_else(|| {
        DecodeError::MalformedPayload("envelope must be a JSON object".to_string())
    })?;

    match object.get("version") {
        Some(Value::String(version)) if is_supported_version(version) => {}
        Some(Value::String(version)) => {
            return Err(DecodeError::UnsupportedVersion(version.clone()));
        }
        Some(_) => {
            return Err(DecodeError::MalformedPayload(
                "field `version` must be a string".to_string(),
            ));
        }
        None => {
            return Err(DecodeError::MalformedPayload(
                "missing field `version`".to_string(),
            ));
        }
    }

    match object.get("type") {
        Some(Value::String(kind)) => {
            kind.parse::<MessageType>()?;
        }
        Some(_) => {
            return Err(DecodeError::MalformedPayload(
                "field `type` must be a string".to_string(),
            ));
        }
        None => {
            return Err(DecodeError::MalformedPayload(
                "missing field `type`".to_string(),
            ));
        }
    }

    Ok(())
}

/// Serialize an envelope to JSON bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Actor, Status};

    fn valid_json() -> Value {
        serde_json::json!({
            "version": "1.0",
            "messageId": "m-1",
            "threadId": "t-1",
            "actor": "User",
            "type": "build_feature",
            "status": "Initiated",
            "timestamp": "2024-05-01T12:00:00Z",
            "origin": {
                "originMessageId": "m-1",
                "originActor": "User"
            },
            "body": {
                "contract": {
                    "metadata": {"description": "todo app"},
                    "requirements": ["persist items"]
                }
            }
        })
    }

    fn decode_value(value: &Value) -> Result<Envelope, DecodeError> {
        decode(value.to_string().as_bytes())
    }

    #[test]
    fn test_decode_valid() {
        let env = decode_value(&valid_json()).unwrap();
        assert_eq!(env.message_id, "m-1");
        assert_eq!(env.thread_id, "t-1");
        assert_eq!(env.actor, Actor::User);
        assert_eq!(env.kind, MessageType::BuildFeature);
        assert_eq!(env.status, Some(Status::Initiated));
        let contract = env.body.contract.unwrap();
        assert_eq!(contract.description(), Some("todo app"));
        assert_eq!(contract.requirements, vec!["persist items"]);
    }

    #[test]
    fn test_decode_not_json() {
        let err = decode(b"not json at all").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(_)));
    }

    #[test]
    fn test_decode_not_an_object() {
        let err = decode(b"[1,2,3]").unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(msg) if msg.contains("object")));
    }

    #[test]
    fn test_decode_missing_version() {
        let mut value = valid_json();
        value.as_object_mut().unwrap().remove("version");
        let err = decode_value(&value).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(msg) if msg.contains("version")));
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut value = valid_json();
        value["version"] = Value::String("2.0".to_string());
        assert_eq!(
            decode_value(&value).unwrap_err(),
            DecodeError::UnsupportedVersion("2.0".to_string())
        );
    }

    #[test]
    fn test_decode_numeric_version_is_malformed() {
        let mut value = valid_json();
        value["version"] = serde_json::json!(1.0);
        assert!(matches!(
            decode_value(&value).unwrap_err(),
            DecodeError::MalformedPayload(_)
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut value = valid_json();
        value["type"] = Value::String("deploy_everything".to_string());
        assert_eq!(
            decode_value(&value).unwrap_err(),
            DecodeError::UnknownType("deploy_everything".to_string())
        );
    }

    #[test]
    fn test_unknown_type_wins_over_missing_fields() {
        let value = serde_json::json!({"version": "1.0", "type": "mystery"});
        assert_eq!(
            decode_value(&value).unwrap_err(),
            DecodeError::UnknownType("mystery".to_string())
        );
    }

    #[test]
    fn test_decode_missing_thread_id() {
        let mut value = valid_json();
        value.as_object_mut().unwrap().remove("threadId");
        let err = decode_value(&value).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload(msg) if msg.contains("threadId")));
    }

    #[test]
    fn test_decode_unknown_actor_is_malformed() {
        let mut value = valid_json();
        value["actor"] = Value::String("Robot".to_string());
        assert!(matches!(
            decode_value(&value).unwrap_err(),
            DecodeError::MalformedPayload(_)
        ));
    }

    #[test]
    fn test_decode_bad_status_is_malformed() {
        let mut value = valid_json();
        value["status"] = Value::String("Done".to_string());
        assert!(matches!(
            decode_value(&value).unwrap_err(),
            DecodeError::MalformedPayload(_)
        ));
    }

    #[test]
    fn test_decode_bad_timestamp_is_malformed() {
        let mut value = valid_json();
        value["timestamp"] = Value::String("yesterday".to_string());
        assert!(matches!(
            decode_value(&value).unwrap_err(),
            DecodeError::MalformedPayload(_)
        ));
    }

    #[test]
    fn test_decode_status_absent_and_null() {
        let mut value = valid_json();
        value.as_object_mut().unwrap().remove("status");
        assert_eq!(decode_value(&value).unwrap().status, None);

        value["status"] = Value::Null;
        assert_eq!(decode_value(&value).unwrap().status, None);
    }

    #[test]
    fn test_decode_missing_body_defaults() {
        let mut value = valid_json();
        value.as_object_mut().unwrap().remove("body");
        let env = decode_value(&value).unwrap();
        assert!(env.body.contract.is_none());
    }

    #[test]
    fn test_encode_uses_wire_names() {
        let env = decode_value(&valid_json()).unwrap();
        let value: Value = serde_json::from_slice(&encode(&env).unwrap()).unwrap();
        assert_eq!(value["type"], "build_feature");
        assert_eq!(value["messageId"], "m-1");
        assert_eq!(value["origin"]["originActor"], "User");
        assert!(value["origin"].get("respondingToMessageId").is_none());
    }

    #[test]
    fn test_supported_versions() {
        assert!(is_supported_version("1.0"));
        assert!(!is_supported_version("0.9"));
    }
}
