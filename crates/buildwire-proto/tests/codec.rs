// ABOUTME: Integration tests for the buildwire-proto codec.
// ABOUTME: Covers round-trip fidelity and wire compatibility with hand-written payloads.

use buildwire_proto::{
    decode, encode, Actor, Contract, DecodeError, Envelope, MessageType, Messages, Status,
    StatusDetails,
};

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_round_trip_build_conversation() {
    let request = Envelope::start(Actor::User, MessageType::BuildFeature)
        .with_status(Status::Initiated)
        .with_contract(
            Contract::describe("a kanban board")
                .with_requirement("drag and drop")
                .with_setting("framework", serde_json::json!("svelte")),
        );
    let progress = request
        .reply_to(Actor::Coder, MessageType::StatusUpdate)
        .with_status(Status::InProgress)
        .with_status_details(StatusDetails::with_details("scaffolding").llm("gpt"));
    let clarify = request
        .follow_up(Actor::Coder, MessageType::ClarificationNeededFromUser)
        .with_messages(Messages::clarification("columns fixed or dynamic?"));
    let answer = clarify
        .reply_to(Actor::User, MessageType::ClarificationNeededFromUser)
        .with_messages(Messages::response("dynamic"));
    let heartbeat = Envelope::heartbeat("session-1", Actor::System);

    for env in [request, progress, clarify, answer, heartbeat] {
        let bytes = encode(&env).unwrap();
        assert_eq!(decode(&bytes).unwrap(), env);
    }
}

#[test]
fn test_round_trip_preserves_subsecond_timestamp() {
    let env = Envelope::start(Actor::System, MessageType::StatusUpdate);
    let decoded = decode(&encode(&env).unwrap()).unwrap();
    assert_eq!(decoded.timestamp, env.timestamp);
}

// ============================================================================
// Wire compatibility
// ============================================================================

#[test]
fn test_decode_full_wire_example() {
    let payload = r#"{
        "version": "1.0",
        "messageId": "msg-42",
        "threadId": "thread-7",
        "actor": "Coder",
        "type": "status_update",
        "status": "Completed",
        "timestamp": "2024-06-01T09:30:15.250Z",
        "origin": {
            "originMessageId": "msg-1",
            "originActor": "User",
            "respondingToMessageId": "msg-1",
            "respondingToActor": "User"
        },
        "body": {
            "contract": {},
            "messages": {},
            "statusDetails": {"agent": "coder-2", "LLM": "claude", "details": "all tests green"}
        }
    }"#;

    let env = decode(payload.as_bytes()).unwrap();
    assert_eq!(env.kind, MessageType::StatusUpdate);
    assert_eq!(env.status, Some(Status::Completed));
    assert_eq!(env.responding_to(), Some("msg-1"));
    assert_eq!(env.origin.responding_to_actor, Some(Actor::User));
    assert_eq!(env.details(), Some("all tests green"));
    assert_eq!(
        env.body.status_details.as_ref().unwrap().llm.as_deref(),
        Some("claude")
    );
}

#[test]
fn test_decode_errors_are_distinguishable() {
    let unknown = br#"{"version":"1.0","type":"teleport"}"#;
    let old = br#"{"version":"0.1","type":"heartbeat"}"#;
    let broken = br#"{"version":"1.0","type":"heartbeat"}"#;

    assert!(matches!(decode(unknown), Err(DecodeError::UnknownType(_))));
    assert!(matches!(decode(old), Err(DecodeError::UnsupportedVersion(_))));
    assert!(matches!(decode(broken), Err(DecodeError::MalformedPayload(_))));
}
