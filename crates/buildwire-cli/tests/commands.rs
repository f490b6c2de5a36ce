// ABOUTME: Integration tests for the CLI command layer and adapters.
// ABOUTME: Validates envelope files and runs a session that records threads through JsonlStore.

use std::sync::Arc;
use std::time::Duration;

use buildwire_cli::commands::validate_file;
use buildwire_cli::JsonlStore;
use buildwire_client::{MemoryConnector, Session};
use buildwire_core::{BuildwireConfig, Collaborators};
use buildwire_proto::{encode, Actor, Contract, Envelope, MessageType, Status};
use tempfile::TempDir;

// ============================================================================
// validate
// ============================================================================

#[test]
fn test_validate_file_mixed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("envelopes.json");

    let good = Envelope::start(Actor::User, MessageType::BuildFeature)
        .with_status(Status::Initiated)
        .with_contract(Contract::describe("blog"));
    let mut future_version = serde_json::to_value(&good).unwrap();
    future_version["version"] = serde_json::json!("9.0");
    let doc = serde_json::json!([good, future_version]);
    std::fs::write(&path, doc.to_string()).unwrap();

    let (lines, all_valid) = validate_file(&path).unwrap();
    assert!(!all_valid);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("#0: ok build_feature"));
    assert!(lines[1].contains("unsupported protocol version"));
}

#[test]
fn test_validate_file_single_ok() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("one.json");
    let env = Envelope::start(Actor::Coder, MessageType::StatusUpdate);
    std::fs::write(&path, encode(&env).unwrap()).unwrap();

    let (lines, all_valid) = validate_file(&path).unwrap();
    assert!(all_valid);
    assert!(lines[0].contains(&env.message_id));
}

#[test]
fn test_validate_missing_file_is_error() {
    let dir = TempDir::new().unwrap();
    assert!(validate_file(&dir.path().join("nope.json")).is_err());
}

// ============================================================================
// serve-style session
// ============================================================================

#[tokio::test]
async fn test_finished_build_lands_in_jsonl_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonlStore::new(dir.path().join("threads.jsonl")));

    let mut config = BuildwireConfig::default();
    config.identity.actor = Actor::Coder;
    let (connector, mut server) = MemoryConnector::new();
    let collaborators = Collaborators {
        store: store.clone(),
        ..Collaborators::default()
    };
    let session = Session::start(&config, Arc::new(connector), collaborators);
    let mut peer = server.accept().await.unwrap();

    let request = Envelope::start(Actor::User, MessageType::BuildFeature)
        .with_status(Status::Initiated)
        .with_contract(Contract::describe("wiki"));
    peer.send_envelope(&request).unwrap();

    let mut final_status = None;
    while let Ok(Some(reply)) =
        tokio::time::timeout(Duration::from_secs(5), peer.recv_message()).await
    {
        if let Some(status) = reply.status.filter(|s| s.is_terminal()) {
            final_status = Some(status);
            break;
        }
    }
    assert_eq!(final_status, Some(Status::Failed));

    session.shutdown().await.unwrap();
    let recorded = store.load().await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].thread_id, request.thread_id);
    assert_eq!(recorded[0].log.len(), 3);
}
