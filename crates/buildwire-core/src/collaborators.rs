// ABOUTME: External services the engine calls out to: code generation, persistence, user prompts.
// ABOUTME: Also ships small in-process implementations used by hosts and tests.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use buildwire_proto::{Contract, StatusDetails};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::thread::ThreadSnapshot;

/// Outcome of one build request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub success: bool,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<String>,
}

impl BuildReport {
    pub fn succeeded(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            ..Default::default()
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
            ..Default::default()
        }
    }

    pub fn status_details(&self) -> StatusDetails {
        StatusDetails {
            agent: self.agent.clone(),
            llm: self.llm.clone(),
            details: Some(self.details.clone()),
        }
    }
}

/// Builds features and answers questions.
#[async_trait]
pub trait CodeGenerationService: Send + Sync {
    async fn handle_build_request(&self, contract: Contract) -> Result<BuildReport>;

    async fn answer_question(&self, question: &str) -> Result<String> {
        let _ = question;
        bail!("question answering is not supported by this generator")
    }
}

/// Receives every thread that reaches a terminal status.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn record_thread(&self, thread: &ThreadSnapshot) -> Result<()>;
}

/// Asks a human for a clarification answer.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    async fn ask(&self, question: &str) -> Result<String>;
}

/// The set of collaborators a session hands to its handlers.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn CodeGenerationService>,
    pub store: Arc<dyn PersistenceStore>,
    pub prompt: Arc<dyn UserPrompt>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            generator: Arc::new(NullCodeGenerator),
            store: Arc::new(MemoryStore::default()),
            prompt: Arc::new(NoPrompt),
        }
    }
}

/// Generator for hosts that do not build anything.
pub struct NullCodeGenerator;

#[async_trait]
impl CodeGenerationService for NullCodeGenerator {
    async fn handle_build_request(&self, _contract: Contract) -> Result<BuildReport> {
        Ok(BuildReport::failed("no code generator is configured"))
    }
}

/// Keeps finished threads in memory.
#[derive(Default)]
pub struct MemoryStore {
    threads: Mutex<Vec<ThreadSnapshot>>,
}

impl MemoryStore {
    pub async fn threads(&self) -> Vec<ThreadSnapshot> {
        self.threads.lock().await.clone()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn record_thread(&self, thread: &ThreadSnapshot) -> Result<()> {
        self.threads.lock().await.push(thread.clone());
        Ok(())
    }
}

/// Prompt for non-interactive hosts.
pub struct NoPrompt;

#[async_trait]
impl UserPrompt for NoPrompt {
    async fn ask(&self, _question: &str) -> Result<String> {
        bail!("no user is available to answer")
    }
}

/// Answers every prompt with the same text.
pub struct StaticPrompt(pub String);

#[async_trait]
impl UserPrompt for StaticPrompt {
    async fn ask(&self, _question: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_generator_reports_failure() {
        let report = NullCodeGenerator
            .handle_build_request(Contract::describe("anything"))
            .await
            .unwrap();
        assert!(!report.success);
        assert!(NullCodeGenerator.answer_question("why?").await.is_err());
    }

    #[tokio::test]
    async fn test_prompts() {
        assert!(NoPrompt.ask("which db?").await.is_err());
        let prompt = StaticPrompt("postgres".to_string());
        assert_eq!(prompt.ask("which db?").await.unwrap(), "postgres");
    }

    #[test]
    fn test_report_status_details() {
        let mut report = BuildReport::succeeded("3 files changed");
        report.llm = Some("claude".to_string());
        let details = report.status_details();
        assert_eq!(details.details.as_deref(), Some("3 files changed"));
        assert_eq!(details.llm.as_deref(), Some("claude"));
        assert!(details.agent.is_none());
    }

    #[test]
    fn test_report_parses_minimal_json() {
        let report: BuildReport =
            serde_json::from_str(r#"{"success": true, "details": "ok"}"#).unwrap();
        assert_eq!(report, BuildReport::succeeded("ok"));
    }
}
