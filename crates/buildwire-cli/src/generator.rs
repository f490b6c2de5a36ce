// ABOUTME: Code generator adapter that runs a configured external program per request.
// ABOUTME: The request goes to the child's stdin as JSON; the last stdout line becomes the details.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use buildwire_core::config::GeneratorConfig;
use buildwire_core::{BuildReport, CodeGenerationService};
use buildwire_proto::Contract;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Environment variable telling the child which kind of request it got.
pub const REQUEST_KIND_ENV: &str = "BUILDWIRE_REQUEST";

/// Runs `generator.command` for every build request and question.
#[derive(Debug, Clone)]
pub struct CommandCodeGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

struct RunOutput {
    success: bool,
    stdout: String,
    stderr: String,
    code: Option<i32>,
}

impl CommandCodeGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// None when no command is configured.
    pub fn from_config(config: &GeneratorConfig) -> Option<Self> {
        let program = config.command.as_ref()?;
        Some(Self::new(
            program.clone(),
            config.args.clone(),
            Duration::from_secs(config.timeout_secs.max(1)),
        ))
    }

    fn agent_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.clone())
    }

    /// Ok(None) when the child exceeded the timeout and was killed.
    async fn run(&self, kind: &str, input: &[u8]) -> Result<Option<RunOutput>> {
        tracing::debug!(program = %self.program, args = ?self.args, kind, "spawning generator");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(REQUEST_KIND_ENV, kind)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn generator '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .context("failed to write request to generator stdin")?;
            // dropping stdin signals EOF
        }

        // on timeout the wait future is dropped and kill_on_drop reaps the child
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.context("failed to wait for generator")?,
            Err(_) => {
                tracing::error!(
                    program = %self.program,
                    timeout_secs = self.timeout.as_secs(),
                    "generator timed out"
                );
                return Ok(None);
            }
        };

        Ok(Some(RunOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        }))
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

#[async_trait]
impl CodeGenerationService for CommandCodeGenerator {
    async fn handle_build_request(&self, contract: Contract) -> Result<BuildReport> {
        let input = serde_json::to_vec(&contract).context("failed to serialize contract")?;

        let Some(output) = self.run("build", &input).await? else {
            return Ok(BuildReport::failed(format!(
                "generator timed out after {}s",
                self.timeout.as_secs()
            )));
        };

        let details = last_line(&output.stdout)
            .or_else(|| last_line(&output.stderr))
            .map(str::to_string)
            .unwrap_or_else(|| match output.code {
                Some(code) => format!("generator exited with status {code}"),
                None => "generator was terminated by a signal".to_string(),
            });

        let mut report = if output.success {
            BuildReport::succeeded(details)
        } else {
            BuildReport::failed(details)
        };
        report.agent = Some(self.agent_name());
        Ok(report)
    }

    async fn answer_question(&self, question: &str) -> Result<String> {
        let Some(output) = self.run("question", question.as_bytes()).await? else {
            bail!("generator timed out after {}s", self.timeout.as_secs());
        };
        if !output.success {
            bail!(
                "generator failed: {}",
                last_line(&output.stderr).unwrap_or("no output")
            );
        }
        Ok(output.stdout.trim().to_string())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, timeout: Duration) -> CommandCodeGenerator {
        CommandCodeGenerator::new("sh", vec!["-c".to_string(), script.to_string()], timeout)
    }

    #[test]
    fn test_from_config_requires_command() {
        assert!(CommandCodeGenerator::from_config(&GeneratorConfig::default()).is_none());

        let config = GeneratorConfig {
            command: Some("/usr/local/bin/codegen".to_string()),
            args: vec!["--fast".to_string()],
            timeout_secs: 5,
        };
        let generator = CommandCodeGenerator::from_config(&config).unwrap();
        assert_eq!(generator.agent_name(), "codegen");
        assert_eq!(generator.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_last_line_skips_blanks() {
        assert_eq!(last_line("one\ntwo\n\n  \n"), Some("two"));
        assert_eq!(last_line("\n\n"), None);
    }

    #[tokio::test]
    async fn test_success_uses_last_stdout_line() {
        let generator = shell(
            "cat > /dev/null; echo building; echo 'deployed to /tmp/app'",
            Duration::from_secs(10),
        );
        let report = generator
            .handle_build_request(Contract::describe("todo"))
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.details, "deployed to /tmp/app");
        assert_eq!(report.agent.as_deref(), Some("sh"));
    }

    #[tokio::test]
    async fn test_contract_arrives_on_stdin() {
        let generator = shell("grep -o todo-app", Duration::from_secs(10));
        let report = generator
            .handle_build_request(Contract::describe("todo-app"))
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.details, "todo-app");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failed() {
        let generator = shell("cat > /dev/null; echo 'tests red' >&2; exit 3", Duration::from_secs(10));
        let report = generator
            .handle_build_request(Contract::default())
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(report.details, "tests red");
    }

    #[tokio::test]
    async fn test_timeout_reports_failure() {
        let generator = shell("sleep 30", Duration::from_millis(200));
        let report = generator
            .handle_build_request(Contract::default())
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.details.contains("timed out"));
    }

    #[tokio::test]
    async fn test_answer_question_returns_stdout() {
        let generator = shell(
            "read q; echo \"$BUILDWIRE_REQUEST: $q\"",
            Duration::from_secs(10),
        );
        let answer = generator.answer_question("why rust?").await.unwrap();
        assert_eq!(answer, "question: why rust?");
    }
}
