// ABOUTME: UserPrompt adapter that asks clarification questions on the terminal.
// ABOUTME: Prints the question to stderr and reads one answer line from stdin.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use buildwire_core::UserPrompt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Reads answers from any line source; [`TerminalPrompt::stdin`] is the usual one.
pub struct TerminalPrompt<R> {
    input: Mutex<R>,
}

impl TerminalPrompt<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R> TerminalPrompt<R> {
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(input),
        }
    }
}

#[async_trait]
impl<R> UserPrompt for TerminalPrompt<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn ask(&self, question: &str) -> Result<String> {
        // one question at a time on a shared terminal
        let mut input = self.input.lock().await;

        let mut stderr = tokio::io::stderr();
        stderr
            .write_all(format!("\n? {question}\n> ").as_bytes())
            .await
            .context("failed to write prompt")?;
        stderr.flush().await.context("failed to flush prompt")?;

        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .await
            .context("failed to read answer")?;
        if read == 0 {
            bail!("input closed before an answer was given");
        }
        Ok(line.trim().to_string())
    }
}
