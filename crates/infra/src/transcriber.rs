//! Transcriber port and the external-process adapter.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

/// One failed transcriber invocation.
///
/// Carries the underlying reason and whatever the process wrote to stderr.
/// There is never partial output alongside it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transcriber failed: {reason}, stderr: {stderr}")]
pub struct ExecutionError {
    pub reason: String,
    pub stderr: String,
}

impl ExecutionError {
    pub fn new(reason: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            stderr: stderr.into(),
        }
    }
}

/// Turns an audio file into text.
///
/// Implementations are stateless and may be called repeatedly for the same
/// input; retries and timeouts are the caller's business.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn run(&self, input: &Path) -> Result<String, ExecutionError>;
}

/// Runs `<program> [args...] <input>` and returns its trimmed stdout.
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line, e.g.
    /// `python3 scripts/whisper_transcribe.py`. Returns `None` when blank.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_owned);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    #[instrument(skip(self), fields(program = %self.program), err)]
    async fn run(&self, input: &Path) -> Result<String, ExecutionError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // An abandoned attempt (timeout) drops this future; take the child with it.
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecutionError::new(format!("failed to spawn {}: {e}", self.program), ""))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(ExecutionError::new(output.status.to_string(), stderr));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(chars = text.len(), "transcriber finished");
        Ok(text)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandTranscriber {
        CommandTranscriber::new("sh", vec!["-c".into(), script.into(), "sh".into()])
    }

    #[test]
    fn command_line_is_split_on_whitespace() {
        let t = CommandTranscriber::from_command_line("  python3   scripts/whisper_transcribe.py ")
            .unwrap();
        assert_eq!(t.program(), "python3");
        assert_eq!(t.args, vec!["scripts/whisper_transcribe.py".to_string()]);

        assert!(CommandTranscriber::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn returns_trimmed_stdout() {
        let text = sh("echo '  hello world  '").run(Path::new("/tmp/a.m4a")).await.unwrap();
        assert_eq!(text, "hello world");
    }

    #[tokio::test]
    async fn input_path_is_the_last_argument() {
        let text = sh("echo \"$1\"").run(Path::new("/data/42.m4a")).await.unwrap();
        assert_eq!(text, "/data/42.m4a");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let err = sh("echo partial; echo 'model not found' >&2; exit 3")
            .run(Path::new("/tmp/a.m4a"))
            .await
            .unwrap_err();

        assert_eq!(err.stderr, "model not found");
        assert!(err.reason.contains('3'), "reason was {:?}", err.reason);
        assert!(err.to_string().contains("stderr: model not found"));
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_error() {
        let err = CommandTranscriber::new("/definitely/not/here", vec![])
            .run(Path::new("/tmp/a.m4a"))
            .await
            .unwrap_err();
        assert!(err.reason.starts_with("failed to spawn"));
    }
}
