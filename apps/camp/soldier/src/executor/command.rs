use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use camp_core::{InstructionType, ReplyPayload};
use tokio::process::Command;

use super::{Executor, ExecutorError};

/// Runs the instruction content with `bash -c`. Content is not sandboxed.
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn kind(&self) -> InstructionType {
        InstructionType::Command
    }

    async fn execute(&self, content: &str) -> Result<ReplyPayload, ExecutorError> {
        let child = Command::new("bash")
            .arg("-c")
            .arg(content)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::TimedOut(self.timeout))??;

        if output.status.success() {
            Ok(ReplyPayload::Command(
                String::from_utf8_lossy(&output.stdout).into_owned(),
            ))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ExecutorError::Failed(format!(
                "{}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn captures_stdout() {
        let executor = CommandExecutor::new(Duration::from_secs(10));
        let reply = executor.execute("echo hello && echo world").await.unwrap();
        assert_eq!(reply, ReplyPayload::Command("hello\nworld\n".into()));
    }

    #[test_timeout::tokio_timeout_test]
    async fn non_zero_exit_is_a_failure_with_stderr() {
        let executor = CommandExecutor::new(Duration::from_secs(10));
        let err = executor.execute("echo nope >&2; exit 3").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("3"), "{message}");
        assert!(message.contains("nope"), "{message}");
    }

    #[test_timeout::tokio_timeout_test]
    async fn runaway_commands_time_out() {
        let executor = CommandExecutor::new(Duration::from_millis(200));
        let err = executor.execute("sleep 5").await.unwrap_err();
        assert!(matches!(err, ExecutorError::TimedOut(_)));
    }
}
