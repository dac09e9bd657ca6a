//! Bounded Command Execution
//!
//! Every external command the harness issues (firewall listing, rule
//! mutation, tool version probes) goes through [`CommandRunner`], which
//! captures output and enforces a timeout so a wedged firewall tool cannot
//! stall the run.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

/// Default timeout for external commands in seconds
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 5;

/// Captured result of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited with status zero
    pub success: bool,

    /// Standard output (lossy UTF-8)
    pub stdout: String,

    /// Standard error (lossy UTF-8)
    pub stderr: String,

    /// Exit code (None if terminated by a signal or timed out)
    pub exit_code: Option<i32>,

    /// Whether the timeout expired before the command finished
    pub timed_out: bool,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl CommandOutput {
    /// Short human-readable description of a failed command
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            format!("timed out after {}ms", self.duration_ms)
        } else {
            let stderr = self.stderr.trim();
            match self.exit_code {
                Some(code) if stderr.is_empty() => format!("Code: {}", code),
                Some(code) => format!("Code: {} ({})", code, stderr),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

/// Runs external commands with a fixed timeout
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS))
    }
}

impl CommandRunner {
    /// Create a runner with the given timeout
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Get the timeout duration
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `program` with `args` and capture its output
    ///
    /// # Errors
    ///
    /// Returns an error only if the process cannot be spawned or waited on.
    /// A nonzero exit status or an expired timeout is reported through the
    /// returned [`CommandOutput`].
    pub async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let start = Instant::now();
        debug!("Executing: {} {}", program, args.join(" "));

        let child = TokioCommand::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                // The child handle was moved into wait_with_output; dropping the
                // future kills it because of kill_on_drop.
                warn!("Command `{}` timed out after {:?}", program, self.timeout);
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    timed_out: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        };

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
            timed_out: false,
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if !result.success {
            debug!(
                "Command `{}` failed (exit code: {:?})",
                program, result.exit_code
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_default_timeout() {
        let runner = CommandRunner::default();
        assert_eq!(runner.timeout(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_echo() {
        let runner = CommandRunner::default();
        let output = runner.run("echo", &["hello world"]).await.unwrap();

        assert!(output.success);
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "hello world\n");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_run_failing_command() {
        let runner = CommandRunner::default();
        let output = runner.run("sh", &["-c", "echo oops >&2; exit 3"]).await.unwrap();

        assert!(!output.success);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.failure_reason(), "Code: 3 (oops)");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let runner = CommandRunner::new(Duration::from_millis(200));
        let output = runner.run("sleep", &["5"]).await.unwrap();

        assert!(output.timed_out);
        assert!(!output.success);
        assert!(output.failure_reason().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let runner = CommandRunner::default();
        let result = runner.run("/nonexistent/ips-harness-tool", &[]).await;
        assert!(result.is_err());
    }
}
