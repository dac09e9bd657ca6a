// Firewall Backend
//
// The boundary between the harness and the host firewall. The controller
// only ever talks to a RuleBackend; production uses iptables, tests use an
// in-memory table.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::FirewallConfig;
use crate::error::RuleError;
use crate::exec::{CommandOutput, CommandRunner};

/// Host firewall operations used by the harness
#[async_trait]
pub trait RuleBackend: Send + Sync {
    /// Full human-readable rule listing
    async fn list(&self) -> Result<String, RuleError>;

    /// Insert a rule at the head of `chain` diverting TCP traffic for `port`
    /// to NFQUEUE `queue_num`
    async fn insert_redirect(&self, chain: &str, port: u16, queue_num: u16) -> Result<(), RuleError>;

    /// Delete the rule at 1-based `position` in `chain`
    async fn delete_at(&self, chain: &str, position: usize) -> Result<(), RuleError>;

    /// Version string of the firewall tool
    async fn version(&self) -> Result<String, RuleError>;

    /// Backend name for logs
    fn name(&self) -> &str;
}

/// iptables-backed implementation
#[derive(Debug, Clone)]
pub struct IptablesBackend {
    binary: String,
    runner: CommandRunner,
}

impl IptablesBackend {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            runner: CommandRunner::new(Duration::from_secs(config.command_timeout_secs)),
        }
    }

    /// Run iptables with `args`, mapping spawn failures, timeouts and nonzero
    /// exits through `on_error`
    async fn invoke<F>(&self, args: &[&str], on_error: F) -> Result<CommandOutput, RuleError>
    where
        F: FnOnce(String, String) -> RuleError,
    {
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!("Running firewall command: {}", command);

        let output = match self.runner.run(&self.binary, args).await {
            Ok(output) => output,
            Err(e) => return Err(on_error(command, e.to_string())),
        };

        if output.timed_out {
            return Err(RuleError::Timeout {
                command,
                timeout_ms: self.runner.timeout().as_millis() as u64,
            });
        }
        if !output.success {
            return Err(on_error(command, output.failure_reason()));
        }

        Ok(output)
    }
}

#[async_trait]
impl RuleBackend for IptablesBackend {
    async fn list(&self) -> Result<String, RuleError> {
        let output = self
            .invoke(&["-L", "-n"], |command, message| {
                RuleError::Query(format!("Error executing '{}' {}", command, message))
            })
            .await?;
        Ok(output.stdout)
    }

    async fn insert_redirect(&self, chain: &str, port: u16, queue_num: u16) -> Result<(), RuleError> {
        info!(
            "Inserting NFQUEUE {} redirect for tcp port {} into {}",
            queue_num, port, chain
        );
        let port = port.to_string();
        let queue = queue_num.to_string();
        self.invoke(
            &[
                "-I", chain, "-p", "tcp", "--dport", &port, "-j", "NFQUEUE", "--queue-num", &queue,
            ],
            |command, message| RuleError::Command { command, message },
        )
        .await?;
        Ok(())
    }

    async fn delete_at(&self, chain: &str, position: usize) -> Result<(), RuleError> {
        info!("Deleting rule {} from {}", position, chain);
        let position = position.to_string();
        self.invoke(&["-D", chain, &position], |command, message| {
            RuleError::Command { command, message }
        })
        .await?;
        Ok(())
    }

    async fn version(&self) -> Result<String, RuleError> {
        let output = self
            .invoke(&["--version"], |command, message| {
                RuleError::Query(format!("Error executing '{}' {}", command, message))
            })
            .await?;
        Ok(output.stdout.trim_end().to_string())
    }

    fn name(&self) -> &str {
        &self.binary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with(binary: &str) -> IptablesBackend {
        IptablesBackend::new(&FirewallConfig {
            binary: binary.to_string(),
            ..FirewallConfig::default()
        })
    }

    #[tokio::test]
    async fn test_missing_binary_is_query_error() {
        let backend = backend_with("/nonexistent/iptables");
        match backend.list().await {
            Err(RuleError::Query(message)) => assert!(message.contains("-L -n")),
            other => panic!("expected query error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        // `false` ignores its arguments and exits 1
        let backend = backend_with("false");

        assert!(matches!(backend.list().await, Err(RuleError::Query(_))));
        match backend.delete_at("INPUT", 1).await {
            Err(RuleError::Command { command, message }) => {
                assert_eq!(command, "false -D INPUT 1");
                assert_eq!(message, "Code: 1");
            }
            other => panic!("expected command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listing_passes_stdout_through() {
        // `echo` stands in for iptables and prints its arguments
        let backend = backend_with("echo");
        assert_eq!(backend.list().await.unwrap(), "-L -n\n");
        assert_eq!(backend.version().await.unwrap(), "--version");
        assert_eq!(backend.name(), "echo");
    }
}
