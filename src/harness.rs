//! Test orchestration driver.
//!
//! Runs the fixed protocol on a single task:
//!
//! 1. Preconditions (privilege, subject executable)
//! 2. Bind the receiver (fatal on failure)
//! 3. Firewall tool version and pre-existing rule check
//! 4. Baseline rounds with no rule and no subject
//! 5. Install and verify the redirect rule
//! 6. Start the subject, run permitted and forbidden rounds, stop it
//! 7. Remove the rule and verify the table is back to its prior state
//!
//! Only steps 1 and 2 can abort the run. Everything after the receiver is
//! bound records FAIL outcomes and keeps going so that cleanup always runs.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::HarnessError;
use crate::firewall::{is_root, FirewallRuleController, RuleBackend};
use crate::report::ResultAccumulator;
use crate::rounds::EchoRoundRunner;
use crate::subject::SubjectProcessController;

/// Switches that relax preconditions
#[derive(Debug, Clone, Default)]
pub struct HarnessOptions {
    /// Skip the root check (for unprivileged dry runs against a fake backend)
    pub skip_privilege_check: bool,
}

/// Drives one complete validation run
pub struct Harness {
    config: Config,
    backend: Arc<dyn RuleBackend>,
    options: HarnessOptions,
}

impl Harness {
    pub fn new(config: Config, backend: Arc<dyn RuleBackend>, options: HarnessOptions) -> Self {
        Self {
            config,
            backend,
            options,
        }
    }

    /// Run the full protocol
    ///
    /// # Errors
    ///
    /// Only precondition failures and listener bind failures are returned;
    /// every other problem is recorded in the accumulator.
    pub async fn run(&self) -> Result<ResultAccumulator, HarnessError> {
        let subject_path = self.check_preconditions()?;

        // Nothing is recorded until the listener is bound
        let runner = EchoRoundRunner::bind(&self.config.rounds)?;
        let port = match self.config.rounds.port {
            0 => runner.local_addr().port(),
            port => port,
        };

        let controller = FirewallRuleController::new(self.backend.clone(), &self.config.firewall);
        let mut acc = ResultAccumulator::live();

        match controller.tool_version().await {
            Ok(version) => acc.record_pass(version),
            Err(e) => acc.record_fail(e.to_string()),
        }

        let rules_before = self.check_existing_rules(&controller, &mut acc).await;

        info!("Testing communication without IPS");
        let acc = self.run_baseline(&runner, acc).await;

        info!("Testing communication with IPS");
        let acc = self
            .run_with_subject(&controller, &runner, &subject_path, port, rules_before, acc)
            .await;

        Ok(acc)
    }

    /// Only the baseline rounds; needs neither root nor a subject
    pub async fn run_baseline_only(&self) -> Result<ResultAccumulator, HarnessError> {
        let runner = EchoRoundRunner::bind(&self.config.rounds)?;
        info!("Testing communication without IPS");
        Ok(self.run_baseline(&runner, ResultAccumulator::live()).await)
    }

    fn check_preconditions(&self) -> Result<PathBuf, HarnessError> {
        if !self.options.skip_privilege_check && !is_root() {
            return Err(HarnessError::Precondition(
                "harness not started as root".to_string(),
            ));
        }

        let path = self.config.subject.executable.clone().ok_or_else(|| {
            HarnessError::Precondition("no subject executable configured".to_string())
        })?;
        if !path.exists() {
            return Err(HarnessError::Precondition(format!(
                "subject executable {:?} does not exist",
                path
            )));
        }

        Ok(path)
    }

    /// Record whether a rule already exists for the test port; returns the
    /// marker line count so cleanup can be checked against it
    async fn check_existing_rules(
        &self,
        controller: &FirewallRuleController,
        acc: &mut ResultAccumulator,
    ) -> Option<usize> {
        let port = self.config.rounds.port;
        match controller.list_rules().await {
            Ok(rules) => {
                for anomaly in rules.anomalies() {
                    acc.record_fail(format!(
                        "Error while parsing iptables rules list (line {}): {}",
                        anomaly.line_number, anomaly.reason
                    ));
                }
                if rules.is_empty() {
                    acc.record_pass("No iptables rules found");
                } else if rules.get(port).is_none() {
                    acc.record_pass(format!("No iptables rules matching port {}", port));
                } else {
                    acc.record_fail(format!("iptables rule matching port {} found!", port));
                }
                Some(rules.marker_lines())
            }
            Err(e) => {
                acc.record_fail(format!("iptables rules listing error: {}", e));
                None
            }
        }
    }

    async fn run_baseline(&self, runner: &EchoRoundRunner, acc: ResultAccumulator) -> ResultAccumulator {
        let rounds = &self.config.rounds;
        let cases = rounds.payload_spec().permitted_cases(rounds.round_count);
        runner.run_rounds(cases, acc).await
    }

    async fn run_with_subject(
        &self,
        controller: &FirewallRuleController,
        runner: &EchoRoundRunner,
        subject_path: &std::path::Path,
        port: u16,
        rules_before: Option<usize>,
        mut acc: ResultAccumulator,
    ) -> ResultAccumulator {
        let installed = match controller.install(port).await {
            Ok(()) => true,
            Err(e) => {
                acc.record_fail(format!("Redirect rule install failed: {}", e));
                false
            }
        };

        if installed {
            match controller.verify_installed(port).await {
                Ok(true) => acc.record_pass(format!(
                    "Redirect rule for port {} to queue {} installed",
                    port,
                    controller.queue_num()
                )),
                Ok(false) => acc.record_fail(format!(
                    "Redirect rule for port {} not found after install",
                    port
                )),
                Err(e) => acc.record_fail(format!("Redirect rule verification failed: {}", e)),
            }
        }

        let subjects = SubjectProcessController::new(&self.config.subject);
        let working_dir = self.config.subject.working_dir.as_deref();
        match subjects.start(subject_path, working_dir).await {
            Ok(mut handle) if handle.is_running() => {
                acc.record_pass(format!("Subject started (PID {})", handle.pid()));

                let rounds = &self.config.rounds;
                let spec = rounds.payload_spec();
                acc = runner
                    .run_rounds(spec.permitted_cases(rounds.round_count), acc)
                    .await;
                acc = runner
                    .run_rounds(spec.forbidden_cases(rounds.round_count), acc)
                    .await;

                let stopped = subjects.stop(&mut handle).await;
                acc.check(
                    stopped,
                    if stopped {
                        "Subject stopped cleanly".to_string()
                    } else {
                        format!(
                            "Subject did not exit cleanly within the grace period (exit code: {:?})",
                            handle.exit_code()
                        )
                    },
                );
            }
            Ok(handle) => acc.record_fail(format!(
                "Subject exited during startup (exit code: {:?})",
                handle.exit_code()
            )),
            Err(e) => acc.record_fail(format!("Subject failed to start: {}", e)),
        }

        if installed {
            acc = self.cleanup_rule(controller, port, rules_before, acc).await;
        }

        acc
    }

    async fn cleanup_rule(
        &self,
        controller: &FirewallRuleController,
        port: u16,
        rules_before: Option<usize>,
        mut acc: ResultAccumulator,
    ) -> ResultAccumulator {
        if let Err(e) = controller.remove(controller.rule_position()).await {
            warn!("Rule removal failed, host firewall may need manual cleanup");
            acc.record_fail(format!("Redirect rule removal failed: {}", e));
            return acc;
        }

        match controller.verify_installed(port).await {
            Ok(false) => acc.record_pass(format!("Redirect rule for port {} removed", port)),
            Ok(true) => acc.record_fail(format!(
                "Redirect rule for port {} still present after removal",
                port
            )),
            Err(e) => acc.record_fail(format!("Rule removal verification failed: {}", e)),
        }

        if let Some(before) = rules_before {
            match controller.rule_count().await {
                Ok(after) if after == before => {
                    acc.record_pass(format!("Queue rule count restored ({})", after))
                }
                Ok(after) => acc.record_fail(format!(
                    "Queue rule count is {} after cleanup, was {}",
                    after, before
                )),
                Err(e) => acc.record_fail(format!("Queue rule count check failed: {}", e)),
            }
        }

        acc
    }
}
