//! Redirect rule controller.
//!
//! Installs and removes the single NFQUEUE redirect the harness needs, and
//! judges success by re-reading the rule table rather than trusting command
//! exit status. Nothing is cached between calls.

use std::sync::Arc;
use tracing::{info, warn};

use super::backend::RuleBackend;
use super::parser::{RuleSet, RuleTableParser};
use crate::config::FirewallConfig;
use crate::error::RuleError;

pub struct FirewallRuleController {
    backend: Arc<dyn RuleBackend>,
    parser: RuleTableParser,
    chain: String,
    rule_position: usize,
}

impl FirewallRuleController {
    pub fn new(backend: Arc<dyn RuleBackend>, config: &FirewallConfig) -> Self {
        Self {
            backend,
            parser: RuleTableParser::new(config.queue_num),
            chain: config.chain.clone(),
            rule_position: config.rule_position,
        }
    }

    /// Position the harness's own rule occupies
    pub fn rule_position(&self) -> usize {
        self.rule_position
    }

    pub fn queue_num(&self) -> u16 {
        self.parser.queue_num()
    }

    /// Name of the firewall backend in use
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Fetch and parse the current listing
    ///
    /// # Errors
    ///
    /// [`RuleError::Query`] when the listing cannot be obtained. Callers must
    /// treat this as a failure, not as an empty rule set.
    pub async fn list_rules(&self) -> Result<RuleSet, RuleError> {
        let listing = self.backend.list().await?;
        let set = self.parser.parse(&listing);
        if !set.anomalies().is_empty() {
            warn!(
                "{} queue rule line(s) could not be parsed",
                set.anomalies().len()
            );
        }
        Ok(set)
    }

    /// Insert the redirect for `port` at the head of the chain
    ///
    /// Not idempotent: calling twice leaves two rules.
    pub async fn install(&self, port: u16) -> Result<(), RuleError> {
        info!(
            "Installing redirect for port {} to queue {} via {}",
            port,
            self.parser.queue_num(),
            self.backend.name()
        );
        self.backend
            .insert_redirect(&self.chain, port, self.parser.queue_num())
            .await
    }

    /// Whether the listing shows an INBOUND redirect for `port`
    pub async fn verify_installed(&self, port: u16) -> Result<bool, RuleError> {
        let installed = self.list_rules().await?.has_inbound(port);
        info!(
            "Redirect for port {} {}",
            port,
            if installed { "present" } else { "absent" }
        );
        Ok(installed)
    }

    /// Delete the rule at `position` in the chain
    ///
    /// Removal is positional, not by content; with several harness rules
    /// installed they must be removed in reverse order of installation.
    pub async fn remove(&self, position: usize) -> Result<(), RuleError> {
        info!(
            "Removing rule {} from {} via {}",
            position,
            self.chain,
            self.backend.name()
        );
        self.backend.delete_at(&self.chain, position).await
    }

    /// Number of queue-marker lines in the current listing
    pub async fn rule_count(&self) -> Result<usize, RuleError> {
        Ok(self.list_rules().await?.marker_lines())
    }

    /// Firewall tool version, for the precondition report
    pub async fn tool_version(&self) -> Result<String, RuleError> {
        self.backend.version().await
    }
}
