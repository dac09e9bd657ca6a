// Firewall Rule Management
//
// This module installs, verifies and removes the NFQUEUE redirect rule that
// sends test traffic through the subject process.
//
// Key invariants:
// - Rule state is always re-read from the listing, never cached
// - Only lines carrying this harness's queue marker are considered
// - The harness removes its rule by position, not by content

pub mod backend;
pub mod controller;
pub mod parser;

pub use backend::{IptablesBackend, RuleBackend};
pub use controller::FirewallRuleController;
pub use parser::{Direction, FirewallRule, ParseAnomaly, RuleSet, RuleTableParser};

/// Whether the current process runs with root privileges
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
