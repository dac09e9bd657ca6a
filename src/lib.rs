//! IPS Harness Library
//!
//! Black-box validation of an NFQUEUE-based intrusion-prevention program:
//! firewall rule management, loopback echo rounds, subject process control
//! and pass/fail reporting.

pub mod config;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod harness;
pub mod logging;
pub mod report;
pub mod rounds;
pub mod subject;
