//! Round classification.
//!
//! Permitted and forbidden rounds share one primitive observation and apply
//! inverted success criteria to it.

use serde::{Deserialize, Serialize};

use super::payload::{Expectation, TestCase};

/// What the receiving side saw during one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Bytes arrived (trailing newline already trimmed); empty when the
    /// peer closed without sending anything
    Received(Vec<u8>),
    /// No connection, or no data, within the accept timeout
    TimedOut,
    /// The connection was reset or aborted
    Reset,
}

impl Observation {
    /// Whether anything was delivered
    pub fn delivered(&self) -> bool {
        matches!(self, Observation::Received(_))
    }
}

/// Pass/fail verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Classified result of one round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub case: TestCase,
    pub verdict: Verdict,
    pub detail: String,
}

impl TestOutcome {
    /// Short label naming the round, e.g. `permitted round 3`
    pub fn label(&self) -> String {
        format!("{} round {}", self.case.expected, self.case.round_index)
    }
}

/// Classify an observation against the round's expectation
pub fn classify(case: TestCase, observation: &Observation) -> TestOutcome {
    let length = case.len();
    let (verdict, detail) = match (case.expected, observation) {
        (Expectation::Delivered, Observation::Received(bytes)) if *bytes == case.payload => {
            (Verdict::Pass, "delivered as expected")
        }
        (Expectation::Delivered, Observation::Received(_)) => (Verdict::Fail, "wrong string received"),
        (Expectation::Delivered, _) => (Verdict::Fail, "expected delivery, got none"),
        (Expectation::Blocked, Observation::Received(bytes)) if *bytes == case.payload => {
            (Verdict::Fail, "forbidden content was delivered")
        }
        (Expectation::Blocked, Observation::Received(_)) => (Verdict::Fail, "wrong string received"),
        (Expectation::Blocked, _) => (Verdict::Pass, "forbidden content correctly suppressed"),
    };

    TestOutcome {
        detail: format!("{} (length: {})", detail, length),
        case,
        verdict,
    }
}

/// Strip trailing newlines from received bytes; `\r` is payload
pub fn trim_line_terminator(mut bytes: Vec<u8>) -> Vec<u8> {
    while bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    bytes
}
