//! Result accumulation and reporting.
//!
//! [`ResultAccumulator`] is a plain value: round functions take it by value
//! and hand it back, and the driver merges phase results. A live accumulator
//! also prints each check to stdout as it is recorded.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

use crate::rounds::outcome::{TestOutcome, Verdict};

/// Final pass/fail counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.passed + self.failed
    }

    /// True when every recorded check passed
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// Summary line, e.g. `Passed Tests: 9 of 10`
    pub fn render(&self) -> String {
        let counts = format!("{} of {}", self.passed, self.total());
        if self.all_passed() {
            format!("Passed Tests: {}", counts.green())
        } else {
            format!("Passed Tests: {}", format!("⚠️  {}", counts).red())
        }
    }
}

/// One recorded check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub verdict: Verdict,
    pub detail: String,
}

impl ReportEntry {
    /// Tally line printed as the check completes
    pub fn render(&self) -> String {
        let tag = match self.verdict {
            Verdict::Pass => "[PASS]".green(),
            Verdict::Fail => "[FAIL]".red(),
        };
        format!("{} {}", tag, self.detail)
    }
}

/// Pass/fail tally for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultAccumulator {
    entries: Vec<ReportEntry>,
    #[serde(skip)]
    live: bool,
}

impl ResultAccumulator {
    /// Accumulator that records silently
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that also prints every check as it is recorded
    pub fn live() -> Self {
        Self {
            entries: Vec::new(),
            live: true,
        }
    }

    pub fn record_pass(&mut self, detail: impl Into<String>) {
        self.push(Verdict::Pass, detail.into());
    }

    pub fn record_fail(&mut self, detail: impl Into<String>) {
        self.push(Verdict::Fail, detail.into());
    }

    /// Record a classified round
    pub fn record(&mut self, outcome: &TestOutcome) {
        self.push(outcome.verdict, format!("{}: {}", outcome.label(), outcome.detail));
    }

    /// Record pass or fail depending on `ok`
    pub fn check(&mut self, ok: bool, detail: impl Into<String>) {
        let verdict = if ok { Verdict::Pass } else { Verdict::Fail };
        self.push(verdict, detail.into());
    }

    /// Append another accumulator's entries
    pub fn merge(mut self, other: ResultAccumulator) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn summary(&self) -> RunSummary {
        let passed = self
            .entries
            .iter()
            .filter(|e| e.verdict == Verdict::Pass)
            .count();
        RunSummary {
            passed,
            failed: self.entries.len() - passed,
        }
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    fn push(&mut self, verdict: Verdict, detail: String) {
        let entry = ReportEntry { verdict, detail };
        if self.live {
            println!("{}", entry.render());
        }
        self.entries.push(entry);
    }
}

/// Machine-readable report for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub host: String,
    pub summary: RunSummary,
    pub entries: Vec<ReportEntry>,
}

impl RunReport {
    pub fn from_accumulator(acc: &ResultAccumulator) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            host,
            summary: acc.summary(),
            entries: acc.entries().to_vec(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize run report")
    }

    /// Write the report, replacing any previous file at `path`
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create report directory {:?}", parent))?;
            }
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write run report to {:?}", path))?;
        tracing::info!("Run report saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rounds::outcome::{classify, Observation};
    use crate::rounds::payload::PayloadSpec;

    #[test]
    fn test_counts_ignore_detail() {
        let mut acc = ResultAccumulator::new();
        acc.record_pass("a");
        acc.record_pass("");
        acc.record_fail("something broke");

        let summary = acc.summary();
        assert_eq!(summary.passed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 3);
        assert!(!summary.all_passed());
    }

    #[test]
    fn test_empty_summary() {
        let summary = ResultAccumulator::new().summary();
        assert_eq!(summary, RunSummary::default());
        assert!(summary.all_passed());
    }

    #[test]
    fn test_merge_preserves_order() {
        let mut first = ResultAccumulator::new();
        first.record_pass("one");
        let mut second = ResultAccumulator::new();
        second.record_fail("two");
        second.record_pass("three");

        let merged = first.merge(second);
        let details: Vec<_> = merged.entries().iter().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, vec!["one", "two", "three"]);
        assert_eq!(merged.summary(), RunSummary { passed: 2, failed: 1 });
    }

    #[test]
    fn test_record_outcome_uses_label() {
        let spec = PayloadSpec {
            base_token: "tok-".to_string(),
            forbidden_marker: "bad".to_string(),
            forbidden_prefix: String::new(),
            forbidden_suffix: String::new(),
        };
        let outcome = classify(spec.forbidden_case(2), &Observation::TimedOut);

        let mut acc = ResultAccumulator::new();
        acc.record(&outcome);

        assert_eq!(acc.summary().passed, 1);
        assert!(acc.entries()[0].detail.starts_with("forbidden round 2: "));
    }

    #[test]
    fn test_check_helper() {
        let mut acc = ResultAccumulator::new();
        acc.check(true, "ok");
        acc.check(false, "not ok");
        assert_eq!(acc.summary(), RunSummary { passed: 1, failed: 1 });
    }

    #[test]
    fn test_summary_render() {
        let all = RunSummary { passed: 5, failed: 0 };
        assert!(all.render().contains("5 of 5"));
        assert!(!all.render().contains("⚠️"));

        let some = RunSummary { passed: 3, failed: 2 };
        assert!(some.render().contains("3 of 5"));
        assert!(some.render().contains("⚠️"));
    }

    #[test]
    fn test_report_json_and_write() {
        let mut acc = ResultAccumulator::new();
        acc.record_pass("No iptables rules found");
        acc.record_fail("rule verification failed");

        let report = RunReport::from_accumulator(&acc);
        let json = report.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["summary"]["passed"], 1);
        assert_eq!(value["summary"]["failed"], 1);
        assert_eq!(value["entries"][1]["verdict"], "FAIL");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        report.write_to(&path).unwrap();
        assert!(path.exists());
    }
}
