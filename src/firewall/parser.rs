//! Rule listing parser
//!
//! Turns `iptables -L -n` text into a port → direction map for the rules that
//! feed the harness's NFQUEUE. Only lines carrying the queue marker are
//! considered; a source-port token makes the rule OUTBOUND, otherwise a
//! destination-port token makes it INBOUND. Marker lines with neither token
//! are reported as anomalies and skipped.
//!
//! When one port shows up in several lines the last line wins, so the result
//! depends on listing order.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

lazy_static! {
    static ref SOURCE_PORT: Regex = Regex::new(r"\bspt:(\d+)").expect("valid source port pattern");
    static ref DESTINATION_PORT: Regex =
        Regex::new(r"\bdpt:(\d+)").expect("valid destination port pattern");
}

/// Traffic direction of a redirect rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "INBOUND"),
            Direction::Outbound => write!(f, "OUTBOUND"),
        }
    }
}

/// A queue rule observed in one listing snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub port: u16,
    pub direction: Direction,
}

/// A marker line that carried no usable port token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseAnomaly {
    /// 1-based line number in the listing
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

/// Parsed view of one listing snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: BTreeMap<u16, Direction>,
    anomalies: Vec<ParseAnomaly>,
    marker_lines: usize,
}

impl RuleSet {
    /// Direction recorded for `port`
    pub fn get(&self, port: u16) -> Option<Direction> {
        self.rules.get(&port).copied()
    }

    /// Whether `port` has an INBOUND redirect
    pub fn has_inbound(&self, port: u16) -> bool {
        self.get(port) == Some(Direction::Inbound)
    }

    /// Distinct ports with a rule
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules in port order
    pub fn rules(&self) -> impl Iterator<Item = FirewallRule> + '_ {
        self.rules
            .iter()
            .map(|(&port, &direction)| FirewallRule { port, direction })
    }

    pub fn anomalies(&self) -> &[ParseAnomaly] {
        &self.anomalies
    }

    /// Number of lines that carried the queue marker, anomalies included
    pub fn marker_lines(&self) -> usize {
        self.marker_lines
    }
}

/// Parser bound to one NFQUEUE number
#[derive(Debug, Clone)]
pub struct RuleTableParser {
    marker: Regex,
    queue_num: u16,
}

impl RuleTableParser {
    pub fn new(queue_num: u16) -> Self {
        // Word boundary so queue 33 does not also match queue 330
        let marker = Regex::new(&format!(r"NFQUEUE num {}\b", queue_num))
            .expect("queue marker built from an integer is a valid pattern");
        Self { marker, queue_num }
    }

    pub fn queue_num(&self) -> u16 {
        self.queue_num
    }

    /// Parse a full listing
    pub fn parse(&self, listing: &str) -> RuleSet {
        let mut set = RuleSet::default();

        for (index, line) in listing.lines().enumerate() {
            if !self.marker.is_match(line) {
                continue;
            }
            set.marker_lines += 1;

            let classified = match_port(&SOURCE_PORT, line)
                .map(|port| port.map(|p| (p, Direction::Outbound)))
                .or_else(|| {
                    match_port(&DESTINATION_PORT, line)
                        .map(|port| port.map(|p| (p, Direction::Inbound)))
                });

            let anomaly = match classified {
                Some(Ok((port, direction))) => {
                    set.rules.insert(port, direction);
                    None
                }
                Some(Err(token)) => Some(format!("port {} out of range", token)),
                None => Some("no spt:/dpt: token".to_string()),
            };

            if let Some(reason) = anomaly {
                warn!(
                    "Error while parsing iptables rules list (line {}): {}",
                    index + 1,
                    reason
                );
                set.anomalies.push(ParseAnomaly {
                    line_number: index + 1,
                    line: line.trim().to_string(),
                    reason,
                });
            }
        }

        set
    }
}

/// First capture of `pattern` in `line`, parsed as a port; `Err` carries
/// digits that do not fit in u16
fn match_port(pattern: &Regex, line: &str) -> Option<Result<u16, String>> {
    let digits = pattern.captures(line)?.get(1)?.as_str();
    Some(digits.parse::<u16>().map_err(|_| digits.to_string()))
}
