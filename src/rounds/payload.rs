//! Deterministic payload generation for echo rounds.
//!
//! Round `i` (1-based) repeats its unit `2 × i` times. Permitted rounds repeat
//! the base token; forbidden rounds repeat `prefix + marker + suffix`.

use serde::{Deserialize, Serialize};

/// What a round expects to happen to its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// The payload must arrive verbatim
    Delivered,
    /// The payload must not arrive at all
    Blocked,
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::Delivered => write!(f, "permitted"),
            Expectation::Blocked => write!(f, "forbidden"),
        }
    }
}

/// One round's payload and expected outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub payload: Vec<u8>,
    pub expected: Expectation,
    pub round_index: usize,
}

impl TestCase {
    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Rule for building round payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSpec {
    pub base_token: String,
    pub forbidden_marker: String,
    pub forbidden_prefix: String,
    pub forbidden_suffix: String,
}

impl PayloadSpec {
    /// Permitted payload for round `round_index`
    pub fn permitted_case(&self, round_index: usize) -> TestCase {
        TestCase {
            payload: self.base_token.repeat(2 * round_index).into_bytes(),
            expected: Expectation::Delivered,
            round_index,
        }
    }

    /// Forbidden payload for round `round_index`
    pub fn forbidden_case(&self, round_index: usize) -> TestCase {
        let unit = format!(
            "{}{}{}",
            self.forbidden_prefix, self.forbidden_marker, self.forbidden_suffix
        );
        TestCase {
            payload: unit.repeat(2 * round_index).into_bytes(),
            expected: Expectation::Blocked,
            round_index,
        }
    }

    /// Permitted cases for rounds `1..=count`
    pub fn permitted_cases(&self, count: usize) -> Vec<TestCase> {
        (1..=count).map(|i| self.permitted_case(i)).collect()
    }

    /// Forbidden cases for rounds `1..=count`
    pub fn forbidden_cases(&self, count: usize) -> Vec<TestCase> {
        (1..=count).map(|i| self.forbidden_case(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payloads() -> PayloadSpec {
        PayloadSpec {
            base_token: "IPS-Testing-Script-".to_string(),
            forbidden_marker: "badword".to_string(),
            forbidden_prefix: "IPS-Testing-".to_string(),
            forbidden_suffix: "-Script-".to_string(),
        }
    }

    #[test]
    fn test_permitted_payload_repeats_twice_per_round() {
        let case = payloads().permitted_case(1);
        assert_eq!(case.payload, b"IPS-Testing-Script-IPS-Testing-Script-".to_vec());
        assert_eq!(case.expected, Expectation::Delivered);
        assert_eq!(case.round_index, 1);

        let case = payloads().permitted_case(5);
        assert_eq!(case.len(), "IPS-Testing-Script-".len() * 10);
    }

    #[test]
    fn test_forbidden_payload_embeds_marker() {
        let case = payloads().forbidden_case(2);
        let text = String::from_utf8(case.payload.clone()).unwrap();
        assert_eq!(text.matches("badword").count(), 4);
        assert!(text.starts_with("IPS-Testing-badword-Script-"));
        assert_eq!(case.expected, Expectation::Blocked);
    }

    #[test]
    fn test_case_lists_are_one_based() {
        let cases = payloads().permitted_cases(5);
        let indices: Vec<_> = cases.iter().map(|c| c.round_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert!(payloads().forbidden_cases(0).is_empty());
    }

    #[test]
    fn test_default_payloads_fit_receive_buffer() {
        // Terminator included
        assert!(payloads().forbidden_case(5).len() + 1 <= 1024);
        assert!(payloads().permitted_case(5).len() + 1 <= 1024);
    }

    proptest! {
        #[test]
        fn test_payload_length_scales_with_round(round in 1usize..20) {
            let s = payloads();
            let permitted = s.permitted_case(round);
            prop_assert_eq!(permitted.len(), s.base_token.len() * 2 * round);
            prop_assert!(!String::from_utf8(permitted.payload).unwrap().contains("badword"));

            let forbidden = s.forbidden_case(round);
            let text = String::from_utf8(forbidden.payload).unwrap();
            prop_assert_eq!(text.matches("badword").count(), 2 * round);
        }
    }
}
