// Echo Rounds
//
// A round is one send/receive/classify cycle for a single payload. Permitted
// rounds must be delivered verbatim; forbidden rounds must be suppressed.

pub mod outcome;
pub mod payload;
pub mod runner;

pub use outcome::{classify, Observation, TestOutcome, Verdict};
pub use payload::{Expectation, PayloadSpec, TestCase};
pub use runner::EchoRoundRunner;
