use crate::executor::ExecutionResult;
use crate::normalize::OutputNormalizer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of one target's behavior against the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    /// Both succeeded with matching output.
    Pass,
    /// Target failed, reference succeeded.
    Crash,
    /// Both succeeded, outputs differ.
    LogicBug,
    /// Target succeeded, reference failed.
    ReferenceError,
    /// Both failed; the statement is most likely not valid for this program family.
    InvalidQuery,
}

impl Outcome {
    pub const ALL: [Outcome; 5] = [
        Outcome::Pass,
        Outcome::Crash,
        Outcome::LogicBug,
        Outcome::ReferenceError,
        Outcome::InvalidQuery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Crash => "CRASH",
            Outcome::LogicBug => "LOGIC_BUG",
            Outcome::ReferenceError => "REFERENCE_ERROR",
            Outcome::InvalidQuery => "INVALID_QUERY",
        }
    }

    /// Outcomes worth a reproducer.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            Outcome::Crash | Outcome::LogicBug | Outcome::ReferenceError
        )
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Outcome::Pass => 0,
            Outcome::Crash => 1,
            Outcome::LogicBug => 2,
            Outcome::ReferenceError => 3,
            Outcome::InvalidQuery => 4,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides the [`Outcome`] of a target run given the reference run of the same input.
///
/// Implementations must be pure: the same pair of results always yields the
/// same outcome.
pub trait Oracle: Send + Sync {
    fn classify(
        &self,
        statement: &str,
        reference: &ExecutionResult,
        target: &ExecutionResult,
    ) -> Outcome;
}

/// The standard crash/output comparison.
///
/// | reference crashed | target crashed | outputs match | outcome |
/// |---|---|---|---|
/// | no | yes | - | CRASH |
/// | yes | no | - | REFERENCE_ERROR |
/// | no | no | yes | PASS |
/// | no | no | no | LOGIC_BUG |
/// | yes | yes | - | INVALID_QUERY |
///
/// "Crashed" means a non-zero exit status, which includes timeouts and
/// launch failures.
#[derive(Debug, Clone, Default)]
pub struct DifferentialOracle {
    normalizer: OutputNormalizer,
}

impl DifferentialOracle {
    pub fn new(normalizer: OutputNormalizer) -> Self {
        Self { normalizer }
    }

    pub fn normalizer(&self) -> &OutputNormalizer {
        &self.normalizer
    }

    pub fn outputs_match(&self, statement: &str, a: &ExecutionResult, b: &ExecutionResult) -> bool {
        self.normalizer.normalize_for(&a.stdout, statement)
            == self.normalizer.normalize_for(&b.stdout, statement)
    }
}

impl Oracle for DifferentialOracle {
    fn classify(
        &self,
        statement: &str,
        reference: &ExecutionResult,
        target: &ExecutionResult,
    ) -> Outcome {
        match (reference.crashed(), target.crashed()) {
            (false, true) => Outcome::Crash,
            (true, false) => Outcome::ReferenceError,
            (true, true) => Outcome::InvalidQuery,
            (false, false) => {
                if self.outputs_match(statement, reference, target) {
                    Outcome::Pass
                } else {
                    Outcome::LogicBug
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessExit;
    use crate::normalize::RowOrder;
    use proptest::prelude::*;

    fn ok(stdout: &str) -> ExecutionResult {
        ExecutionResult::exited(0, stdout)
    }

    fn failed(code: i32) -> ExecutionResult {
        ExecutionResult::new(ProcessExit::Code(code), "", "Error: boom")
    }

    fn classify(reference: &ExecutionResult, target: &ExecutionResult) -> Outcome {
        DifferentialOracle::default().classify("SELECT 1;", reference, target)
    }

    #[test]
    fn float_noise_passes() {
        assert_eq!(
            classify(&ok("1|2.0000000000"), &ok("1|2.00000000001")),
            Outcome::Pass
        );
    }

    #[test]
    fn target_segfault_is_a_crash() {
        assert_eq!(classify(&ok("1"), &failed(139)), Outcome::Crash);
    }

    #[test]
    fn reference_failure_alone_is_a_reference_error() {
        assert_eq!(classify(&failed(1), &ok("1")), Outcome::ReferenceError);
    }

    #[test]
    fn different_rows_are_a_logic_bug() {
        assert_eq!(classify(&ok("5"), &ok("6")), Outcome::LogicBug);
    }

    #[test]
    fn both_failing_is_an_invalid_query() {
        assert_eq!(classify(&failed(1), &failed(2)), Outcome::InvalidQuery);
    }

    #[test]
    fn both_empty_is_a_pass() {
        assert_eq!(classify(&ok(""), &ok("\n\n")), Outcome::Pass);
    }

    #[test]
    fn timeout_and_launch_failure_count_as_crashes() {
        let timeout = ExecutionResult::new(ProcessExit::Timeout, "partial", "");
        let launch = ExecutionResult::launch_failure("no such file");
        assert_eq!(classify(&ok("1"), &timeout), Outcome::Crash);
        assert_eq!(classify(&launch, &ok("1")), Outcome::ReferenceError);
        assert_eq!(classify(&timeout, &launch), Outcome::InvalidQuery);
    }

    #[test]
    fn stderr_does_not_affect_passing_runs() {
        let noisy = ExecutionResult::new(ProcessExit::Code(0), "1", "warning: deprecated");
        assert_eq!(classify(&ok("1"), &noisy), Outcome::Pass);
    }

    #[test]
    fn row_order_policy_flows_through_the_oracle() {
        let oracle = DifferentialOracle::new(
            OutputNormalizer::default().with_row_order(RowOrder::SortUnlessOrdered),
        );
        let (a, b) = (ok("1\n2"), ok("2\n1"));
        assert_eq!(oracle.classify("SELECT x FROM t", &a, &b), Outcome::Pass);
        assert_eq!(
            oracle.classify("SELECT x FROM t ORDER BY x", &a, &b),
            Outcome::LogicBug
        );
    }

    #[test]
    fn outcome_labels_and_bug_flags() {
        let labels: Vec<&str> = Outcome::ALL.iter().map(Outcome::as_str).collect();
        assert_eq!(
            labels,
            ["PASS", "CRASH", "LOGIC_BUG", "REFERENCE_ERROR", "INVALID_QUERY"]
        );
        let bugs: Vec<Outcome> = Outcome::ALL.into_iter().filter(Outcome::is_bug).collect();
        assert_eq!(
            bugs,
            [Outcome::Crash, Outcome::LogicBug, Outcome::ReferenceError]
        );
        for (i, outcome) in Outcome::ALL.iter().enumerate() {
            assert_eq!(outcome.index(), i);
        }
        assert_eq!(
            serde_json::to_string(&Outcome::LogicBug).unwrap(),
            "\"LOGIC_BUG\""
        );
    }

    fn arb_exit() -> impl Strategy<Value = ProcessExit> {
        prop_oneof![
            (-3i32..256).prop_map(ProcessExit::Code),
            (1i32..32).prop_map(ProcessExit::Signal),
            Just(ProcessExit::Timeout),
            Just(ProcessExit::LaunchFailure),
            Just(ProcessExit::Cancelled),
        ]
    }

    fn arb_result() -> impl Strategy<Value = ExecutionResult> {
        (arb_exit(), "[0-9|.\n]{0,16}", "[a-z ]{0,8}")
            .prop_map(|(exit, stdout, stderr)| ExecutionResult::new(exit, stdout, stderr))
    }

    proptest! {
        #[test]
        fn classification_follows_the_table(reference in arb_result(), target in arb_result()) {
            let oracle = DifferentialOracle::default();
            let outcome = oracle.classify("SELECT 1", &reference, &target);
            let expected = match (reference.exit.code() != 0, target.exit.code() != 0) {
                (false, true) => Outcome::Crash,
                (true, false) => Outcome::ReferenceError,
                (true, true) => Outcome::InvalidQuery,
                (false, false) if oracle.outputs_match("SELECT 1", &reference, &target) => Outcome::Pass,
                (false, false) => Outcome::LogicBug,
            };
            prop_assert_eq!(outcome, expected);
            prop_assert_eq!(oracle.classify("SELECT 1", &reference, &target), outcome);
        }
    }
}
