//! Result keys and per-pair outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::variant::InstrumentationMethod;

/// Identifies one (suite, variant) pair in the output stream and the final report.
///
/// When a suite declares instrumentation methods, the method is folded into the suite id so every
/// (variant, method) pair has its own key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvKey {
    pub suite: String,
    pub index: usize,
}

impl EnvKey {
    pub fn new(suite: impl Into<String>, index: usize) -> Self {
        Self {
            suite: suite.into(),
            index,
        }
    }

    /// Key for a variant run under a specific instrumentation method.
    pub fn for_method(suite: &str, method: Option<&InstrumentationMethod>, index: usize) -> Self {
        match method {
            Some(method) => Self::new(format!("{suite} [{method}]"), index),
            None => Self::new(suite, index),
        }
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} env {}", self.suite, self.index)
    }
}

/// Terminal state of one (variant, method) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Passed,
    /// The child ran and exited non-zero.
    Failed,
    /// Dependency resolution failed; the tests never ran.
    Unresolved,
    /// Empty manifest, failed suite condition, or halted by fail-fast.
    Skipped,
}

impl Outcome {
    /// Whether this outcome makes the aggregate exit code non-zero.
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Unresolved)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Passed => "PASSED",
            Outcome::Failed => "FAILED",
            Outcome::Unresolved => "UNRESOLVED",
            Outcome::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code summarizing a run: 0 iff nothing failed or went unresolved.
pub fn aggregate_exit_code<'a>(outcomes: impl IntoIterator<Item = &'a Outcome>) -> i32 {
    if outcomes.into_iter().any(|o| o.is_failure()) { 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_passed_exits_zero() {
        let outcomes = [Outcome::Passed, Outcome::Passed, Outcome::Passed];
        assert_eq!(aggregate_exit_code(&outcomes), 0);
    }

    #[test]
    fn test_one_failure_exits_one() {
        let outcomes = [Outcome::Passed, Outcome::Failed, Outcome::Passed];
        assert_eq!(aggregate_exit_code(&outcomes), 1);
    }

    #[test]
    fn test_skipped_only_exits_zero() {
        assert_eq!(aggregate_exit_code(&[Outcome::Skipped, Outcome::Skipped]), 0);
        assert_eq!(aggregate_exit_code(&[]), 0);
    }

    #[test]
    fn test_unresolved_counts_as_failure() {
        assert_eq!(aggregate_exit_code(&[Outcome::Passed, Outcome::Unresolved]), 1);
    }

    #[test]
    fn test_method_is_folded_into_suite_id() {
        let method = InstrumentationMethod::new("chain");
        assert_eq!(EnvKey::for_method("rack", Some(&method), 2), EnvKey::new("rack [chain]", 2));
        assert_eq!(EnvKey::for_method("rack", None, 2), EnvKey::new("rack", 2));
        assert_eq!(EnvKey::new("rack", 2).to_string(), "rack env 2");
    }
}
