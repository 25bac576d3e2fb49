//! Failure threshold policy.
//!
//! The policy is a plain value; [`ThresholdPolicy::evaluate`] is the single
//! place that decides whether accumulated failures abort a run. Failures are
//! quarantined pairs (invalid or transport) plus render failures. Abandoned
//! pairs never count.

use serde::{Deserialize, Serialize};

use crate::error::RunnerError;
use crate::state::RunState;

/// How many failures a `quarantine-and-continue` run tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ceiling {
    /// Abort once more than this many pairs have failed.
    MaxCount(u64),
    /// Abort once `failures / attempted > max`, but only after at least
    /// `min_attempted` pairs have been classified.
    MaxFraction { max: f64, min_attempted: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ThresholdPolicy {
    /// Abort on the first quarantined or render-failed pair.
    StopOnError,
    /// Record failures and keep going until the ceiling is crossed.
    QuarantineAndContinue { ceiling: Ceiling },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Abort(String),
}

impl Decision {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }
}

impl ThresholdPolicy {
    pub fn max_count(n: u64) -> Self {
        Self::QuarantineAndContinue {
            ceiling: Ceiling::MaxCount(n),
        }
    }

    pub fn max_fraction(max: f64, min_attempted: u64) -> Self {
        Self::QuarantineAndContinue {
            ceiling: Ceiling::MaxFraction { max, min_attempted },
        }
    }

    pub fn evaluate(&self, state: &RunState) -> Decision {
        let failures = state.failures();
        match self {
            Self::StopOnError if failures > 0 => Decision::Abort(format!(
                "stop-on-error: {failures} failed pair(s)"
            )),
            Self::StopOnError => Decision::Continue,
            Self::QuarantineAndContinue {
                ceiling: Ceiling::MaxCount(max),
            } if failures > *max => Decision::Abort(format!(
                "{failures} failed pairs exceed the ceiling of {max}"
            )),
            Self::QuarantineAndContinue {
                ceiling: Ceiling::MaxFraction { max, min_attempted },
            } => {
                let attempted = state.attempted();
                if attempted == 0 || attempted < *min_attempted {
                    return Decision::Continue;
                }
                let fraction = failures as f64 / attempted as f64;
                if fraction > *max {
                    Decision::Abort(format!(
                        "{failures}/{attempted} failed pairs ({:.1}%) exceed the ceiling of {:.1}%",
                        fraction * 100.0,
                        max * 100.0
                    ))
                } else {
                    Decision::Continue
                }
            }
            Self::QuarantineAndContinue { .. } => Decision::Continue,
        }
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        if let Self::QuarantineAndContinue {
            ceiling: Ceiling::MaxFraction { max, .. },
        } = self
        {
            if !max.is_finite() || !(0.0..=1.0).contains(max) {
                return Err(RunnerError::invalid_config(format!(
                    "max-fraction ceiling must be between 0 and 1, got {max}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(valid: u64, quarantined: u64, render_failed: u64) -> RunState {
        RunState {
            valid,
            quarantined,
            render_failed,
            ..Default::default()
        }
    }

    #[test]
    fn test_stop_on_error_aborts_on_first_failure() {
        let policy = ThresholdPolicy::StopOnError;
        assert_eq!(policy.evaluate(&state(10, 0, 0)), Decision::Continue);
        assert!(policy.evaluate(&state(10, 1, 0)).is_abort());
        assert!(policy.evaluate(&state(0, 0, 1)).is_abort());
    }

    #[test]
    fn test_max_count_aborts_strictly_after_ceiling() {
        let policy = ThresholdPolicy::max_count(3);
        assert!(!policy.evaluate(&state(5, 2, 1)).is_abort());
        assert!(policy.evaluate(&state(5, 3, 1)).is_abort());

        let zero = ThresholdPolicy::max_count(0);
        assert!(!zero.evaluate(&state(5, 0, 0)).is_abort());
        assert!(zero.evaluate(&state(5, 1, 0)).is_abort());
    }

    #[test]
    fn test_abandoned_pairs_do_not_count() {
        let policy = ThresholdPolicy::StopOnError;
        let state = RunState {
            abandoned: 4,
            ..Default::default()
        };
        assert_eq!(policy.evaluate(&state), Decision::Continue);
    }

    #[test]
    fn test_max_fraction_waits_for_min_attempted() {
        let policy = ThresholdPolicy::max_fraction(0.25, 8);
        assert!(!policy.evaluate(&state(1, 3, 0)).is_abort());
        assert!(!policy.evaluate(&state(6, 2, 0)).is_abort());
        assert!(policy.evaluate(&state(5, 2, 1)).is_abort());
    }

    #[test]
    fn test_max_fraction_bounds_checked() {
        assert!(ThresholdPolicy::max_fraction(0.1, 0).validate().is_ok());
        assert!(ThresholdPolicy::max_fraction(1.5, 0).validate().is_err());
        assert!(ThresholdPolicy::max_fraction(f64::NAN, 0).validate().is_err());
    }

    #[test]
    fn test_policy_deserializes_from_config_shape() {
        let policy: ThresholdPolicy = serde_json::from_value(json!({
            "mode": "quarantine-and-continue",
            "ceiling": {"max-count": 25}
        }))
        .unwrap();
        assert_eq!(policy, ThresholdPolicy::max_count(25));

        let policy: ThresholdPolicy = serde_json::from_value(json!({
            "mode": "quarantine-and-continue",
            "ceiling": {"max-fraction": {"max": 0.05, "min_attempted": 100}}
        }))
        .unwrap();
        assert_eq!(policy, ThresholdPolicy::max_fraction(0.05, 100));

        let policy: ThresholdPolicy =
            serde_json::from_value(json!({"mode": "stop-on-error"})).unwrap();
        assert_eq!(policy, ThresholdPolicy::StopOnError);
    }

    #[test]
    fn test_quarantine_and_continue_requires_ceiling() {
        let result: Result<ThresholdPolicy, _> =
            serde_json::from_value(json!({"mode": "quarantine-and-continue"}));
        assert!(result.is_err());
    }
}
