//! Run-level state and per-record phases.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Counters for one run. Only the aggregator mutates these.
///
/// Pair counters count (record, template) pairs; record counters count
/// source records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Records pulled from the source.
    pub records_read: u64,
    /// Records with no active binding. They never enter projection.
    pub records_skipped: u64,
    /// Records handed to the projection engine.
    pub records_admitted: u64,
    /// Admitted records whose every pair reached a terminal classification.
    pub records_completed: u64,
    /// (record, template) pairs admitted into the run.
    pub pairs_admitted: u64,
    /// Pairs that rendered into a candidate document.
    pub rendered: u64,
    pub valid: u64,
    /// Pairs quarantined because the validator reported them non-conformant.
    pub invalid: u64,
    /// Pairs quarantined for any reason (invalid or transport failure).
    pub quarantined: u64,
    /// Pairs quarantined because the validation endpoint could not be used.
    pub transport_failed: u64,
    pub render_failed: u64,
    pub abandoned: u64,
    pub aborted_early: bool,
}

impl RunState {
    /// Pairs that reached a classification through normal processing.
    pub fn attempted(&self) -> u64 {
        self.valid + self.quarantined + self.render_failed
    }

    /// Pairs counted against the threshold policy.
    pub fn failures(&self) -> u64 {
        self.quarantined + self.render_failed
    }

    /// Pairs with any terminal classification, abandoned included.
    pub fn terminal_pairs(&self) -> u64 {
        self.attempted() + self.abandoned
    }

    /// Every admitted pair has exactly one terminal classification.
    pub fn is_balanced(&self) -> bool {
        self.terminal_pairs() == self.pairs_admitted
    }
}

/// Where an in-flight record is in the pipeline. A record whose pairs are
/// all classified is no longer in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordPhase {
    Extracted,
    Projected,
    Validating,
}

/// Terminal classification of one (record, template) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairClassification {
    Valid,
    Quarantined,
    RenderFailed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    AbortedEarly,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AbortedEarly => "aborted-early",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run stopped admitting records before the source was exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AbortReason {
    /// The threshold policy's ceiling was crossed.
    ThresholdExceeded { message: String },
    /// The entity source failed mid-stream.
    SourceFailed { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThresholdExceeded { message } => write!(f, "threshold exceeded: {message}"),
            Self::SourceFailed { message } => write!(f, "entity source failed: {message}"),
        }
    }
}
