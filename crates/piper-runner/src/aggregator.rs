//! Single-writer aggregation of worker events into run state.
//!
//! Workers never touch [`RunState`] directly; they send [`Event`]s here. The
//! aggregator applies each event, consults the threshold policy after every
//! failure, and raises the abort signal when the policy says so. Pairs still
//! pending when the event stream closes are classified Abandoned.

use std::collections::HashMap;

use piper_core::{
    Issue, IssueSeverity, QuarantineEntry, ReasonCode, RenderedResource, RunError,
    ValidationOutcome,
};
use piper_validation::GateError;
use tokio::sync::{mpsc, watch};

use crate::policy::{Decision, ThresholdPolicy};
use crate::quarantine::QuarantineLog;
use crate::state::{AbortReason, PairClassification, RecordPhase, RunState};

/// What workers and the admission loop report.
#[derive(Debug)]
pub(crate) enum Event {
    /// A record was read but has no active binding.
    Skipped { record_id: String },
    /// A record entered projection with these (record, template) pairs.
    Admitted {
        seq: u64,
        record_id: String,
        entity_type: String,
        template_ids: Vec<String>,
    },
    /// Projection finished; `rendered` documents go on to validation.
    Projected { seq: u64, rendered: usize },
    RenderFailed { seq: u64, error: RunError },
    Validated {
        seq: u64,
        resource: RenderedResource,
        result: Result<ValidationOutcome, GateError>,
    },
    SourceFailed { message: String },
}

#[derive(Debug)]
struct RecordProgress {
    record_id: String,
    entity_type: String,
    phase: RecordPhase,
    pending: Vec<String>,
}

/// Everything the aggregator accumulated over a run.
#[derive(Debug, Default)]
pub(crate) struct Aggregate {
    pub state: RunState,
    pub abort_reason: Option<AbortReason>,
    pub quarantine: QuarantineLog,
    pub errors: Vec<RunError>,
    pub valid: Vec<RenderedResource>,
}

pub(crate) struct Aggregator {
    policy: ThresholdPolicy,
    abort_tx: watch::Sender<bool>,
    stream_tx: Option<mpsc::Sender<RenderedResource>>,
    records: HashMap<u64, RecordProgress>,
    aggregate: Aggregate,
}

impl Aggregator {
    pub fn new(
        policy: ThresholdPolicy,
        abort_tx: watch::Sender<bool>,
        stream_tx: Option<mpsc::Sender<RenderedResource>>,
    ) -> Self {
        Self {
            policy,
            abort_tx,
            stream_tx,
            records: HashMap::new(),
            aggregate: Aggregate::default(),
        }
    }

    /// Consume events until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) -> Aggregate {
        while let Some(event) = events.recv().await {
            self.apply(event).await;
        }
        self.abandon_pending();
        self.aggregate
    }

    async fn apply(&mut self, event: Event) {
        match event {
            Event::Skipped { record_id } => {
                self.aggregate.state.records_read += 1;
                self.aggregate.state.records_skipped += 1;
                tracing::debug!(record_id = %record_id, "Record has no active bindings");
            }
            Event::Admitted {
                seq,
                record_id,
                entity_type,
                template_ids,
            } => {
                let state = &mut self.aggregate.state;
                state.records_read += 1;
                state.records_admitted += 1;
                state.pairs_admitted += template_ids.len() as u64;
                self.records.insert(
                    seq,
                    RecordProgress {
                        record_id,
                        entity_type,
                        phase: RecordPhase::Extracted,
                        pending: template_ids,
                    },
                );
            }
            Event::Projected { seq, rendered } => {
                self.aggregate.state.rendered += rendered as u64;
                if let Some(progress) = self.records.get_mut(&seq) {
                    progress.phase = if rendered > 0 {
                        RecordPhase::Validating
                    } else {
                        RecordPhase::Projected
                    };
                }
            }
            Event::RenderFailed { seq, error } => {
                let template_id = error.template_id.clone();
                self.aggregate.state.render_failed += 1;
                tracing::warn!(
                    record_id = %error.record_id,
                    template_id = %error.template_id,
                    message = %error.message,
                    "Render failed"
                );
                self.aggregate.errors.push(error);
                self.settle(seq, &template_id, PairClassification::RenderFailed);
                self.check_policy();
            }
            Event::Validated {
                seq,
                resource,
                result,
            } => {
                let template_id = resource.template_id.clone();
                let classification = self.file_validation(resource, result).await;
                self.settle(seq, &template_id, classification);
                if classification != PairClassification::Valid {
                    self.check_policy();
                }
            }
            Event::SourceFailed { message } => {
                tracing::error!(error = %message, "Entity source failed, aborting run");
                self.abort(AbortReason::SourceFailed { message });
            }
        }
    }

    async fn file_validation(
        &mut self,
        resource: RenderedResource,
        result: Result<ValidationOutcome, GateError>,
    ) -> PairClassification {
        let state = &mut self.aggregate.state;
        match result {
            Ok(outcome) if outcome.is_valid() => {
                state.valid += 1;
                tracing::debug!(resource = %resource.reference(), "Resource valid");
                if let Some(tx) = &self.stream_tx {
                    if tx.send(resource.clone()).await.is_err() {
                        tracing::warn!("Streaming load task has stopped");
                    }
                }
                self.aggregate.valid.push(resource);
                PairClassification::Valid
            }
            Ok(outcome) => {
                state.invalid += 1;
                state.quarantined += 1;
                self.aggregate
                    .quarantine
                    .append(QuarantineEntry::new(resource, outcome, ReasonCode::Invalid));
                PairClassification::Quarantined
            }
            Err(e) => {
                state.transport_failed += 1;
                state.quarantined += 1;
                let reason = e.reason();
                let issue = Issue::new(IssueSeverity::Fatal, transport_issue_code(reason), e.to_string());
                let outcome = ValidationOutcome::from_issues(resource.reference(), vec![issue], None);
                self.aggregate
                    .quarantine
                    .append(QuarantineEntry::new(resource, outcome, reason));
                PairClassification::Quarantined
            }
        }
    }

    /// Record a terminal classification for one pair.
    fn settle(&mut self, seq: u64, template_id: &str, classification: PairClassification) {
        let Some(progress) = self.records.get_mut(&seq) else {
            tracing::warn!(seq, template_id, "Classification for unknown record");
            return;
        };
        progress.pending.retain(|t| t != template_id);
        tracing::debug!(
            record_id = %progress.record_id,
            template_id,
            classification = ?classification,
            "Pair classified"
        );

        if progress.pending.is_empty() {
            self.records.remove(&seq);
            self.aggregate.state.records_completed += 1;
        }
    }

    fn check_policy(&mut self) {
        if self.aggregate.state.aborted_early {
            return;
        }
        if let Decision::Abort(message) = self.policy.evaluate(&self.aggregate.state) {
            tracing::error!(reason = %message, "Threshold policy tripped, aborting run");
            self.abort(AbortReason::ThresholdExceeded { message });
        }
    }

    fn abort(&mut self, reason: AbortReason) {
        if !self.aggregate.state.aborted_early {
            self.aggregate.state.aborted_early = true;
            self.aggregate.abort_reason = Some(reason);
        }
        self.abort_tx.send_replace(true);
    }

    fn abandon_pending(&mut self) {
        let mut seqs: Vec<u64> = self.records.keys().copied().collect();
        seqs.sort_unstable();

        for seq in seqs {
            let Some(progress) = self.records.remove(&seq) else {
                continue;
            };
            for template_id in progress.pending {
                self.aggregate.state.abandoned += 1;
                tracing::warn!(
                    record_id = %progress.record_id,
                    template_id = %template_id,
                    phase = ?progress.phase,
                    "Pair abandoned"
                );
                self.aggregate.errors.push(RunError::new(
                    &progress.record_id,
                    &progress.entity_type,
                    template_id,
                    ReasonCode::Abandoned,
                    format!("still {:?} when the run stopped", progress.phase).to_lowercase(),
                ));
            }
            self.aggregate.state.records_completed += 1;
        }
    }
}

fn transport_issue_code(reason: ReasonCode) -> &'static str {
    match reason {
        ReasonCode::TransportRejected => "security",
        _ => "transient",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piper_validation::TransportError;

    fn resource(record_id: &str, template_id: &str) -> RenderedResource {
        RenderedResource {
            record_id: record_id.into(),
            entity_type: "Subject".into(),
            template_id: template_id.into(),
            resource_kind: "Patient".into(),
            document: "{}".into(),
        }
    }

    fn valid(resource: &RenderedResource) -> Result<ValidationOutcome, GateError> {
        Ok(ValidationOutcome::from_issues(resource.reference(), vec![], None))
    }

    fn invalid(resource: &RenderedResource) -> Result<ValidationOutcome, GateError> {
        Ok(ValidationOutcome::from_issues(
            resource.reference(),
            vec![Issue::new(IssueSeverity::Error, "required", "missing")],
            None,
        ))
    }

    fn admitted(seq: u64, record_id: &str, templates: &[&str]) -> Event {
        Event::Admitted {
            seq,
            record_id: record_id.into(),
            entity_type: "Subject".into(),
            template_ids: templates.iter().map(|t| t.to_string()).collect(),
        }
    }

    async fn aggregate(policy: ThresholdPolicy, events: Vec<Event>) -> (Aggregate, bool) {
        let (abort_tx, abort_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(64);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        let aggregate = Aggregator::new(policy, abort_tx, None).run(rx).await;
        let aborted = *abort_rx.borrow();
        (aggregate, aborted)
    }

    #[tokio::test]
    async fn test_two_templates_classified_independently() {
        let patient = resource("s1", "Patient");
        let consent = resource("s1", "Consent");
        let events = vec![
            admitted(1, "s1", &["Patient", "Consent"]),
            Event::Projected { seq: 1, rendered: 2 },
            Event::Validated {
                seq: 1,
                result: valid(&patient),
                resource: patient,
            },
            Event::Validated {
                seq: 1,
                result: invalid(&consent),
                resource: consent,
            },
        ];

        let (aggregate, aborted) = aggregate(ThresholdPolicy::max_count(5), events).await;
        assert!(!aborted);
        assert_eq!(aggregate.state.valid, 1);
        assert_eq!(aggregate.state.invalid, 1);
        assert_eq!(aggregate.state.records_completed, 1);
        assert!(aggregate.state.is_balanced());
        assert!(aggregate.quarantine.get("s1", "Consent").is_some());
        assert!(aggregate.quarantine.get("s1", "Patient").is_none());
    }

    #[tokio::test]
    async fn test_pending_pairs_are_abandoned() {
        let patient = resource("s1", "Patient");
        let events = vec![
            admitted(1, "s1", &["Patient", "Consent"]),
            Event::Projected { seq: 1, rendered: 2 },
            Event::Validated {
                seq: 1,
                result: valid(&patient),
                resource: patient,
            },
            admitted(2, "s2", &["Patient"]),
        ];

        let (aggregate, _) = aggregate(ThresholdPolicy::StopOnError, events).await;
        assert_eq!(aggregate.state.abandoned, 2);
        assert!(aggregate.state.is_balanced());
        let abandoned: Vec<_> = aggregate
            .errors
            .iter()
            .map(|e| (e.record_id.as_str(), e.template_id.as_str(), e.reason))
            .collect();
        assert_eq!(
            abandoned,
            vec![
                ("s1", "Consent", ReasonCode::Abandoned),
                ("s2", "Patient", ReasonCode::Abandoned)
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_is_quarantined_with_reason() {
        let patient = resource("s1", "Patient");
        let events = vec![
            admitted(1, "s1", &["Patient"]),
            Event::Validated {
                seq: 1,
                resource: patient,
                result: Err(GateError::TransportExhausted {
                    attempts: 3,
                    last: TransportError::retryable("HTTP 503"),
                }),
            },
        ];

        let (aggregate, aborted) = aggregate(ThresholdPolicy::StopOnError, events).await;
        assert!(aborted);
        assert_eq!(aggregate.state.transport_failed, 1);
        assert_eq!(aggregate.state.invalid, 0);
        let entry = aggregate.quarantine.get("s1", "Patient").unwrap();
        assert_eq!(entry.reason, ReasonCode::TransportExhausted);
        assert_eq!(entry.outcome.issues[0].code, "transient");
        assert!(matches!(
            aggregate.abort_reason,
            Some(AbortReason::ThresholdExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_abort_reason_wins() {
        let events = vec![
            Event::SourceFailed {
                message: "line 9".into(),
            },
            admitted(1, "s1", &["Patient"]),
            Event::RenderFailed {
                seq: 1,
                error: RunError::new("s1", "Subject", "Patient", ReasonCode::RenderFailed, "boom"),
            },
        ];

        let (aggregate, aborted) = aggregate(ThresholdPolicy::StopOnError, events).await;
        assert!(aborted);
        assert_eq!(
            aggregate.abort_reason,
            Some(AbortReason::SourceFailed {
                message: "line 9".into()
            })
        );
        assert_eq!(aggregate.state.render_failed, 1);
    }
}
