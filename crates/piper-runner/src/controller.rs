//! Run controller: sequences projection, validation and load for one run.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use piper_core::{EntitySource, ReasonCode, RenderedResource, RunError, SourceRecord};
use piper_projection::ProjectionEngine;
use piper_validation::ValidationGate;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::aggregator::{Aggregate, Aggregator, Event};
use crate::error::{Result, RunnerError};
use crate::policy::ThresholdPolicy;
use crate::quarantine::QuarantineLog;
use crate::sink::{LoadMode, LoadReport, LoadSink};
use crate::state::{AbortReason, RunState, RunStatus};

const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Knobs for one run. The policy and the drain grace have no defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Records projected at the same time.
    pub render_concurrency: usize,
    /// Validation calls in flight at the same time.
    pub validation_concurrency: usize,
    pub policy: ThresholdPolicy,
    /// How long in-flight work may keep running after an abort.
    pub drain_grace: Duration,
    pub load_mode: LoadMode,
    /// Capacity of the event channel, and the cap on admitted records that
    /// have not finished validation.
    pub event_buffer: usize,
}

impl RunConfig {
    pub fn new(policy: ThresholdPolicy, drain_grace: Duration) -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            render_concurrency: cpus,
            validation_concurrency: (cpus / 2).max(1),
            policy,
            drain_grace,
            load_mode: LoadMode::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_render_concurrency(mut self, n: usize) -> Self {
        self.render_concurrency = n;
        self
    }

    pub fn with_validation_concurrency(mut self, n: usize) -> Self {
        self.validation_concurrency = n;
        self
    }

    pub fn with_load_mode(mut self, mode: LoadMode) -> Self {
        self.load_mode = mode;
        self
    }

    pub fn with_event_buffer(mut self, n: usize) -> Self {
        self.event_buffer = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.render_concurrency == 0 {
            return Err(RunnerError::invalid_config("render_concurrency must be at least 1"));
        }
        if self.validation_concurrency == 0 {
            return Err(RunnerError::invalid_config(
                "validation_concurrency must be at least 1",
            ));
        }
        if self.event_buffer == 0 {
            return Err(RunnerError::invalid_config("event_buffer must be at least 1"));
        }
        if self.validation_concurrency > self.render_concurrency {
            tracing::warn!(
                render = self.render_concurrency,
                validation = self.validation_concurrency,
                "Validation pool is larger than the render pool"
            );
        }
        self.policy.validate()
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub abort_reason: Option<AbortReason>,
    pub state: RunState,
    pub quarantine: QuarantineLog,
    /// Render failures and abandoned pairs.
    pub errors: Vec<RunError>,
    /// Documents classified Valid.
    pub valid: Vec<RenderedResource>,
    /// Load totals, when anything was handed to the sink.
    pub load: Option<LoadReport>,
    pub started_at: OffsetDateTime,
    pub finished_at: OffsetDateTime,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn errors_with_reason(&self, reason: ReasonCode) -> impl Iterator<Item = &RunError> {
        self.errors.iter().filter(move |e| e.reason == reason)
    }
}

/// Drives one pipeline run.
pub struct RunController {
    engine: Arc<ProjectionEngine>,
    gate: Arc<ValidationGate>,
    sink: Option<Arc<dyn LoadSink>>,
    config: RunConfig,
}

impl RunController {
    pub fn new(
        engine: Arc<ProjectionEngine>,
        gate: Arc<ValidationGate>,
        config: RunConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            gate,
            sink: None,
            config,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn LoadSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the pipeline over every record the source yields.
    ///
    /// Record-level failures never surface as `Err`; they are classified in
    /// the report. `Err` means the run could not be carried out at all.
    pub async fn run(&self, source: &mut dyn EntitySource) -> Result<RunReport> {
        let started_at = OffsetDateTime::now_utc();
        tracing::info!(
            render_concurrency = self.config.render_concurrency,
            validation_concurrency = self.config.validation_concurrency,
            policy = ?self.config.policy,
            load_mode = ?self.config.load_mode,
            "Starting pipeline run"
        );

        let (event_tx, event_rx) = mpsc::channel(self.config.event_buffer);
        let (abort_tx, mut abort_rx) = watch::channel(false);

        let (stream_tx, loader) = match (&self.sink, self.config.load_mode) {
            (Some(sink), LoadMode::Streaming) => {
                let (tx, rx) = mpsc::channel(self.config.event_buffer);
                (Some(tx), Some(tokio::spawn(stream_load(sink.clone(), rx))))
            }
            _ => (None, None),
        };

        let aggregator = tokio::spawn(
            Aggregator::new(self.config.policy, abort_tx, stream_tx).run(event_rx),
        );

        let mut tasks = JoinSet::new();
        self.admit(source, &event_tx, &mut abort_rx, &mut tasks).await;
        drop(event_tx);

        self.drain(&mut tasks, &mut abort_rx).await;

        let aggregate = aggregator
            .await
            .map_err(|e| RunnerError::internal(format!("aggregator task failed: {e}")))?;

        let streamed = match loader {
            Some(handle) => Some(join_loader(handle).await?),
            None => None,
        };

        self.finish(aggregate, streamed, started_at).await
    }

    /// Pull records and hand them to render workers until the source ends
    /// or the run aborts.
    async fn admit(
        &self,
        source: &mut dyn EntitySource,
        events: &mpsc::Sender<Event>,
        abort_rx: &mut watch::Receiver<bool>,
        tasks: &mut JoinSet<()>,
    ) {
        let render_permits = Arc::new(Semaphore::new(self.config.render_concurrency));
        let validation_permits = Arc::new(Semaphore::new(self.config.validation_concurrency));
        let mut seq: u64 = 0;

        loop {
            if *abort_rx.borrow() {
                tracing::info!("Run aborted, no longer admitting records");
                break;
            }

            if tasks.len() >= self.config.event_buffer {
                tokio::select! {
                    biased;
                    changed = abort_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    Some(joined) = tasks.join_next() => log_join(joined),
                }
                continue;
            }

            let permit = tokio::select! {
                biased;
                changed = abort_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = render_permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let record = match source.next_record().await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::info!(records = seq, "Entity source exhausted");
                    break;
                }
                Err(e) => {
                    emit(events, Event::SourceFailed { message: e.to_string() }).await;
                    break;
                }
            };

            let template_ids: Vec<String> = self
                .engine
                .active_bindings(&record.entity_type)
                .into_iter()
                .map(|b| b.template_id.clone())
                .collect();
            if template_ids.is_empty() {
                emit(events, Event::Skipped { record_id: record.id }).await;
                continue;
            }

            seq += 1;
            emit(
                events,
                Event::Admitted {
                    seq,
                    record_id: record.id.clone(),
                    entity_type: record.entity_type.clone(),
                    template_ids,
                },
            )
            .await;

            tasks.spawn(process_record(
                seq,
                record,
                self.engine.clone(),
                self.gate.clone(),
                validation_permits.clone(),
                events.clone(),
                permit,
            ));

            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }
        }
    }

    /// Wait for in-flight records. After an abort the wait is bounded by the
    /// drain grace; whatever is still running then is cancelled.
    async fn drain(&self, tasks: &mut JoinSet<()>, abort_rx: &mut watch::Receiver<bool>) {
        loop {
            if *abort_rx.borrow() {
                break;
            }
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_join(joined),
                    None => return,
                },
                changed = abort_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let in_flight = tasks.len();
        if in_flight == 0 {
            return;
        }
        tracing::info!(
            in_flight,
            grace_ms = self.config.drain_grace.as_millis() as u64,
            "Draining in-flight records"
        );

        let drained = tokio::time::timeout(self.config.drain_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Drain grace expired, abandoning in-flight records"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    async fn finish(
        &self,
        aggregate: Aggregate,
        streamed: Option<LoadReport>,
        started_at: OffsetDateTime,
    ) -> Result<RunReport> {
        let Aggregate {
            state,
            abort_reason,
            quarantine,
            errors,
            valid,
        } = aggregate;

        let status = if state.aborted_early {
            RunStatus::AbortedEarly
        } else {
            RunStatus::Completed
        };

        let load = match (&self.sink, self.config.load_mode) {
            (Some(_), LoadMode::Streaming) => streamed,
            (Some(sink), LoadMode::AfterCompletion) if status == RunStatus::Completed => {
                Some(load_all(sink.as_ref(), &valid).await)
            }
            (Some(_), LoadMode::AfterCompletion) => {
                tracing::warn!(
                    valid = valid.len(),
                    "Run aborted, valid resources were not loaded"
                );
                None
            }
            _ => None,
        };

        if !state.is_balanced() {
            tracing::error!(state = ?state, "Run state does not account for every admitted pair");
        }

        tracing::info!(
            status = %status,
            records = state.records_read,
            pairs = state.pairs_admitted,
            valid = state.valid,
            quarantined = state.quarantined,
            render_failed = state.render_failed,
            abandoned = state.abandoned,
            "Pipeline run finished"
        );

        Ok(RunReport {
            status,
            abort_reason,
            state,
            quarantine,
            errors,
            valid,
            load,
            started_at,
            finished_at: OffsetDateTime::now_utc(),
        })
    }
}

impl std::fmt::Debug for RunController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunController")
            .field("config", &self.config)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

/// Project one record, then validate its documents.
async fn process_record(
    seq: u64,
    record: SourceRecord,
    engine: Arc<ProjectionEngine>,
    gate: Arc<ValidationGate>,
    validation_permits: Arc<Semaphore>,
    events: mpsc::Sender<Event>,
    render_permit: OwnedSemaphorePermit,
) {
    let projection = match tokio::task::spawn_blocking(move || engine.project(&record)).await {
        Ok(projection) => projection,
        Err(e) => {
            // The pairs stay pending and end up Abandoned.
            tracing::error!(seq, error = %e, "Projection task failed");
            return;
        }
    };
    drop(render_permit);

    emit(
        &events,
        Event::Projected {
            seq,
            rendered: projection.resources.len(),
        },
    )
    .await;

    for error in projection.errors {
        let message = error.kind.to_string();
        let run_error = RunError::new(
            error.record_id,
            error.entity_type,
            error.template_id,
            ReasonCode::RenderFailed,
            message,
        );
        emit(&events, Event::RenderFailed { seq, error: run_error }).await;
    }

    let validations = projection.resources.into_iter().map(|resource| {
        let gate = gate.clone();
        let permits = validation_permits.clone();
        let events = events.clone();
        async move {
            let result = gate.validate_within(&resource, &permits).await;
            emit(
                &events,
                Event::Validated {
                    seq,
                    resource,
                    result,
                },
            )
            .await;
        }
    });
    join_all(validations).await;
}

async fn emit(events: &mpsc::Sender<Event>, event: Event) {
    if events.send(event).await.is_err() {
        tracing::warn!("Run aggregator has stopped, dropping event");
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Record task panicked");
        }
    }
}

async fn stream_load(
    sink: Arc<dyn LoadSink>,
    mut rx: mpsc::Receiver<RenderedResource>,
) -> LoadReport {
    let mut report = LoadReport::default();
    while let Some(resource) = rx.recv().await {
        match sink.load(std::slice::from_ref(&resource)).await {
            Ok(results) => report.record(results),
            Err(e) => report.record_error(&e),
        }
    }
    if let Err(e) = sink.finish().await {
        report.record_error(&e);
    }
    report
}

async fn join_loader(handle: JoinHandle<LoadReport>) -> Result<LoadReport> {
    handle
        .await
        .map_err(|e| RunnerError::internal(format!("load task failed: {e}")))
}

async fn load_all(sink: &dyn LoadSink, valid: &[RenderedResource]) -> LoadReport {
    tracing::info!(documents = valid.len(), "Loading valid resources");
    let mut report = LoadReport::default();
    match sink.load(valid).await {
        Ok(results) => report.record(results),
        Err(e) => report.record_error(&e),
    }
    if let Err(e) = sink.finish().await {
        report.record_error(&e);
    }
    report
}
