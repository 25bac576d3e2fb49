use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use piper_core::{EntitySource, NdjsonSource};
use piper_projection::ProjectionEngine;
use piper_runner::{RunController, RunStatus, RunSummary};

use crate::cli::RunArgs;
use crate::config::{ConfigError, PipelineConfig, resolve_path};
use crate::output::{print_dry_run, print_summary};
use crate::pipeline::{build_engine, build_gate, build_sink};

pub async fn run(cfg: &PipelineConfig, config_path: &Path, args: &RunArgs) -> Result<RunStatus> {
    let engine = build_engine(cfg, config_path, &args.only)?;

    let source_path = resolve_path(config_path, &cfg.source.path);
    let mut source = NdjsonSource::open(&source_path)
        .await
        .map_err(|e| ConfigError::new(format!("{}: {e}", source_path.display())))
        .context("opening entity source")?;

    if args.dry_run {
        dry_run(&engine, &mut source).await?;
        return Ok(RunStatus::Completed);
    }

    let gate = build_gate(cfg)?;
    let mut controller = RunController::new(Arc::new(engine), Arc::new(gate), cfg.run_config())
        .map_err(|e| ConfigError::new(e.to_string()))?;
    if let Some(sink) = build_sink(cfg, config_path)? {
        controller = controller.with_sink(sink);
    }

    let report = controller.run(&mut source).await?;

    if let Some(path) = &cfg.output.quarantine {
        report
            .quarantine
            .write_ndjson(resolve_path(config_path, path))
            .await
            .context("writing quarantine log")?;
    }

    let summary = RunSummary::from_report(&report);
    if let Some(path) = &cfg.output.summary {
        summary
            .write_json(resolve_path(config_path, path))
            .await
            .context("writing run summary")?;
    }
    print_summary(&summary);

    Ok(report.status)
}

/// Render every record and count the results without validating or loading.
async fn dry_run(engine: &ProjectionEngine, source: &mut dyn EntitySource) -> Result<()> {
    let mut rendered: BTreeMap<(String, String), u64> = BTreeMap::new();
    let mut records = 0u64;
    let mut failed = 0u64;

    while let Some(record) = source.next_record().await? {
        records += 1;
        let projection = engine.project(&record);
        for resource in projection.resources {
            *rendered
                .entry((resource.template_id, resource.resource_kind))
                .or_insert(0) += 1;
        }
        for error in &projection.errors {
            tracing::warn!(error = %error, "Render failed");
            failed += 1;
        }
    }

    print_dry_run(&rendered, records, failed);
    Ok(())
}
