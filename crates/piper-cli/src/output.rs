use std::collections::BTreeMap;

use colored::Colorize;
use piper_projection::MappingRegistry;
use piper_runner::{RunStatus, RunSummary};
use tabled::builder::Builder;
use tabled::settings::Style;

/// Failures listed individually before the table is cut short.
const MAX_FAILURE_ROWS: usize = 20;

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

pub fn print_summary(summary: &RunSummary) {
    let state = &summary.state;
    let status = match summary.status {
        RunStatus::Completed => summary.status.as_str().green(),
        _ => summary.status.as_str().red(),
    };
    println!("{}: {}", "Status".cyan(), status);
    if let Some(reason) = &summary.abort_reason {
        println!("{}: {}", "Reason".cyan(), reason);
    }
    println!(
        "{}: {:.1}s",
        "Elapsed".cyan(),
        summary.elapsed().as_seconds_f64()
    );

    let counts = [
        ("Records read", state.records_read),
        ("Records skipped", state.records_skipped),
        ("Records completed", state.records_completed),
        ("Pairs admitted", state.pairs_admitted),
        ("Valid", state.valid),
        ("Invalid", state.invalid),
        ("Transport failed", state.transport_failed),
        ("Render failed", state.render_failed),
        ("Abandoned", state.abandoned),
    ];
    let mut builder = Builder::default();
    for (label, count) in counts {
        builder.push_record([label.to_string(), count.to_string()]);
    }
    println!("{}", builder.build().with(Style::rounded()));

    if let Some(load) = &summary.load {
        println!(
            "{}: {} accepted, {} rejected, {} batch errors",
            "Load".cyan(),
            load.accepted,
            load.rejected.len(),
            load.errors.len()
        );
    }

    if summary.failures.is_empty() {
        return;
    }

    let mut builder = Builder::default();
    builder.push_record(["Record", "Template", "Reason", "Detail"]);
    for failure in summary.failures.iter().take(MAX_FAILURE_ROWS) {
        let detail = match failure.issues.first() {
            Some(issue) => {
                let extra = failure.issues.len() - 1;
                if extra > 0 {
                    format!("{} (+{extra} more)", issue.message)
                } else {
                    issue.message.clone()
                }
            }
            None => failure.message.clone().unwrap_or_default(),
        };
        builder.push_record([
            failure.record_id.as_str(),
            failure.template_id.as_str(),
            failure.reason.as_str(),
            detail.as_str(),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    if summary.failures.len() > MAX_FAILURE_ROWS {
        println!(
            "... {} more, see the summary file",
            summary.failures.len() - MAX_FAILURE_ROWS
        );
    }
}

pub fn print_bindings(registry: &MappingRegistry) {
    if registry.is_empty() {
        println!("No bindings configured.");
        return;
    }
    let mut builder = Builder::default();
    builder.push_record(["Entity type", "#", "Template", "Resource kind", "Parameters"]);
    for entity_type in registry.entity_types() {
        for (i, binding) in registry.bindings_for(entity_type).iter().enumerate() {
            let params = if binding.parameters.is_empty() {
                "-".to_string()
            } else {
                serde_json::Value::Object(binding.parameters.clone()).to_string()
            };
            builder.push_record([
                entity_type.to_string(),
                i.to_string(),
                binding.template_id.clone(),
                binding.resource_kind.clone().unwrap_or_else(|| "-".into()),
                params,
            ]);
        }
    }
    println!("{}", builder.build().with(Style::rounded()));
}

/// Pair counts per (template, resource kind) from a dry run.
pub fn print_dry_run(rendered: &BTreeMap<(String, String), u64>, records: u64, failed: u64) {
    let mut builder = Builder::default();
    builder.push_record(["Template", "Resource kind", "Rendered"]);
    for ((template_id, kind), count) in rendered {
        builder.push_record([template_id.clone(), kind.clone(), count.to_string()]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    println!("{}: {records}", "Records".cyan());
    if failed > 0 {
        print_warning(&format!("{failed} render failure(s)"));
    } else {
        print_success("Every pair rendered");
    }
}
