#![forbid(unsafe_code)]

use std::path::PathBuf;

use fonx_core::ExecutionMode;
use fonx_harness::{
    HarnessConfig, OpsetVersion, ReferenceExporter, ReferenceRuntime, default_exemptions,
    emit_forensics_jsonl, mode_label, ops_matching, run_consistency,
};
use serde_json::json;

fn main() -> Result<(), String> {
    let mut mode = String::from("both");
    let mut output: Option<PathBuf> = None;
    let mut op_filter: Option<String> = None;
    let mut opset_filter: Option<u32> = None;
    let mut print_full_log = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires one of: strict|hardened|both".to_string())?;
                mode = value;
            }
            "--output" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--output requires a file path".to_string())?;
                output = Some(PathBuf::from(value));
            }
            "--op" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--op requires an operator name (e.g., amax)".to_string())?;
                op_filter = Some(value);
            }
            "--opset" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--opset requires a version number (e.g., 18)".to_string())?;
                let parsed = value
                    .parse::<u32>()
                    .map_err(|error| format!("invalid opset '{value}': {error}"))?;
                opset_filter = Some(parsed);
            }
            "--print-full-log" => {
                print_full_log = true;
            }
            other => {
                return Err(format!(
                    "unknown arg '{other}'. usage: run_consistency_matrix [--mode strict|hardened|both] [--op NAME] [--opset N] [--output path] [--print-full-log]"
                ));
            }
        }
    }

    let modes = parse_modes(mode.as_str())?;
    let mut config = HarnessConfig::default_paths();
    if let Some(opset) = opset_filter {
        config.opsets = vec![OpsetVersion(opset)];
    }
    let output_path = output.unwrap_or_else(|| config.forensics_root.join("op_matrix.jsonl"));

    let ops = ops_matching(op_filter.as_deref());
    if ops.is_empty() {
        return Err(format!(
            "no operator matches filter '{}'",
            op_filter.as_deref().unwrap_or_default()
        ));
    }
    let registry = default_exemptions().map_err(|error| error.to_string())?;
    let exporter = ReferenceExporter;
    let runtime = ReferenceRuntime::new();

    let mut all_reports = Vec::new();
    let mut mode_summaries = Vec::new();
    for &run_mode in &modes {
        let (summary, mut reports) =
            run_consistency(&config, &ops, &registry, &exporter, &runtime, run_mode);
        mode_summaries.push(summary);
        all_reports.append(&mut reports);
    }

    let forensics = emit_forensics_jsonl(output_path.as_path(), &all_reports)?;

    if print_full_log {
        let raw = std::fs::read_to_string(forensics.output_path.as_path()).map_err(|error| {
            format!(
                "failed to read generated log {}: {error}",
                forensics.output_path.display()
            )
        })?;
        print!("{raw}");
        return Ok(());
    }

    let mode_labels: Vec<&str> = modes.iter().copied().map(mode_label).collect();
    let per_mode: Vec<_> = mode_summaries
        .iter()
        .map(|summary| {
            json!({
                "mode": summary.mode,
                "cases_total": summary.cases_total,
                "passed": summary.passed,
                "skipped": summary.skipped,
                "expected_failures": summary.expected_failures,
                "unexpected_passes": summary.unexpected_passes,
                "failed": summary.failed,
                "blocking": summary.blocking,
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "status": "ok",
            "output_path": forensics.output_path.display().to_string(),
            "log_entries": forensics.log_entries,
            "blocking_entries": forensics.blocking_entries,
            "modes": mode_labels,
            "op_filter": op_filter,
            "opsets": config.opsets.iter().map(|opset| opset.0).collect::<Vec<_>>(),
            "summaries": per_mode,
        }))
        .map_err(|error| format!("failed to serialize summary: {error}"))?
    );

    Ok(())
}

fn parse_modes(raw: &str) -> Result<Vec<ExecutionMode>, String> {
    match raw {
        "strict" => Ok(vec![ExecutionMode::Strict]),
        "hardened" => Ok(vec![ExecutionMode::Hardened]),
        "both" => Ok(vec![ExecutionMode::Strict, ExecutionMode::Hardened]),
        _ => Err(format!(
            "unsupported mode '{raw}'; expected strict|hardened|both"
        )),
    }
}
