use std::collections::BTreeMap;

use fonx_core::{DType, ExecutionMode};
use fonx_exempt::CaseStatus;
use serde::Serialize;
use serde_json::{Value, json};

use crate::OpsetVersion;

pub const LOG_SCHEMA_VERSION: &str = "fonx-consistency-log-v1";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredCaseLog {
    pub schema_version: &'static str,
    pub suite: &'static str,
    pub scenario_id: String,
    pub mode: &'static str,
    pub op: String,
    pub dtype: String,
    pub opset: u32,
    pub sample_index: Option<usize>,
    pub status: &'static str,
    pub reason_code: &'static str,
    pub reason: String,
    pub replay_command: String,
    pub extra_fields: BTreeMap<String, Value>,
}

#[must_use]
pub fn mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Strict => "strict",
        ExecutionMode::Hardened => "hardened",
    }
}

pub(crate) fn case_log(
    op: &str,
    dtype: DType,
    opset: OpsetVersion,
    sample_index: Option<usize>,
    mode: ExecutionMode,
    status: &CaseStatus,
) -> StructuredCaseLog {
    let mut extra_fields = BTreeMap::new();
    if let Some(error) = status.error() {
        extra_fields.insert("error".to_string(), json!(error));
    }

    StructuredCaseLog {
        schema_version: LOG_SCHEMA_VERSION,
        suite: "op_consistency",
        scenario_id: scenario_id(mode, op, dtype, opset, sample_index),
        mode: mode_label(mode),
        op: op.to_string(),
        dtype: dtype.label().to_string(),
        opset: opset.0,
        sample_index,
        status: status.label(),
        reason_code: reason_code(status),
        reason: status.reason().unwrap_or_default().to_string(),
        replay_command: format!(
            "cargo run -p fonx-harness --bin run_consistency_matrix -- --mode {} --op {op} --opset {opset}",
            mode_label(mode)
        ),
        extra_fields,
    }
}

fn scenario_id(
    mode: ExecutionMode,
    op: &str,
    dtype: DType,
    opset: OpsetVersion,
    sample_index: Option<usize>,
) -> String {
    let suffix = sample_index.map_or(String::new(), |index| format!("_s{index}"));
    format!(
        "op_consistency/{}:{}_{}_opset{}{suffix}",
        mode_label(mode),
        canonical_case_name(op),
        dtype.label(),
        opset.0
    )
}

fn canonical_case_name(case_name: &str) -> String {
    let mut out = String::with_capacity(case_name.len());
    for ch in case_name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}

fn reason_code(status: &CaseStatus) -> &'static str {
    match status {
        CaseStatus::Passed => "none",
        CaseStatus::Skipped { .. } => "exemption.skip",
        CaseStatus::ExpectedFailure { .. } => "exemption.expected_failure",
        CaseStatus::UnexpectedPass { .. } => "exemption.unexpected_pass",
        CaseStatus::Failed { .. } => "consistency.unmatched_failure",
    }
}
