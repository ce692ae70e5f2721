#![forbid(unsafe_code)]

mod logging;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use fonx_core::{BOOL_TYPES, DType, ExecutionMode, INT_TYPES, Sample, TensorValue};
use fonx_exempt::{
    CaseRule, CaseStatus, ExemptionError, ExemptionRegistry, OutcomeKind, SampleRule, run_guarded,
};
use fonx_opdb::{EvalError, OpInfo, find_op, op_db};
use serde::Serialize;

pub use logging::{LOG_SCHEMA_VERSION, StructuredCaseLog, mode_label};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct OpsetVersion(pub u32);

impl fmt::Display for OpsetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const TESTED_OPSETS: [OpsetVersion; 2] = [OpsetVersion(17), OpsetVersion(18)];

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub opsets: Vec<OpsetVersion>,
    pub strict_mode: bool,
    pub forensics_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let forensics_root = std::env::var("FONX_FORENSICS_DIR").map_or_else(
            |_| {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../artifacts/op_consistency")
            },
            PathBuf::from,
        );
        Self {
            opsets: TESTED_OPSETS.to_vec(),
            strict_mode: true,
            forensics_root,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        if self.strict_mode {
            ExecutionMode::Strict
        } else {
            ExecutionMode::Hardened
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    UnsupportedOp {
        op: String,
        opset: OpsetVersion,
    },
    UnsupportedDType {
        op: String,
        dtype: DType,
        opset: OpsetVersion,
    },
    Eval(EvalError),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedOp { op, opset } => {
                write!(f, "no graph lowering for '{op}' at opset {opset}")
            }
            Self::UnsupportedDType { op, dtype, opset } => {
                write!(
                    f,
                    "graph lowering for '{op}' rejects dtype {dtype} at opset {opset}"
                )
            }
            Self::Eval(error) => write!(f, "trace-time evaluation failed: {error}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<EvalError> for ExportError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphRuntimeError {
    UnknownNode {
        node_kind: String,
    },
    UnsupportedDType {
        node_kind: String,
        dtype: DType,
    },
    ScalarReduceAbort {
        node_kind: String,
        opset: OpsetVersion,
    },
    Eval(EvalError),
}

impl fmt::Display for GraphRuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode { node_kind } => {
                write!(f, "graph runtime has no kernel for node '{node_kind}'")
            }
            Self::UnsupportedDType { node_kind, dtype } => {
                write!(f, "node '{node_kind}' does not support dtype {dtype}")
            }
            Self::ScalarReduceAbort { node_kind, opset } => {
                write!(
                    f,
                    "runtime aborts on scalar input to '{node_kind}' at opset {opset}"
                )
            }
            Self::Eval(error) => write!(f, "graph evaluation failed: {error}"),
        }
    }
}

impl std::error::Error for GraphRuntimeError {}

impl From<EvalError> for GraphRuntimeError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

/// Single-node serialized form of one traced operator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedGraph {
    pub source_op: String,
    pub node_kind: String,
    pub opset: OpsetVersion,
}

pub trait GraphExporter {
    fn export(
        &self,
        op: &OpInfo,
        sample: &Sample,
        opset: OpsetVersion,
    ) -> Result<ExportedGraph, ExportError>;
}

pub trait GraphRuntime {
    fn run(&self, graph: &ExportedGraph, sample: &Sample)
    -> Result<TensorValue, GraphRuntimeError>;
}

#[must_use]
pub fn graph_node_kind(op_name: &str) -> Option<&'static str> {
    match op_name {
        "abs" => Some("Abs"),
        "acos" => Some("Acos"),
        "acosh" => Some("Acosh"),
        "add" => Some("Add"),
        "amax" => Some("ReduceMax"),
        "amin" => Some("ReduceMin"),
        "asin" => Some("Asin"),
        "atan" => Some("Atan"),
        "ceil" => Some("Ceil"),
        "clamp" => Some("Clip"),
        "mul" => Some("Mul"),
        "sub" => Some("Sub"),
        _ => None,
    }
}

/// Reference lowering used as the in-repo export collaborator. Its dtype
/// support table models the documented lowering gaps that the shipped
/// exemption list covers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceExporter;

impl GraphExporter for ReferenceExporter {
    fn export(
        &self,
        op: &OpInfo,
        sample: &Sample,
        opset: OpsetVersion,
    ) -> Result<ExportedGraph, ExportError> {
        let node_kind = graph_node_kind(op.name()).ok_or_else(|| ExportError::UnsupportedOp {
            op: op.qualified_name(),
            opset,
        })?;

        let dtype = sample.input().dtype();
        let rejected = match node_kind {
            "Acos" | "Acosh" | "Asin" | "Atan" => !dtype.is_float(),
            "Add" => dtype.is_bool(),
            "Ceil" => !dtype.is_float(),
            _ => false,
        };
        if rejected {
            return Err(ExportError::UnsupportedDType {
                op: op.qualified_name(),
                dtype,
                opset,
            });
        }

        Ok(ExportedGraph {
            source_op: op.qualified_name(),
            node_kind: node_kind.to_string(),
            opset,
        })
    }
}

/// Reference comparison oracle. Evaluates the exported node through the
/// eager kernels while enforcing the runtime-side gaps the exemption list
/// documents (scalar reduce abort at opset 18, int16 reduces, small-int
/// clip).
pub struct ReferenceRuntime {
    ops: Vec<OpInfo>,
}

impl ReferenceRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self { ops: op_db() }
    }
}

impl Default for ReferenceRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphRuntime for ReferenceRuntime {
    fn run(
        &self,
        graph: &ExportedGraph,
        sample: &Sample,
    ) -> Result<TensorValue, GraphRuntimeError> {
        let dtype = sample.input().dtype();
        match graph.node_kind.as_str() {
            kind @ ("ReduceMax" | "ReduceMin") => {
                if graph.opset >= OpsetVersion(18) && sample.input().is_scalar() {
                    return Err(GraphRuntimeError::ScalarReduceAbort {
                        node_kind: kind.to_string(),
                        opset: graph.opset,
                    });
                }
                if dtype == DType::I16 {
                    return Err(GraphRuntimeError::UnsupportedDType {
                        node_kind: kind.to_string(),
                        dtype,
                    });
                }
            }
            kind @ "Clip" => {
                if matches!(dtype, DType::U8 | DType::I8 | DType::I16) {
                    return Err(GraphRuntimeError::UnsupportedDType {
                        node_kind: kind.to_string(),
                        dtype,
                    });
                }
            }
            _ => {}
        }

        let op = find_op(&self.ops, &graph.source_op).ok_or_else(|| {
            GraphRuntimeError::UnknownNode {
                node_kind: graph.node_kind.clone(),
            }
        })?;
        Ok(op.eval(sample)?)
    }
}

/// Relaxed tolerances for floating dtypes, exact comparison otherwise.
#[must_use]
pub fn tolerances_for(dtype: DType) -> (f64, f64) {
    match dtype {
        DType::F64 | DType::F32 => (1e-5, 2e-5),
        _ => (0.0, 0.0),
    }
}

pub fn compare_tensors(
    actual: &TensorValue,
    expected: &TensorValue,
    rtol: f64,
    atol: f64,
) -> Result<(), String> {
    if actual.dtype() != expected.dtype() {
        return Err(format!(
            "dtype mismatch: actual={}, expected={}",
            actual.dtype(),
            expected.dtype()
        ));
    }
    if actual.shape() != expected.shape() {
        return Err(format!(
            "shape mismatch: actual={:?}, expected={:?}",
            actual.shape(),
            expected.shape()
        ));
    }
    for (index, (a, e)) in actual.data().iter().zip(expected.data().iter()).enumerate() {
        if a == e || (a.is_nan() && e.is_nan()) {
            continue;
        }
        if a.is_nan() != e.is_nan() {
            return Err(format!(
                "value mismatch at element {index}: actual={a}, expected={e} (NaN on one side only)"
            ));
        }
        let tolerance = atol + rtol * e.abs();
        if (a - e).abs() > tolerance {
            return Err(format!(
                "value mismatch at element {index}: actual={a}, expected={e}, tolerance={tolerance}"
            ));
        }
    }
    Ok(())
}

fn execute_sample(
    op: &OpInfo,
    sample: &Sample,
    opset: OpsetVersion,
    exporter: &dyn GraphExporter,
    runtime: &dyn GraphRuntime,
) -> Result<(), String> {
    let graph = exporter
        .export(op, sample, opset)
        .map_err(|error| format!("export failure: {error}"))?;
    let observed = runtime
        .run(&graph, sample)
        .map_err(|error| format!("graph runtime failure: {error}"))?;
    let expected = op
        .eval(sample)
        .map_err(|error| format!("eager eval failure: {error}"))?;
    let (rtol, atol) = tolerances_for(expected.dtype());
    compare_tensors(&observed, &expected, rtol, atol)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseReport {
    pub op: String,
    pub dtype: DType,
    pub opset: OpsetVersion,
    pub sample_index: Option<usize>,
    pub mode: ExecutionMode,
    pub status: CaseStatus,
    pub forensic_log: StructuredCaseLog,
}

impl CaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        matches!(self.status, CaseStatus::Passed)
    }

    #[must_use]
    pub fn blocking(&self) -> bool {
        self.status.is_blocking(self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub mode: &'static str,
    pub opsets: Vec<u32>,
    pub cases_total: usize,
    pub passed: usize,
    pub skipped: usize,
    pub expected_failures: usize,
    pub unexpected_passes: usize,
    pub failed: usize,
    pub blocking: usize,
}

pub fn run_consistency(
    config: &HarnessConfig,
    ops: &[OpInfo],
    registry: &ExemptionRegistry,
    exporter: &dyn GraphExporter,
    runtime: &dyn GraphRuntime,
    mode: ExecutionMode,
) -> (SuiteReport, Vec<CaseReport>) {
    let mut reports = Vec::new();
    for &opset in &config.opsets {
        for op in ops {
            for &dtype in op.dtypes() {
                run_case(op, dtype, opset, registry, exporter, runtime, mode, &mut reports);
            }
        }
    }
    let summary = summarize(mode, &config.opsets, &reports);
    (summary, reports)
}

#[allow(clippy::too_many_arguments)]
fn run_case(
    op: &OpInfo,
    dtype: DType,
    opset: OpsetVersion,
    registry: &ExemptionRegistry,
    exporter: &dyn GraphExporter,
    runtime: &dyn GraphRuntime,
    mode: ExecutionMode,
    reports: &mut Vec<CaseReport>,
) {
    match registry.resolve_case(op.name(), op.variant(), dtype) {
        Some(exemption) if exemption.outcome == OutcomeKind::Skip => {
            let status = CaseStatus::Skipped {
                reason: exemption.reason.to_string(),
            };
            reports.push(build_report(op, dtype, opset, None, mode, status));
        }
        Some(exemption) => {
            // Case-level expected failure: the whole dtype case runs and is
            // expected to raise somewhere; passing every sample is the
            // anomaly.
            let mut first_error = None;
            for sample in op.sample_inputs(dtype) {
                if let Err(error) = execute_sample(op, &sample, opset, exporter, runtime) {
                    first_error = Some(error);
                    break;
                }
            }
            let status = match first_error {
                Some(error) => CaseStatus::ExpectedFailure {
                    reason: exemption.reason.to_string(),
                    error,
                },
                None => CaseStatus::UnexpectedPass {
                    reason: exemption.reason.to_string(),
                },
            };
            reports.push(build_report(op, dtype, opset, None, mode, status));
        }
        None => {
            for (index, sample) in op.sample_inputs(dtype).into_iter().enumerate() {
                let exemption = registry.resolve_sample(op.name(), &sample);
                let status = run_guarded(exemption.as_ref(), || {
                    execute_sample(op, &sample, opset, exporter, runtime)
                });
                reports.push(build_report(op, dtype, opset, Some(index), mode, status));
            }
        }
    }
}

fn build_report(
    op: &OpInfo,
    dtype: DType,
    opset: OpsetVersion,
    sample_index: Option<usize>,
    mode: ExecutionMode,
    status: CaseStatus,
) -> CaseReport {
    let qualified = op.qualified_name();
    let forensic_log = logging::case_log(&qualified, dtype, opset, sample_index, mode, &status);
    CaseReport {
        op: qualified,
        dtype,
        opset,
        sample_index,
        mode,
        status,
        forensic_log,
    }
}

fn summarize(mode: ExecutionMode, opsets: &[OpsetVersion], reports: &[CaseReport]) -> SuiteReport {
    let mut summary = SuiteReport {
        suite: "op_consistency",
        mode: mode_label(mode),
        opsets: opsets.iter().map(|opset| opset.0).collect(),
        cases_total: reports.len(),
        passed: 0,
        skipped: 0,
        expected_failures: 0,
        unexpected_passes: 0,
        failed: 0,
        blocking: 0,
    };
    for report in reports {
        match report.status {
            CaseStatus::Passed => summary.passed += 1,
            CaseStatus::Skipped { .. } => summary.skipped += 1,
            CaseStatus::ExpectedFailure { .. } => summary.expected_failures += 1,
            CaseStatus::UnexpectedPass { .. } => summary.unexpected_passes += 1,
            CaseStatus::Failed { .. } => summary.failed += 1,
        }
        if report.blocking() {
            summary.blocking += 1;
        }
    }
    summary
}

/// The curated exemption table for the reference collaborators. Entries are
/// ordered; for overlapping per-sample rules the first registered one wins.
pub fn default_exemptions() -> Result<ExemptionRegistry, ExemptionError> {
    let bool_and_int = || BOOL_TYPES.into_iter().chain(INT_TYPES);

    let case_rules = vec![
        CaseRule::skip(
            "acos",
            "graph format has no Acos lowering for bool or integral inputs",
        )
        .with_dtypes(bool_and_int()),
        CaseRule::skip(
            "acosh",
            "graph format has no Acosh lowering for bool or integral inputs",
        )
        .with_dtypes(bool_and_int()),
        CaseRule::xfail("add", "graph format has no Add lowering for bool inputs")
            .with_dtypes(BOOL_TYPES),
        CaseRule::xfail("as_strided", "the graph form cannot express partial views")
            .with_variant("partial_views"),
        CaseRule::xfail(
            "asin",
            "graph format has no Asin lowering for bool or integral inputs",
        )
        .with_dtypes(bool_and_int()),
        CaseRule::xfail(
            "atan",
            "graph format has no Atan lowering for bool or integral inputs",
        )
        .with_dtypes(bool_and_int()),
        CaseRule::skip(
            "ceil",
            "graph format has no Ceil lowering for bool or integral inputs",
        )
        .with_dtypes(bool_and_int()),
    ];

    let sample_rules = vec![
        SampleRule::skip(
            "amax",
            |sample| sample.input().is_scalar(),
            "graph runtime aborts on scalar inputs to ReduceMax at opset 18",
        ),
        SampleRule::xfail(
            "amax",
            |sample| sample.input().dtype() == DType::I16,
            "ReduceMax does not support int16",
        ),
        SampleRule::skip(
            "amin",
            |sample| sample.input().is_scalar(),
            "graph runtime aborts on scalar inputs to ReduceMin at opset 18",
        ),
        SampleRule::xfail(
            "amin",
            |sample| sample.input().dtype() == DType::I16,
            "ReduceMin does not support int16",
        ),
        SampleRule::xfail(
            "clamp",
            |sample| matches!(sample.input().dtype(), DType::U8 | DType::I8 | DType::I16),
            "Clip lowering rejects uint8, int8 and int16",
        ),
    ];

    ExemptionRegistry::new(case_rules, sample_rules)
}

/// Operator database restricted to `filter`, matched against the plain or
/// variant-qualified operator name. `None` keeps the full database.
#[must_use]
pub fn ops_matching(filter: Option<&str>) -> Vec<OpInfo> {
    op_db()
        .into_iter()
        .filter(|op| filter.is_none_or(|name| op.name() == name || op.qualified_name() == name))
        .collect()
}

/// Convenience entry point wiring the operator database, the curated
/// exemption table, and the reference collaborators together.
pub fn run_default_consistency(
    config: &HarnessConfig,
    mode: ExecutionMode,
) -> Result<(SuiteReport, Vec<CaseReport>), String> {
    let registry = default_exemptions().map_err(|error| error.to_string())?;
    let ops = op_db();
    let exporter = ReferenceExporter;
    let runtime = ReferenceRuntime::new();
    Ok(run_consistency(
        config, &ops, &registry, &exporter, &runtime, mode,
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForensicsSummary {
    pub output_path: PathBuf,
    pub log_entries: usize,
    pub blocking_entries: usize,
}

pub fn emit_forensics_jsonl(
    path: &Path,
    reports: &[CaseReport],
) -> Result<ForensicsSummary, String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|error| format!("failed creating {}: {error}", parent.display()))?;
    }

    let mut lines = String::new();
    for report in reports {
        let line = serde_json::to_string(&report.forensic_log)
            .map_err(|error| format!("failed serializing case log: {error}"))?;
        lines.push_str(&line);
        lines.push('\n');
    }
    fs::write(path, lines)
        .map_err(|error| format!("failed writing {}: {error}", path.display()))?;

    Ok(ForensicsSummary {
        output_path: path.to_path_buf(),
        log_entries: reports.len(),
        blocking_entries: reports.iter().filter(|report| report.blocking()).count(),
    })
}
