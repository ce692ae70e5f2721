use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fonx_core::{DType, ExecutionMode, Sample};
use fonx_exempt::{CaseRule, CaseStatus, ExemptionRegistry, SampleRule};
use fonx_harness::{
    ExportError, ExportedGraph, GraphExporter, HarnessConfig, OpsetVersion, ReferenceExporter,
    ReferenceRuntime, default_exemptions, emit_forensics_jsonl, ops_matching, run_consistency,
    run_default_consistency,
};
use fonx_opdb::{OpInfo, find_op, op_db};

fn single_opset_config() -> HarnessConfig {
    HarnessConfig {
        opsets: vec![OpsetVersion(18)],
        strict_mode: true,
        forensics_root: std::env::temp_dir(),
    }
}

fn db_op(qualified_name: &str) -> OpInfo {
    *find_op(&op_db(), qualified_name).expect("operator must be registered")
}

#[test]
fn strict_matrix_has_no_blocking_cases() {
    let cfg = HarnessConfig::default_paths();
    let (report, cases) =
        run_default_consistency(&cfg, ExecutionMode::Strict).expect("strict run should build");

    assert_eq!(report.suite, "op_consistency");
    assert_eq!(report.mode, "strict");
    assert_eq!(report.cases_total, cases.len());
    assert_eq!(report.failed, 0);
    assert_eq!(report.unexpected_passes, 0);
    assert_eq!(report.blocking, 0);
    assert_eq!(
        report.passed + report.skipped + report.expected_failures,
        report.cases_total
    );
}

#[test]
fn single_opset_matrix_counts_are_stable() {
    let cfg = single_opset_config();
    let (report, _) =
        run_default_consistency(&cfg, ExecutionMode::Strict).expect("strict run should build");

    assert_eq!(report.cases_total, 239);
    assert_eq!(report.passed, 179);
    assert_eq!(report.skipped, 34);
    assert_eq!(report.expected_failures, 26);
    assert_eq!(report.unexpected_passes, 0);
    assert_eq!(report.failed, 0);
}

#[test]
fn hardened_matrix_matches_strict_totals() {
    let cfg = single_opset_config();
    let (strict, _) =
        run_default_consistency(&cfg, ExecutionMode::Strict).expect("strict run should build");
    let (hardened, _) =
        run_default_consistency(&cfg, ExecutionMode::Hardened).expect("hardened run should build");

    assert_eq!(hardened.mode, "hardened");
    assert_eq!(hardened.cases_total, strict.cases_total);
    assert_eq!(hardened.passed, strict.passed);
    assert_eq!(hardened.skipped, strict.skipped);
    assert_eq!(hardened.expected_failures, strict.expected_failures);
    assert_eq!(hardened.blocking, 0);
}

struct CountingExporter {
    inner: ReferenceExporter,
    calls: AtomicUsize,
}

impl CountingExporter {
    fn new() -> Self {
        Self {
            inner: ReferenceExporter,
            calls: AtomicUsize::new(0),
        }
    }
}

impl GraphExporter for CountingExporter {
    fn export(
        &self,
        op: &OpInfo,
        sample: &Sample,
        opset: OpsetVersion,
    ) -> Result<ExportedGraph, ExportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.export(op, sample, opset)
    }
}

#[test]
fn skipped_cases_never_reach_the_exporter() {
    let cfg = single_opset_config();
    let ops = vec![db_op("abs")];
    let registry = ExemptionRegistry::new(
        vec![CaseRule::skip("abs", "pretend the lowering is broken")],
        Vec::new(),
    )
    .expect("registry should build");
    let exporter = CountingExporter::new();
    let runtime = ReferenceRuntime::new();

    let (report, cases) = run_consistency(
        &cfg,
        &ops,
        &registry,
        &exporter,
        &runtime,
        ExecutionMode::Strict,
    );

    assert_eq!(exporter.calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.skipped, report.cases_total);
    assert!(cases.iter().all(|case| case.sample_index.is_none()));
}

#[test]
fn sample_skip_suppresses_only_matching_samples() {
    let cfg = single_opset_config();
    let ops = vec![db_op("amax")];
    let registry = default_exemptions().expect("curated table must validate");
    let exporter = ReferenceExporter;
    let runtime = ReferenceRuntime::new();

    let (_, cases) = run_consistency(
        &cfg,
        &ops,
        &registry,
        &exporter,
        &runtime,
        ExecutionMode::Strict,
    );

    let f32_cases: Vec<_> = cases
        .iter()
        .filter(|case| case.dtype == DType::F32)
        .collect();
    assert_eq!(f32_cases.len(), 3);
    assert!(matches!(f32_cases[0].status, CaseStatus::Skipped { .. }));
    assert_eq!(f32_cases[0].sample_index, Some(0));
    assert!(matches!(f32_cases[1].status, CaseStatus::Passed));
    assert!(matches!(f32_cases[2].status, CaseStatus::Passed));

    let i16_vector_cases: Vec<_> = cases
        .iter()
        .filter(|case| case.dtype == DType::I16 && case.sample_index != Some(0))
        .collect();
    assert_eq!(i16_vector_cases.len(), 2);
    for case in i16_vector_cases {
        assert!(matches!(case.status, CaseStatus::ExpectedFailure { .. }));
        assert!(
            case.status
                .error()
                .is_some_and(|error| error.contains("int16"))
        );
    }
}

#[test]
fn stale_exemption_blocks_strict_but_not_hardened() {
    let cfg = single_opset_config();
    let ops = vec![db_op("abs")];
    // abs passes on f64, so this xfail is stale by construction.
    let registry = ExemptionRegistry::new(
        vec![CaseRule::xfail("abs", "stale entry").with_dtypes([DType::F64])],
        Vec::new(),
    )
    .expect("registry should build");
    let exporter = ReferenceExporter;
    let runtime = ReferenceRuntime::new();

    let (strict, strict_cases) = run_consistency(
        &cfg,
        &ops,
        &registry,
        &exporter,
        &runtime,
        ExecutionMode::Strict,
    );
    let (hardened, _) = run_consistency(
        &cfg,
        &ops,
        &registry,
        &exporter,
        &runtime,
        ExecutionMode::Hardened,
    );

    assert_eq!(strict.unexpected_passes, 1);
    assert_eq!(strict.blocking, 1);
    assert_eq!(hardened.unexpected_passes, 1);
    assert_eq!(hardened.blocking, 0);

    let flagged = strict_cases
        .iter()
        .find(|case| matches!(case.status, CaseStatus::UnexpectedPass { .. }))
        .expect("the stale entry must surface");
    assert_eq!(flagged.dtype, DType::F64);
    assert_eq!(flagged.forensic_log.reason_code, "exemption.unexpected_pass");
}

#[test]
fn case_rules_take_precedence_over_sample_rules() {
    let cfg = single_opset_config();
    let ops = vec![db_op("amax")];
    let registry = ExemptionRegistry::new(
        vec![CaseRule::skip("amax", "whole case disabled")],
        vec![SampleRule::xfail(
            "amax",
            |_| true,
            "would match every sample",
        )],
    )
    .expect("registry should build");
    let exporter = ReferenceExporter;
    let runtime = ReferenceRuntime::new();

    let (report, cases) = run_consistency(
        &cfg,
        &ops,
        &registry,
        &exporter,
        &runtime,
        ExecutionMode::Strict,
    );

    // One case-level report per dtype; no per-sample reports at all.
    assert_eq!(report.cases_total, db_op("amax").dtypes().len());
    assert_eq!(report.skipped, report.cases_total);
    assert!(cases.iter().all(|case| case.sample_index.is_none()));
}

#[test]
fn expected_failure_reports_carry_reason_and_error() {
    let cfg = single_opset_config();
    let (_, cases) =
        run_default_consistency(&cfg, ExecutionMode::Strict).expect("strict run should build");

    let bool_add = cases
        .iter()
        .find(|case| case.op == "add" && case.dtype == DType::Bool)
        .expect("bool add case must be present");
    match &bool_add.status {
        CaseStatus::ExpectedFailure { reason, error } => {
            assert!(reason.contains("bool"));
            assert!(error.contains("export failure"));
        }
        other => panic!("bool add should be an expected failure, got {other:?}"),
    }
    assert_eq!(bool_add.sample_index, None);
    assert_eq!(
        bool_add.forensic_log.reason_code,
        "exemption.expected_failure"
    );
}

#[test]
fn op_filter_keeps_summary_and_forensics_in_agreement() {
    let cfg = single_opset_config();
    let ops = ops_matching(Some("amax"));
    assert!(!ops.is_empty());
    assert!(ops.iter().all(|op| op.name() == "amax"));

    let registry = default_exemptions().expect("curated table must validate");
    let exporter = ReferenceExporter;
    let runtime = ReferenceRuntime::new();
    let (report, cases) = run_consistency(
        &cfg,
        &ops,
        &registry,
        &exporter,
        &runtime,
        ExecutionMode::Strict,
    );

    assert_eq!(report.cases_total, cases.len());
    assert!(cases.iter().all(|case| case.op == "amax"));

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("fonx_filter_{stamp}.jsonl"));
    let summary = emit_forensics_jsonl(&path, &cases).expect("emit should succeed");
    let _ = std::fs::remove_file(&path);
    assert_eq!(summary.log_entries, report.cases_total);

    // Variant-qualified names resolve too; unknown names match nothing.
    assert_eq!(ops_matching(Some("as_strided.partial_views")).len(), 1);
    assert!(ops_matching(Some("no_such_op")).is_empty());
}

#[test]
fn forensics_log_emits_one_line_per_case() {
    let cfg = single_opset_config();
    let (report, cases) =
        run_default_consistency(&cfg, ExecutionMode::Strict).expect("strict run should build");

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("fonx_smoke_{stamp}.jsonl"));
    let summary = emit_forensics_jsonl(&path, &cases).expect("emit should succeed");
    let raw = std::fs::read_to_string(&path).expect("log should be readable");
    let _ = std::fs::remove_file(&path);

    assert_eq!(summary.log_entries, report.cases_total);
    assert_eq!(summary.blocking_entries, 0);
    assert_eq!(raw.lines().count(), report.cases_total);

    for line in raw.lines().take(5) {
        let value: serde_json::Value =
            serde_json::from_str(line).expect("each line should be valid json");
        assert_eq!(
            value.get("suite").and_then(|v| v.as_str()),
            Some("op_consistency")
        );
        assert!(
            value
                .get("replay_command")
                .and_then(|v| v.as_str())
                .is_some_and(|cmd| cmd.contains("run_consistency_matrix"))
        );
    }
}
