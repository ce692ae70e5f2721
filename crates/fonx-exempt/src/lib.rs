#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use fonx_core::{DType, ExecutionMode, Sample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    ExpectedFailure,
    Skip,
}

impl OutcomeKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ExpectedFailure => "expected_failure",
            Self::Skip => "skip",
        }
    }
}

pub type SampleMatcher = Arc<dyn Fn(&Sample) -> bool + Send + Sync>;

/// Coarse-grained rule: matched against a whole (operator, variant, dtype)
/// case before any sample is generated. A rule with no dtype set and no
/// variant applies to every case of the operator.
#[derive(Debug, Clone)]
pub struct CaseRule {
    op_name: String,
    variant: Option<String>,
    dtypes: Option<Vec<DType>>,
    outcome: OutcomeKind,
    reason: String,
}

impl CaseRule {
    #[must_use]
    pub fn xfail(op_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(op_name, OutcomeKind::ExpectedFailure, reason)
    }

    #[must_use]
    pub fn skip(op_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(op_name, OutcomeKind::Skip, reason)
    }

    fn new(op_name: impl Into<String>, outcome: OutcomeKind, reason: impl Into<String>) -> Self {
        Self {
            op_name: op_name.into(),
            variant: None,
            dtypes: None,
            outcome,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn with_dtypes(mut self, dtypes: impl IntoIterator<Item = DType>) -> Self {
        self.dtypes = Some(dtypes.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    #[must_use]
    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn matches(&self, op_name: &str, variant: Option<&str>, dtype: DType) -> bool {
        if self.op_name != op_name {
            return false;
        }
        if let Some(rule_variant) = self.variant.as_deref()
            && variant != Some(rule_variant)
        {
            return false;
        }
        self.dtypes
            .as_ref()
            .is_none_or(|dtypes| dtypes.contains(&dtype))
    }
}

/// Fine-grained rule: matched per sample, at execution time, through its
/// matcher closure. The matcher is declared optional only so construction
/// can reject a rule that was registered without one.
#[derive(Clone)]
pub struct SampleRule {
    op_name: String,
    matcher: Option<SampleMatcher>,
    outcome: OutcomeKind,
    reason: String,
}

impl SampleRule {
    #[must_use]
    pub fn xfail<F>(op_name: impl Into<String>, matcher: F, reason: impl Into<String>) -> Self
    where
        F: Fn(&Sample) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(
            op_name,
            Some(Arc::new(matcher)),
            OutcomeKind::ExpectedFailure,
            reason,
        )
    }

    #[must_use]
    pub fn skip<F>(op_name: impl Into<String>, matcher: F, reason: impl Into<String>) -> Self
    where
        F: Fn(&Sample) -> bool + Send + Sync + 'static,
    {
        Self::from_parts(op_name, Some(Arc::new(matcher)), OutcomeKind::Skip, reason)
    }

    #[must_use]
    pub fn from_parts(
        op_name: impl Into<String>,
        matcher: Option<SampleMatcher>,
        outcome: OutcomeKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            op_name: op_name.into(),
            matcher,
            outcome,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn op_name(&self) -> &str {
        &self.op_name
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Debug for SampleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleRule")
            .field("op_name", &self.op_name)
            .field("has_matcher", &self.matcher.is_some())
            .field("outcome", &self.outcome)
            .field("reason", &self.reason)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExemptionError {
    EmptyReason { op_name: String },
    MissingMatcher { op_name: String },
}

impl fmt::Display for ExemptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyReason { op_name } => {
                write!(f, "exemption rule for '{op_name}' has an empty reason")
            }
            Self::MissingMatcher { op_name } => {
                write!(
                    f,
                    "per-sample exemption rule for '{op_name}' has no matcher"
                )
            }
        }
    }
}

impl std::error::Error for ExemptionError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exemption<'a> {
    pub outcome: OutcomeKind,
    pub reason: &'a str,
}

/// Ordered, immutable table of known-bad cases. Lookups are linear
/// first-match scans: the rule lists are short and registration order is
/// the documented tie-break for overlapping rules.
#[derive(Debug)]
pub struct ExemptionRegistry {
    case_rules: Vec<CaseRule>,
    sample_rules: Vec<SampleRule>,
    sample_rule_ops: BTreeSet<String>,
}

impl ExemptionRegistry {
    pub fn new(
        case_rules: Vec<CaseRule>,
        sample_rules: Vec<SampleRule>,
    ) -> Result<Self, ExemptionError> {
        for rule in &case_rules {
            if rule.reason.trim().is_empty() {
                return Err(ExemptionError::EmptyReason {
                    op_name: rule.op_name.clone(),
                });
            }
        }
        for rule in &sample_rules {
            if rule.reason.trim().is_empty() {
                return Err(ExemptionError::EmptyReason {
                    op_name: rule.op_name.clone(),
                });
            }
            if rule.matcher.is_none() {
                return Err(ExemptionError::MissingMatcher {
                    op_name: rule.op_name.clone(),
                });
            }
        }

        let sample_rule_ops = sample_rules
            .iter()
            .map(|rule| rule.op_name.clone())
            .collect();
        Ok(Self {
            case_rules,
            sample_rules,
            sample_rule_ops,
        })
    }

    #[must_use]
    pub fn case_rule_count(&self) -> usize {
        self.case_rules.len()
    }

    #[must_use]
    pub fn sample_rule_count(&self) -> usize {
        self.sample_rules.len()
    }

    #[must_use]
    pub fn resolve_case(
        &self,
        op_name: &str,
        variant: Option<&str>,
        dtype: DType,
    ) -> Option<Exemption<'_>> {
        self.case_rules
            .iter()
            .find(|rule| rule.matches(op_name, variant, dtype))
            .map(|rule| Exemption {
                outcome: rule.outcome,
                reason: rule.reason.as_str(),
            })
    }

    #[must_use]
    pub fn resolve_sample(&self, op_name: &str, sample: &Sample) -> Option<Exemption<'_>> {
        if !self.sample_rule_ops.contains(op_name) {
            return None;
        }
        for rule in &self.sample_rules {
            if rule.op_name != op_name {
                continue;
            }
            // Matcher presence is enforced by construction.
            if let Some(matcher) = &rule.matcher
                && matcher(sample)
            {
                return Some(Exemption {
                    outcome: rule.outcome,
                    reason: rule.reason.as_str(),
                });
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseStatus {
    Passed,
    Skipped { reason: String },
    ExpectedFailure { reason: String, error: String },
    UnexpectedPass { reason: String },
    Failed { error: String },
}

impl CaseStatus {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Skipped { .. } => "skipped",
            Self::ExpectedFailure { .. } => "expected_failure",
            Self::UnexpectedPass { .. } => "unexpected_pass",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Passed | Self::Failed { .. } => None,
            Self::Skipped { reason }
            | Self::ExpectedFailure { reason, .. }
            | Self::UnexpectedPass { reason } => Some(reason),
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::ExpectedFailure { error, .. } | Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    /// An unexpected pass blocks only under strict policy; an unmatched
    /// failure always blocks.
    #[must_use]
    pub fn is_blocking(&self, mode: ExecutionMode) -> bool {
        match self {
            Self::Failed { .. } => true,
            Self::UnexpectedPass { .. } => mode == ExecutionMode::Strict,
            Self::Passed | Self::Skipped { .. } | Self::ExpectedFailure { .. } => false,
        }
    }
}

pub fn run_guarded<F, E>(exemption: Option<&Exemption<'_>>, block: F) -> CaseStatus
where
    F: FnOnce() -> Result<(), E>,
    E: fmt::Display,
{
    match exemption {
        None => match block() {
            Ok(()) => CaseStatus::Passed,
            Err(error) => CaseStatus::Failed {
                error: error.to_string(),
            },
        },
        Some(Exemption {
            outcome: OutcomeKind::Skip,
            reason,
        }) => CaseStatus::Skipped {
            reason: (*reason).to_string(),
        },
        Some(Exemption {
            outcome: OutcomeKind::ExpectedFailure,
            reason,
        }) => match block() {
            Ok(()) => CaseStatus::UnexpectedPass {
                reason: (*reason).to_string(),
            },
            Err(error) => CaseStatus::ExpectedFailure {
                reason: (*reason).to_string(),
                error: error.to_string(),
            },
        },
    }
}
