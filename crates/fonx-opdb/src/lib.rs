#![forbid(unsafe_code)]

use std::fmt;

use fonx_core::{ArgValue, DType, FLOAT_TYPES, Sample, TensorValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    UnsupportedDType {
        op: &'static str,
        dtype: DType,
    },
    MissingArg {
        op: &'static str,
        what: &'static str,
    },
    BadArg {
        op: &'static str,
        what: &'static str,
    },
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    EmptyReduction {
        op: &'static str,
    },
    OutOfBounds {
        op: &'static str,
        index: usize,
        len: usize,
    },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedDType { op, dtype } => {
                write!(f, "eager kernel for '{op}' does not support dtype {dtype}")
            }
            Self::MissingArg { op, what } => {
                write!(f, "'{op}' sample is missing required argument: {what}")
            }
            Self::BadArg { op, what } => {
                write!(f, "'{op}' sample has a malformed argument: {what}")
            }
            Self::ShapeMismatch { op, lhs, rhs } => {
                write!(f, "'{op}' operand shapes differ: lhs={lhs:?}, rhs={rhs:?}")
            }
            Self::EmptyReduction { op } => {
                write!(f, "'{op}' cannot reduce an empty tensor")
            }
            Self::OutOfBounds { op, index, len } => {
                write!(
                    f,
                    "'{op}' strided access out of bounds: index={index}, len={len}"
                )
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// One entry of the operator metadata database: the eager kernel, the dtype
/// coverage, and a deterministic sample generator. Generators are
/// restartable: every call yields the same finite sequence.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    name: &'static str,
    variant: Option<&'static str>,
    dtypes: &'static [DType],
    kernel: fn(&Sample) -> Result<TensorValue, EvalError>,
    samples: fn(DType) -> Vec<Sample>,
}

impl OpInfo {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn variant(&self) -> Option<&'static str> {
        self.variant
    }

    #[must_use]
    pub fn qualified_name(&self) -> String {
        match self.variant {
            Some(variant) => format!("{}.{variant}", self.name),
            None => self.name.to_string(),
        }
    }

    #[must_use]
    pub fn dtypes(&self) -> &'static [DType] {
        self.dtypes
    }

    #[must_use]
    pub fn supports(&self, dtype: DType) -> bool {
        self.dtypes.contains(&dtype)
    }

    #[must_use]
    pub fn sample_inputs(&self, dtype: DType) -> Vec<Sample> {
        (self.samples)(dtype)
    }

    pub fn eval(&self, sample: &Sample) -> Result<TensorValue, EvalError> {
        (self.kernel)(sample)
    }
}

static FLOATS_INTS: [DType; 8] = [
    DType::F64,
    DType::F32,
    DType::F16,
    DType::I64,
    DType::I32,
    DType::I16,
    DType::I8,
    DType::U8,
];

static FLOATS_INTS_BOOL: [DType; 9] = [
    DType::F64,
    DType::F32,
    DType::F16,
    DType::I64,
    DType::I32,
    DType::I16,
    DType::I8,
    DType::U8,
    DType::Bool,
];

/// Operators under consistency test, sorted by qualified name.
#[must_use]
pub fn op_db() -> Vec<OpInfo> {
    vec![
        OpInfo {
            name: "abs",
            variant: None,
            dtypes: &FLOATS_INTS,
            kernel: kernel_abs,
            samples: signed_unary_samples,
        },
        OpInfo {
            name: "acos",
            variant: None,
            dtypes: &FLOATS_INTS_BOOL,
            kernel: kernel_acos,
            samples: unit_unary_samples,
        },
        OpInfo {
            name: "acosh",
            variant: None,
            dtypes: &FLOATS_INTS_BOOL,
            kernel: kernel_acosh,
            samples: ge_one_unary_samples,
        },
        OpInfo {
            name: "add",
            variant: None,
            dtypes: &FLOATS_INTS_BOOL,
            kernel: kernel_add,
            samples: binary_samples,
        },
        OpInfo {
            name: "amax",
            variant: None,
            dtypes: &FLOATS_INTS,
            kernel: kernel_amax,
            samples: reduce_samples,
        },
        OpInfo {
            name: "amin",
            variant: None,
            dtypes: &FLOATS_INTS,
            kernel: kernel_amin,
            samples: reduce_samples,
        },
        OpInfo {
            name: "as_strided",
            variant: Some("partial_views"),
            dtypes: &FLOAT_TYPES,
            kernel: kernel_as_strided,
            samples: strided_samples,
        },
        OpInfo {
            name: "asin",
            variant: None,
            dtypes: &FLOATS_INTS_BOOL,
            kernel: kernel_asin,
            samples: unit_unary_samples,
        },
        OpInfo {
            name: "atan",
            variant: None,
            dtypes: &FLOATS_INTS_BOOL,
            kernel: kernel_atan,
            samples: signed_unary_samples,
        },
        OpInfo {
            name: "ceil",
            variant: None,
            dtypes: &FLOATS_INTS_BOOL,
            kernel: kernel_ceil,
            samples: signed_unary_samples,
        },
        OpInfo {
            name: "clamp",
            variant: None,
            dtypes: &FLOATS_INTS,
            kernel: kernel_clamp,
            samples: clamp_samples,
        },
        OpInfo {
            name: "mul",
            variant: None,
            dtypes: &FLOATS_INTS,
            kernel: kernel_mul,
            samples: binary_samples,
        },
        OpInfo {
            name: "sub",
            variant: None,
            dtypes: &FLOATS_INTS,
            kernel: kernel_sub,
            samples: binary_samples,
        },
    ]
}

#[must_use]
pub fn find_op<'a>(db: &'a [OpInfo], qualified_name: &str) -> Option<&'a OpInfo> {
    db.iter().find(|op| op.qualified_name() == qualified_name)
}

// Value coercion keeps generated data and kernel outputs representable in
// the sample's dtype: ints are rounded, u8 clamped, bools collapsed to 0/1.
fn coerce(dtype: DType, value: f64) -> f64 {
    if dtype.is_bool() {
        return if value != 0.0 { 1.0 } else { 0.0 };
    }
    if dtype.is_int() {
        let rounded = value.round();
        if dtype == DType::U8 {
            return rounded.clamp(0.0, 255.0);
        }
        return rounded;
    }
    value
}

fn unary_out_dtype(input: DType) -> DType {
    // Trig on integral inputs promotes to f32, matching eager semantics.
    if input.is_float() { input } else { DType::F32 }
}

fn map_unary<F>(
    sample: &Sample,
    out_dtype: DType,
    f: F,
) -> Result<TensorValue, EvalError>
where
    F: Fn(f64) -> f64,
{
    let input = sample.input();
    let data: Vec<f64> = input
        .data()
        .iter()
        .map(|value| coerce(out_dtype, f(*value)))
        .collect();
    TensorValue::from_data(input.shape().to_vec(), out_dtype, data)
        .map_err(|_| EvalError::BadArg {
            op: "unary",
            what: "input buffer",
        })
}

fn binary_rhs<'a>(op: &'static str, sample: &'a Sample) -> Result<&'a TensorValue, EvalError> {
    sample
        .args()
        .first()
        .and_then(ArgValue::as_tensor)
        .ok_or(EvalError::MissingArg { op, what: "rhs tensor" })
}

fn map_binary<F>(
    op: &'static str,
    sample: &Sample,
    f: F,
) -> Result<TensorValue, EvalError>
where
    F: Fn(f64, f64) -> f64,
{
    let lhs = sample.input();
    let rhs = binary_rhs(op, sample)?;
    if lhs.shape() != rhs.shape() {
        return Err(EvalError::ShapeMismatch {
            op,
            lhs: lhs.shape().to_vec(),
            rhs: rhs.shape().to_vec(),
        });
    }
    let dtype = lhs.dtype();
    let data: Vec<f64> = lhs
        .data()
        .iter()
        .zip(rhs.data().iter())
        .map(|(a, b)| coerce(dtype, f(*a, *b)))
        .collect();
    TensorValue::from_data(lhs.shape().to_vec(), dtype, data)
        .map_err(|_| EvalError::BadArg { op, what: "operand buffers" })
}

fn reduce_all<F>(op: &'static str, sample: &Sample, f: F) -> Result<TensorValue, EvalError>
where
    F: Fn(f64, f64) -> f64,
{
    let input = sample.input();
    let mut values = input.data().iter().copied();
    let first = values.next().ok_or(EvalError::EmptyReduction { op })?;
    let reduced = values.fold(first, f);
    Ok(TensorValue::scalar(reduced, input.dtype()))
}

fn kernel_abs(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_unary(sample, sample.input().dtype(), f64::abs)
}

fn kernel_acos(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_unary(sample, unary_out_dtype(sample.input().dtype()), f64::acos)
}

fn kernel_acosh(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_unary(sample, unary_out_dtype(sample.input().dtype()), f64::acosh)
}

fn kernel_asin(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_unary(sample, unary_out_dtype(sample.input().dtype()), f64::asin)
}

fn kernel_atan(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_unary(sample, unary_out_dtype(sample.input().dtype()), f64::atan)
}

fn kernel_ceil(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_unary(sample, sample.input().dtype(), f64::ceil)
}

fn kernel_add(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_binary("add", sample, |a, b| a + b)
}

fn kernel_sub(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_binary("sub", sample, |a, b| a - b)
}

fn kernel_mul(sample: &Sample) -> Result<TensorValue, EvalError> {
    map_binary("mul", sample, |a, b| a * b)
}

fn kernel_amax(sample: &Sample) -> Result<TensorValue, EvalError> {
    reduce_all("amax", sample, f64::max)
}

fn kernel_amin(sample: &Sample) -> Result<TensorValue, EvalError> {
    reduce_all("amin", sample, f64::min)
}

fn kernel_clamp(sample: &Sample) -> Result<TensorValue, EvalError> {
    let min = sample.kwarg("min").and_then(ArgValue::as_float);
    let max = sample.kwarg("max").and_then(ArgValue::as_float);
    if min.is_none() && max.is_none() {
        return Err(EvalError::MissingArg {
            op: "clamp",
            what: "min or max",
        });
    }
    map_unary(sample, sample.input().dtype(), |value| {
        let low = min.map_or(value, |bound| value.max(bound));
        max.map_or(low, |bound| low.min(bound))
    })
}

fn kernel_as_strided(sample: &Sample) -> Result<TensorValue, EvalError> {
    const OP: &str = "as_strided";
    let input = sample.input();
    let sizes = sample
        .args()
        .first()
        .and_then(ArgValue::as_int_list)
        .ok_or(EvalError::MissingArg { op: OP, what: "sizes" })?;
    let strides = sample
        .args()
        .get(1)
        .and_then(ArgValue::as_int_list)
        .ok_or(EvalError::MissingArg { op: OP, what: "strides" })?;
    if sizes.len() != strides.len() || sizes.iter().any(|size| *size < 0) {
        return Err(EvalError::BadArg { op: OP, what: "sizes/strides" });
    }

    let out_shape: Vec<usize> = sizes.iter().map(|size| *size as usize).collect();
    let numel: usize = out_shape.iter().product();
    let mut data = Vec::with_capacity(numel);
    for flat in 0..numel {
        let mut remaining = flat;
        let mut offset: i64 = 0;
        for (&size, &stride) in out_shape.iter().zip(strides.iter()).rev() {
            let coord = if size == 0 { 0 } else { remaining % size };
            remaining /= size.max(1);
            offset += coord as i64 * stride;
        }
        let index = usize::try_from(offset).map_err(|_| EvalError::BadArg {
            op: OP,
            what: "negative element offset",
        })?;
        let value = *input
            .data()
            .get(index)
            .ok_or(EvalError::OutOfBounds {
                op: OP,
                index,
                len: input.data().len(),
            })?;
        data.push(value);
    }
    TensorValue::from_data(out_shape, input.dtype(), data)
        .map_err(|_| EvalError::BadArg { op: OP, what: "view shape" })
}

const SIGNED_PATTERN: [f64; 6] = [-1.5, -0.5, 0.25, 0.75, 1.0, -1.0];
const UNIT_PATTERN: [f64; 5] = [-1.0, -0.5, 0.0, 0.5, 1.0];
const GE_ONE_PATTERN: [f64; 4] = [1.0, 1.5, 2.0, 3.25];
const RHS_PATTERN: [f64; 6] = [0.5, 1.0, -0.25, 2.0, -1.0, 0.0];

fn coerced(dtype: DType, pattern: &[f64]) -> Vec<f64> {
    pattern.iter().map(|value| coerce(dtype, *value)).collect()
}

fn unary_samples(dtype: DType, pattern: &[f64]) -> Vec<Sample> {
    let values = coerced(dtype, pattern);
    vec![
        Sample::new(TensorValue::scalar(values[0], dtype)),
        Sample::new(TensorValue::from_pattern(vec![3], dtype, &values)),
        Sample::new(TensorValue::from_pattern(vec![2, 2], dtype, &values)),
    ]
}

fn signed_unary_samples(dtype: DType) -> Vec<Sample> {
    unary_samples(dtype, &SIGNED_PATTERN)
}

fn unit_unary_samples(dtype: DType) -> Vec<Sample> {
    unary_samples(dtype, &UNIT_PATTERN)
}

fn ge_one_unary_samples(dtype: DType) -> Vec<Sample> {
    unary_samples(dtype, &GE_ONE_PATTERN)
}

fn binary_samples(dtype: DType) -> Vec<Sample> {
    let lhs = coerced(dtype, &SIGNED_PATTERN);
    let rhs = coerced(dtype, &RHS_PATTERN);
    vec![
        Sample::new(TensorValue::from_pattern(vec![3], dtype, &lhs)).with_arg(ArgValue::Tensor(
            TensorValue::from_pattern(vec![3], dtype, &rhs),
        )),
        Sample::new(TensorValue::from_pattern(vec![2, 2], dtype, &lhs)).with_arg(
            ArgValue::Tensor(TensorValue::from_pattern(vec![2, 2], dtype, &rhs)),
        ),
        // Zero-size operands exercise the empty-tensor path end to end.
        Sample::new(TensorValue::from_pattern(vec![0, 3], dtype, &lhs)).with_arg(
            ArgValue::Tensor(TensorValue::from_pattern(vec![0, 3], dtype, &rhs)),
        ),
    ]
}

fn reduce_samples(dtype: DType) -> Vec<Sample> {
    let values = coerced(dtype, &SIGNED_PATTERN);
    vec![
        Sample::new(TensorValue::scalar(values[0], dtype)),
        Sample::new(TensorValue::from_pattern(vec![3], dtype, &values)),
        Sample::new(TensorValue::from_pattern(vec![2, 3], dtype, &values)),
    ]
}

fn clamp_samples(dtype: DType) -> Vec<Sample> {
    let values = coerced(dtype, &SIGNED_PATTERN);
    vec![
        Sample::new(TensorValue::from_pattern(vec![4], dtype, &values))
            .with_kwarg("min", ArgValue::Float(-0.5))
            .with_kwarg("max", ArgValue::Float(0.5)),
        Sample::new(TensorValue::from_pattern(vec![4], dtype, &values))
            .with_kwarg("min", ArgValue::Float(0.0)),
    ]
}

fn strided_samples(dtype: DType) -> Vec<Sample> {
    let base: Vec<f64> = (0..9).map(|i| coerce(dtype, f64::from(i))).collect();
    // Overlapping window: strides [1, 1] revisit base elements.
    vec![
        Sample::new(TensorValue::from_pattern(vec![9], dtype, &base))
            .with_arg(ArgValue::IntList(vec![2, 2]))
            .with_arg(ArgValue::IntList(vec![1, 1])),
    ]
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use fonx_core::{ArgValue, DType, Sample, TensorValue};
    use proptest::prelude::*;

    use super::{EvalError, find_op, op_db};

    fn db_op(qualified_name: &str) -> super::OpInfo {
        *find_op(&op_db(), qualified_name).expect("operator must be registered")
    }

    #[test]
    fn db_is_sorted_and_has_unique_qualified_names() {
        let db = op_db();
        let names: Vec<String> = db.iter().map(super::OpInfo::qualified_name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        let unique: BTreeSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    #[test]
    fn abs_kernel_preserves_dtype_and_flips_sign() {
        let op = db_op("abs");
        let sample = Sample::new(
            TensorValue::from_data(vec![3], DType::I32, vec![-2.0, 0.0, 3.0])
                .expect("sample tensor should build"),
        );
        let out = op.eval(&sample).expect("abs should evaluate");
        assert_eq!(out.dtype(), DType::I32);
        assert_eq!(out.data(), &[2.0, 0.0, 3.0]);
    }

    #[test]
    fn acos_promotes_integral_input_to_f32() {
        let op = db_op("acos");
        let sample = Sample::new(TensorValue::scalar(1.0, DType::I64));
        let out = op.eval(&sample).expect("acos should evaluate");
        assert_eq!(out.dtype(), DType::F32);
        assert!(out.data()[0].abs() < 1e-12);
    }

    #[test]
    fn add_requires_matching_shapes() {
        let op = db_op("add");
        let sample = Sample::new(TensorValue::filled(vec![2], DType::F32, 1.0)).with_arg(
            ArgValue::Tensor(TensorValue::filled(vec![3], DType::F32, 1.0)),
        );
        let err = op.eval(&sample).expect_err("shape mismatch must fail");
        assert!(matches!(err, EvalError::ShapeMismatch { op: "add", .. }));
    }

    #[test]
    fn add_on_bool_collapses_to_logical_or() {
        let op = db_op("add");
        let lhs = TensorValue::from_data(vec![3], DType::Bool, vec![1.0, 0.0, 1.0])
            .expect("lhs should build");
        let rhs = TensorValue::from_data(vec![3], DType::Bool, vec![1.0, 0.0, 0.0])
            .expect("rhs should build");
        let out = op
            .eval(&Sample::new(lhs).with_arg(ArgValue::Tensor(rhs)))
            .expect("bool add should evaluate");
        assert_eq!(out.data(), &[1.0, 0.0, 1.0]);
    }

    #[test]
    fn amax_reduces_to_scalar_and_rejects_empty() {
        let op = db_op("amax");
        let sample = Sample::new(
            TensorValue::from_data(vec![2, 2], DType::F64, vec![1.0, -4.0, 2.5, 0.0])
                .expect("sample tensor should build"),
        );
        let out = op.eval(&sample).expect("amax should evaluate");
        assert!(out.is_scalar());
        assert_eq!(out.data(), &[2.5]);

        let empty = Sample::new(TensorValue::from_pattern(vec![0], DType::F64, &[1.0]));
        let err = op.eval(&empty).expect_err("empty reduction must fail");
        assert_eq!(err, EvalError::EmptyReduction { op: "amax" });
    }

    #[test]
    fn clamp_without_bounds_is_rejected() {
        let op = db_op("clamp");
        let sample = Sample::new(TensorValue::filled(vec![2], DType::F32, 1.0));
        let err = op.eval(&sample).expect_err("missing bounds must fail");
        assert_eq!(
            err,
            EvalError::MissingArg {
                op: "clamp",
                what: "min or max"
            }
        );
    }

    #[test]
    fn clamp_applies_min_and_max_bounds() {
        let op = db_op("clamp");
        let samples = op.sample_inputs(DType::F64);
        let out = op.eval(&samples[0]).expect("clamp should evaluate");
        assert!(out.data().iter().all(|v| (-0.5..=0.5).contains(v)));
    }

    #[test]
    fn as_strided_produces_overlapping_view() {
        let op = db_op("as_strided.partial_views");
        let samples = op.sample_inputs(DType::F64);
        let out = op.eval(&samples[0]).expect("as_strided should evaluate");
        assert_eq!(out.shape(), &[2, 2]);
        // sizes [2,2] with strides [1,1] over 0..9 reads offsets 0,1,1,2.
        assert_eq!(out.data(), &[0.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn sample_generators_are_restartable() {
        for op in op_db() {
            for dtype in op.dtypes() {
                let first = op.sample_inputs(*dtype);
                let second = op.sample_inputs(*dtype);
                assert!(!first.is_empty(), "{} has no samples", op.qualified_name());
                assert_eq!(first, second, "{} is not restartable", op.qualified_name());
            }
        }
    }

    #[test]
    fn unit_interval_samples_stay_in_trig_domain() {
        let op = db_op("acos");
        for dtype in [DType::F64, DType::F32] {
            for sample in op.sample_inputs(dtype) {
                let out = op.eval(&sample).expect("acos should evaluate");
                assert!(
                    out.data().iter().all(|v| v.is_finite()),
                    "acos produced non-finite output for in-domain input"
                );
            }
        }
    }

    proptest! {
        #[test]
        fn prop_int_samples_hold_integral_values(
            dtype in prop::sample::select(vec![DType::I64, DType::I32, DType::I16, DType::I8, DType::U8]),
        ) {
            let op = db_op("abs");
            for sample in op.sample_inputs(dtype) {
                for value in sample.input().data() {
                    prop_assert_eq!(*value, value.round());
                }
            }
        }

        #[test]
        fn prop_bool_samples_hold_zero_or_one(_seed in 0u8..4) {
            let op = db_op("add");
            for sample in op.sample_inputs(DType::Bool) {
                for value in sample.input().data() {
                    prop_assert!(*value == 0.0 || *value == 1.0);
                }
            }
        }
    }
}
