#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    F64,
    F32,
    F16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

pub const FLOAT_TYPES: [DType; 3] = [DType::F64, DType::F32, DType::F16];
pub const INT_TYPES: [DType; 5] = [DType::I64, DType::I32, DType::I16, DType::I8, DType::U8];
pub const BOOL_TYPES: [DType; 1] = [DType::Bool];

impl DType {
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F64 | Self::F32 | Self::F16)
    }

    #[must_use]
    pub fn is_int(self) -> bool {
        matches!(self, Self::I64 | Self::I32 | Self::I16 | Self::I8 | Self::U8)
    }

    #[must_use]
    pub fn is_bool(self) -> bool {
        matches!(self, Self::Bool)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::I64 => "i64",
            Self::I32 => "i32",
            Self::I16 => "i16",
            Self::I8 => "i8",
            Self::U8 => "u8",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    NumelMismatch {
        shape: Vec<usize>,
        numel: usize,
        data_len: usize,
    },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NumelMismatch {
                shape,
                numel,
                data_len,
            } => write!(
                f,
                "data length does not match shape: shape={shape:?}, numel={numel}, data_len={data_len}"
            ),
        }
    }
}

impl std::error::Error for TensorError {}

/// Dense row-major value carrier. Payload is always `f64`; the dtype tag
/// records the logical element type (bools are stored as 0/1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<f64>,
}

impl TensorValue {
    pub fn from_data(
        shape: Vec<usize>,
        dtype: DType,
        data: Vec<f64>,
    ) -> Result<Self, TensorError> {
        let numel = numel_of(&shape);
        if numel != data.len() {
            return Err(TensorError::NumelMismatch {
                shape,
                numel,
                data_len: data.len(),
            });
        }
        Ok(Self { shape, dtype, data })
    }

    #[must_use]
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self {
            shape: Vec::new(),
            dtype,
            data: vec![value],
        }
    }

    /// Builds a tensor by cycling `pattern` across the shape's elements.
    /// An empty pattern yields zeros.
    #[must_use]
    pub fn from_pattern(shape: Vec<usize>, dtype: DType, pattern: &[f64]) -> Self {
        let numel = numel_of(&shape);
        let data = if pattern.is_empty() {
            vec![0.0; numel]
        } else {
            (0..numel).map(|i| pattern[i % pattern.len()]).collect()
        };
        Self { shape, dtype, data }
    }

    #[must_use]
    pub fn filled(shape: Vec<usize>, dtype: DType, value: f64) -> Self {
        let numel = numel_of(&shape);
        Self {
            shape,
            dtype,
            data: vec![value; numel],
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        numel_of(&self.shape)
    }
}

#[must_use]
pub fn numel_of(shape: &[usize]) -> usize {
    if shape.is_empty() {
        return 1;
    }
    shape.iter().copied().product()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgValue {
    Tensor(TensorValue),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    IntList(Vec<i64>),
}

impl ArgValue {
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int_list(&self) -> Option<&[i64]> {
        match self {
            Self::IntList(values) => Some(values),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_str(&self) -> bool {
        matches!(self, Self::Str(_))
    }
}

/// One concrete operator invocation: the primary input plus the positional
/// and named extras a sample generator attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    input: TensorValue,
    args: Vec<ArgValue>,
    kwargs: BTreeMap<String, ArgValue>,
}

impl Sample {
    #[must_use]
    pub fn new(input: TensorValue) -> Self {
        Self {
            input,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_arg(mut self, arg: ArgValue) -> Self {
        self.args.push(arg);
        self
    }

    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn input(&self) -> &TensorValue {
        &self.input
    }

    #[must_use]
    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    #[must_use]
    pub fn kwargs(&self) -> &BTreeMap<String, ArgValue> {
        &self.kwargs
    }

    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&ArgValue> {
        self.kwargs.get(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Strict,
    Hardened,
}
