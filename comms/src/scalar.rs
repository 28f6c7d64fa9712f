use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Div, Mul, Sub, SubAssign},
};

/// The floating point widths a model can be trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    F32,
    F64,
}

impl ScalarKind {
    /// The size in bytes of a single element.
    pub fn size(self) -> usize {
        match self {
            ScalarKind::F32 => size_of::<f32>(),
            ScalarKind::F64 => size_of::<f64>(),
        }
    }

    /// Wire tag for this kind, stable across versions.
    pub fn tag(self) -> u8 {
        match self {
            ScalarKind::F32 => 1,
            ScalarKind::F64 => 2,
        }
    }

    /// Inverse of `tag`.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ScalarKind::F32),
            2 => Some(ScalarKind::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarKind::F32 => f.write_str("f32"),
            ScalarKind::F64 => f.write_str("f64"),
        }
    }
}

// Trait to generalize over the primitive float types a model can be trained with.
//
// Every numeric buffer in the system (parameters, gradients, scores and losses)
// is expressed in terms of this trait, so a single code path serves both widths.
pub trait Scalar:
    bytemuck::Pod
    + Default
    + PartialOrd
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + AddAssign
    + SubAssign
    + Sum
{
    const KIND: ScalarKind;

    fn from_f64(value: f64) -> Self;

    fn to_f64(self) -> f64;

    fn from_usize(value: usize) -> Self {
        Self::from_f64(value as f64)
    }
}

impl Scalar for f32 {
    const KIND: ScalarKind = ScalarKind::F32;

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Scalar for f64 {
    const KIND: ScalarKind = ScalarKind::F64;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }
}
