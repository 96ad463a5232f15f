#![forbid(unsafe_code)]

#[cfg(test)]
pub mod proptest_strategies;
pub mod tree;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub use tree::{Tree, TreeError, TreeSpec};

/// Functional transform a layer of the interpreter stack stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    /// Ordinary evaluation, also what an empty stack means.
    Plain,
    /// vmap.
    Batched,
    /// Reverse-mode grad.
    Differentiated,
}

impl TransformKind {
    pub const COUNT: usize = 3;
    pub const ALL: [Self; Self::COUNT] = [Self::Plain, Self::Batched, Self::Differentiated];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Plain => 0,
            Self::Batched => 1,
            Self::Differentiated => 2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Batched => "vmap",
            Self::Differentiated => "grad",
        }
    }
}

impl std::fmt::Display for TransformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nesting level of a transform. Level 0 is the root evaluation; every pushed
/// layer receives a fresh, strictly larger level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Level(pub u32);

impl Level {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

pub type Dims = SmallVec<[usize; 4]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Dims,
}

impl Shape {
    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Dims::new() }
    }

    #[must_use]
    pub fn vector(len: usize) -> Self {
        Self {
            dims: smallvec::smallvec![len],
        }
    }

    #[must_use]
    pub fn from_dims(dims: &[usize]) -> Self {
        Self {
            dims: Dims::from_slice(dims),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    #[must_use]
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1_usize, |acc, dim| acc.checked_mul(*dim))
    }

    /// Row-major strides.
    #[must_use]
    pub fn strides(&self) -> Dims {
        let rank = self.rank();
        let mut strides: Dims = smallvec::smallvec![1; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Shape with `axis` removed.
    #[must_use]
    pub fn without_axis(&self, axis: usize) -> Self {
        let dims = self
            .dims
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != axis)
            .map(|(_, dim)| *dim)
            .collect();
        Self { dims }
    }

    /// Shape with a new axis of size `size` inserted at `axis`.
    #[must_use]
    pub fn with_axis(&self, axis: usize, size: usize) -> Self {
        let mut dims = self.dims.clone();
        dims.insert(axis.min(dims.len()), size);
        Self { dims }
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

/// Dense row-major f64 tensor. Rank 0 holds exactly one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Shape,
    data: Vec<f64>,
}

impl Tensor {
    pub fn new(shape: Shape, data: Vec<f64>) -> Result<Self, ValueError> {
        let expected_count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        if expected_count != data.len() {
            return Err(ValueError::ElementCountMismatch {
                shape,
                expected_count,
                actual_count: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    #[must_use]
    pub fn vector(values: &[f64]) -> Self {
        Self {
            shape: Shape::vector(values.len()),
            data: values.to_vec(),
        }
    }

    pub fn full(shape: Shape, value: f64) -> Result<Self, ValueError> {
        let count = shape.element_count().ok_or(ValueError::ShapeOverflow {
            shape: shape.clone(),
        })?;
        Ok(Self {
            shape,
            data: vec![value; count],
        })
    }

    pub fn zeros(shape: Shape) -> Result<Self, ValueError> {
        Self::full(shape, 0.0)
    }

    pub fn ones(shape: Shape) -> Result<Self, ValueError> {
        Self::full(shape, 1.0)
    }

    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        if self.shape.is_scalar() {
            self.data.first().copied()
        } else {
            None
        }
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().copied().map(f).collect(),
        }
    }

    /// Same elements under a new shape with an equal element count.
    pub fn with_shape(&self, shape: Shape) -> Result<Self, ValueError> {
        Self::new(shape, self.data.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    ShapeOverflow {
        shape: Shape,
    },
    ElementCountMismatch {
        shape: Shape,
        expected_count: usize,
        actual_count: usize,
    },
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeOverflow { shape } => {
                write!(f, "shape element count overflowed: {shape}")
            }
            Self::ElementCountMismatch {
                shape,
                expected_count,
                actual_count,
            } => write!(
                f,
                "tensor element count mismatch for shape {}: expected {}, got {}",
                shape, expected_count, actual_count
            ),
        }
    }
}

impl std::error::Error for ValueError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_indices_cover_table() {
        let mut seen = [false; TransformKind::COUNT];
        for kind in TransformKind::ALL {
            seen[kind.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let encoded = serde_json::to_string(&TransformKind::Differentiated).expect("serialize");
        assert_eq!(encoded, "\"differentiated\"");
        assert_eq!(TransformKind::Batched.to_string(), "vmap");
    }

    #[test]
    fn tensor_rejects_wrong_element_count() {
        let err = Tensor::new(Shape::from_dims(&[2, 2]), vec![1.0; 3]).expect_err("should fail");
        assert_eq!(
            err,
            ValueError::ElementCountMismatch {
                shape: Shape::from_dims(&[2, 2]),
                expected_count: 4,
                actual_count: 3,
            }
        );
    }

    #[test]
    fn strides_are_row_major() {
        let shape = Shape::from_dims(&[2, 3, 4]);
        assert_eq!(shape.strides().as_slice(), &[12, 4, 1]);
        assert!(Shape::scalar().strides().is_empty());
    }

    #[test]
    fn axis_insert_and_remove_are_inverse() {
        let shape = Shape::from_dims(&[3, 5]);
        let widened = shape.with_axis(1, 7);
        assert_eq!(widened.dims.as_slice(), &[3, 7, 5]);
        assert_eq!(widened.without_axis(1), shape);
    }

    #[test]
    fn scalar_accessor_only_for_rank_zero() {
        assert_eq!(Tensor::scalar(0.5).as_scalar(), Some(0.5));
        assert_eq!(Tensor::vector(&[0.5]).as_scalar(), None);
    }

    mod prop {
        use crate::proptest_strategies::arb_tensor;
        use crate::{Shape, Tensor};
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_with_shape_flat_round_trip(tensor in arb_tensor()) {
                let flat = tensor
                    .with_shape(Shape::vector(tensor.data().len()))
                    .expect("flat view");
                let restored = flat.with_shape(tensor.shape().clone()).expect("restore");
                prop_assert_eq!(restored, tensor);
            }
        }
    }
}
