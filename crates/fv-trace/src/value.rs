#![forbid(unsafe_code)]

use std::rc::Rc;

use fv_core::{Dims, Level, Shape, Tensor};
use fv_lax::{Primitive, movedim_permutation};

use crate::tape::{Tape, VarId};
use crate::{TraceError, apply_primitive};

/// A value flowing through transformed code. Cloning is cheap: tracers are
/// reference counted and concrete tensors are copied only at the leaves.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Grad(Rc<GradTracer>),
    Batched(Rc<BatchTracer>),
}

/// A value tracked for reverse-mode differentiation at `level`.
#[derive(Debug)]
pub struct GradTracer {
    pub(crate) level: Level,
    pub(crate) primal: Value,
    pub(crate) var: VarId,
    pub(crate) tape: Tape,
}

impl GradTracer {
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub fn primal(&self) -> &Value {
        &self.primal
    }

    #[must_use]
    pub fn var(&self) -> VarId {
        self.var
    }

    #[must_use]
    pub fn tape(&self) -> &Tape {
        &self.tape
    }
}

/// A value carrying an implicit vmap axis at `level`: axis `batch_dim` of
/// `value` is the batch.
#[derive(Debug)]
pub struct BatchTracer {
    pub(crate) level: Level,
    pub(crate) value: Value,
    pub(crate) batch_dim: usize,
}

impl BatchTracer {
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    #[must_use]
    pub fn batch_dim(&self) -> usize {
        self.batch_dim
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.value.shape().dims[self.batch_dim]
    }
}

impl From<Tensor> for Value {
    fn from(value: Tensor) -> Self {
        Self::Tensor(value)
    }
}

impl Value {
    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self::Tensor(Tensor::scalar(value))
    }

    #[must_use]
    pub fn vector(values: &[f64]) -> Self {
        Self::Tensor(Tensor::vector(values))
    }

    /// Level of the outermost wrapper, `None` for a concrete tensor.
    #[must_use]
    pub fn level(&self) -> Option<Level> {
        match self {
            Self::Tensor(_) => None,
            Self::Grad(tracer) => Some(tracer.level),
            Self::Batched(tracer) => Some(tracer.level),
        }
    }

    /// Shape as seen by code running at this value's level (batch axes of
    /// enclosing vmaps are hidden).
    #[must_use]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Tensor(tensor) => tensor.shape().clone(),
            Self::Grad(tracer) => tracer.primal.shape(),
            Self::Batched(tracer) => tracer.value.shape().without_axis(tracer.batch_dim),
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape().rank()
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Grad(_) | Self::Batched(_) => None,
        }
    }

    #[must_use]
    pub fn as_f64_scalar(&self) -> Option<f64> {
        self.as_tensor().and_then(Tensor::as_scalar)
    }

    #[must_use]
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        self.as_tensor().map(|tensor| tensor.data().to_vec())
    }

    pub fn zeros_like(&self) -> Result<Self, TraceError> {
        Ok(Self::Tensor(Tensor::zeros(self.shape())?))
    }

    pub fn ones_like(&self) -> Result<Self, TraceError> {
        Ok(Self::Tensor(Tensor::ones(self.shape())?))
    }

    pub fn neg(&self) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::Neg, std::slice::from_ref(self))
    }

    pub fn sin(&self) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::Sin, std::slice::from_ref(self))
    }

    pub fn cos(&self) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::Cos, std::slice::from_ref(self))
    }

    pub fn add(&self, other: &Self) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::Add, &[self.clone(), other.clone()])
    }

    pub fn sub(&self, other: &Self) -> Result<Self, TraceError> {
        self.add(&other.neg()?)
    }

    pub fn mul(&self, other: &Self) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::Mul, &[self.clone(), other.clone()])
    }

    pub fn scale(&self, factor: f64) -> Result<Self, TraceError> {
        self.mul(&Self::scalar(factor))
    }

    pub fn reduce_sum(&self, axes: &[usize]) -> Result<Self, TraceError> {
        apply_primitive(
            &Primitive::ReduceSum {
                axes: Dims::from_slice(axes),
            },
            std::slice::from_ref(self),
        )
    }

    /// Sum of every element, as a scalar.
    pub fn sum(&self) -> Result<Self, TraceError> {
        let axes: Dims = (0..self.rank()).collect();
        self.reduce_sum(&axes)
    }

    pub fn broadcast_to(&self, shape: Shape) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::BroadcastTo { shape }, std::slice::from_ref(self))
    }

    pub fn reshape(&self, shape: Shape) -> Result<Self, TraceError> {
        apply_primitive(&Primitive::Reshape { shape }, std::slice::from_ref(self))
    }

    pub fn transpose(&self, permutation: &[usize]) -> Result<Self, TraceError> {
        apply_primitive(
            &Primitive::Transpose {
                permutation: Dims::from_slice(permutation),
            },
            std::slice::from_ref(self),
        )
    }

    /// Move axis `from` to position `to`.
    pub fn movedim(&self, from: usize, to: usize) -> Result<Self, TraceError> {
        let rank = self.rank();
        for axis in [from, to] {
            if axis >= rank {
                return Err(TraceError::AxisOutOfRange { axis, rank });
            }
        }
        if from == to {
            return Ok(self.clone());
        }
        self.transpose(&movedim_permutation(rank, from, to))
    }
}
