#![forbid(unsafe_code)]

//! Level-tagged values and the reverse-mode and batching machinery behind them.
//!
//! A [`Value`] is either a concrete [`Tensor`](fv_core::Tensor) or a tracer
//! that wraps a lower-level value: a [`GradTracer`] recorded on a per-level
//! [`Tape`], or a [`BatchTracer`] carrying a batch dimension. Primitives
//! dispatch on the highest level among their operands, so nested transforms
//! peel one wrapper per level.

pub mod batching;
pub mod grad;
pub mod tape;
pub mod value;

use fv_core::{Level, ValueError};
use fv_lax::{EvalError, Primitive, eval_primitive};

pub use batching::{add_batch_dim, broadcast_batch, unpack_batched};
pub use grad::{attach_custom_vjp, unwrap_for_grad};
pub use tape::{Tape, VarId, VjpFn};
pub use value::{BatchTracer, GradTracer, Value};

#[derive(Debug)]
pub enum TraceError {
    Eval(EvalError),
    Value(ValueError),
    /// A wrapper must sit at a strictly higher level than what it wraps.
    LevelOrder {
        wrapper: Level,
        inner: Level,
    },
    BatchDimOutOfRange {
        batch_dim: usize,
        rank: usize,
    },
    BatchSizeMismatch {
        expected: usize,
        actual: usize,
    },
    AxisOutOfRange {
        axis: usize,
        rank: usize,
    },
    CotangentArity {
        expected: usize,
        actual: usize,
    },
    /// Failure raised by a user-supplied backward rule while the tape ran.
    CustomRule(Box<dyn std::error::Error>),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eval(err) => write!(f, "primitive eval failed: {err}"),
            Self::Value(err) => write!(f, "invalid value: {err}"),
            Self::LevelOrder { wrapper, inner } => write!(
                f,
                "cannot wrap a value at {} inside a wrapper at {}",
                inner, wrapper
            ),
            Self::BatchDimOutOfRange { batch_dim, rank } => write!(
                f,
                "batch dimension {} out of range for rank {}",
                batch_dim, rank
            ),
            Self::BatchSizeMismatch { expected, actual } => write!(
                f,
                "batch size mismatch: expected {}, got {}",
                expected, actual
            ),
            Self::AxisOutOfRange { axis, rank } => {
                write!(f, "axis {} out of range for rank {}", axis, rank)
            }
            Self::CotangentArity { expected, actual } => write!(
                f,
                "vjp produced {} cotangents, expected {}",
                actual, expected
            ),
            Self::CustomRule(err) => write!(f, "custom backward rule failed: {err}"),
        }
    }
}

impl std::error::Error for TraceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Eval(err) => Some(err),
            Self::Value(err) => Some(err),
            Self::CustomRule(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<EvalError> for TraceError {
    fn from(value: EvalError) -> Self {
        Self::Eval(value)
    }
}

impl From<ValueError> for TraceError {
    fn from(value: ValueError) -> Self {
        Self::Value(value)
    }
}

/// Apply `primitive` to `inputs`, routing to the rule of the highest-level
/// tracer among them, or to the tensor kernels when all inputs are concrete.
pub fn apply_primitive(primitive: &Primitive, inputs: &[Value]) -> Result<Value, TraceError> {
    let mut top: Option<&Value> = None;
    for value in inputs {
        if value.level() > top.and_then(Value::level) {
            top = Some(value);
        }
    }

    match top {
        Some(Value::Grad(tracer)) => {
            grad::apply_grad_rule(primitive, inputs, tracer.level(), tracer.tape())
        }
        Some(Value::Batched(tracer)) => {
            batching::apply_batch_rule(primitive, inputs, tracer.level())
        }
        Some(Value::Tensor(_)) | None => {
            let tensors = inputs
                .iter()
                .filter_map(Value::as_tensor)
                .cloned()
                .collect::<Vec<_>>();
            Ok(Value::Tensor(eval_primitive(primitive, &tensors)?))
        }
    }
}
