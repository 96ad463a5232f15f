#![forbid(unsafe_code)]

//! Transform-aware dispatch of operators that carry a user-defined vjp.
//!
//! [`CUSTOM_VJP`] looks at the top of the interpreter stack and runs the rule
//! registered for that transform. Each rule peels exactly one layer, re-enters
//! the operator one level down, and repackages what comes back.

pub mod boundary;
pub mod call;
pub mod operator;
pub mod rules;

use fv_core::{Level, TransformKind, Tree, TreeError};
use fv_interpreters::{Interpreter, StackError};
use fv_trace::{TraceError, Value};

pub use boundary::DiffBoundary;
pub use call::{
    BackwardFn, BatchDims, ForwardFn, SideChannel, VjpCall, VjpOutput, backward_fn, forward_fn,
};
pub use operator::{Rule, TransformableOperator};

/// The custom-vjp operator with all three rules registered.
pub static CUSTOM_VJP: TransformableOperator<VjpCall, VjpOutput> =
    TransformableOperator::new("custom_vjp")
        .with_rule(TransformKind::Plain, rules::plain_rule)
        .with_rule(TransformKind::Batched, rules::batched_rule)
        .with_rule(TransformKind::Differentiated, rules::grad_rule);

/// Apply a custom-vjp operator to `operands` under whatever transforms are
/// active on `interp`, returning the primary result.
pub fn custom_vjp(
    interp: &Interpreter,
    forward: &ForwardFn,
    backward: &BackwardFn,
    operands: &[Value],
) -> Result<Tree<Value>, DispatchError> {
    let call = VjpCall {
        forward: forward.clone(),
        backward: backward.clone(),
        operands: operands.to_vec(),
    };
    Ok(CUSTOM_VJP.dispatch(interp, &call)?.result)
}

#[derive(Debug)]
pub enum DispatchError {
    UnhandledTransform {
        operator: &'static str,
        kind: TransformKind,
    },
    DuplicateRule {
        operator: &'static str,
        kind: TransformKind,
    },
    /// Leaf count disagrees with the batch dims recorded for it.
    BatchDimCountMismatch {
        expected: usize,
        actual: usize,
    },
    BatchedArity {
        actual: usize,
    },
    UnbatchedOperand {
        level: Level,
    },
    GradientArity {
        expected: usize,
        actual: usize,
    },
    LayerMismatch {
        level: Level,
        expected: TransformKind,
    },
    MissingSideChannel,
    ResidualsConsumed {
        level: Level,
    },
    Stack(StackError),
    Trace(TraceError),
    Tree(TreeError),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnhandledTransform { operator, kind } => write!(
                f,
                "operator {} has no rule for transform {}",
                operator, kind
            ),
            Self::DuplicateRule { operator, kind } => write!(
                f,
                "operator {} already has a rule for transform {}",
                operator, kind
            ),
            Self::BatchDimCountMismatch { expected, actual } => write!(
                f,
                "batch dim count mismatch: expected {}, got {}",
                expected, actual
            ),
            Self::BatchedArity { actual } => write!(
                f,
                "batched rule takes exactly one operand, got {}",
                actual
            ),
            Self::UnbatchedOperand { level } => {
                write!(f, "operand carries no batch dimension at {}", level)
            }
            Self::GradientArity { expected, actual } => write!(
                f,
                "backward returned {} gradients, expected {}",
                actual, expected
            ),
            Self::LayerMismatch { level, expected } => {
                write!(f, "layer at {} is not a {} layer", level, expected)
            }
            Self::MissingSideChannel => write!(f, "side channel has no batch dims frame"),
            Self::ResidualsConsumed { level } => {
                write!(f, "saved values at {} were already consumed", level)
            }
            Self::Stack(err) => write!(f, "interpreter stack error: {err}"),
            Self::Trace(err) => write!(f, "trace error: {err}"),
            Self::Tree(err) => write!(f, "tree error: {err}"),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Stack(err) => Some(err),
            Self::Trace(err) => Some(err),
            Self::Tree(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StackError> for DispatchError {
    fn from(value: StackError) -> Self {
        Self::Stack(value)
    }
}

impl From<TraceError> for DispatchError {
    fn from(value: TraceError) -> Self {
        Self::Trace(value)
    }
}

impl From<TreeError> for DispatchError {
    fn from(value: TreeError) -> Self {
        Self::Tree(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_interpreters::{InterpreterConfig, LayerTag};
    use fv_trace::Tape;

    fn my_sin() -> (ForwardFn, BackwardFn) {
        let forward = forward_fn(|operands: &[Value]| {
            let x = &operands[0];
            Ok((Tree::leaf(x.sin()?), Tree::leaf(x.clone())))
        });
        let backward = backward_fn(|cts: &[Value], saved: &Tree<Value>| {
            let x = saved.as_leaf().expect("saved leaf");
            Ok(vec![cts[0].scale(2.0)?.mul(x)?.add(&cts[1])?])
        });
        (forward, backward)
    }

    fn interp() -> Interpreter {
        Interpreter::with_config(InterpreterConfig::default())
    }

    #[test]
    fn plain_dispatch_returns_forward_result() {
        let (forward, backward) = my_sin();
        let interp = interp();
        let out = custom_vjp(&interp, &forward, &backward, &[Value::scalar(0.5)])
            .expect("plain dispatch");
        let y = out.as_leaf().and_then(Value::as_f64_scalar).expect("scalar");
        assert!((y - 0.5_f64.sin()).abs() < 1e-12);
        assert!(!interp.is_active());
    }

    #[test]
    fn plain_layer_on_stack_uses_plain_rule() {
        let (forward, backward) = my_sin();
        let interp = interp();
        let _layer = interp.enter(LayerTag::Plain).expect("enter");
        let out = custom_vjp(&interp, &forward, &backward, &[Value::vector(&[0.0, 1.0])])
            .expect("plain dispatch");
        let values = out.as_leaf().and_then(Value::to_f64_vec).expect("vector");
        assert_eq!(values[0], 0.0);
        assert_eq!(interp.depth(), 1);
    }

    #[test]
    fn failing_forward_leaves_stack_unchanged() {
        let interp = interp();
        let forward = forward_fn(|operands: &[Value]| {
            // Rank-1 reduce over axis 3 fails inside the kernel.
            let bad = operands[0].reduce_sum(&[3])?;
            Ok((Tree::leaf(bad), Tree::unit()))
        });
        let backward = backward_fn(|_: &[Value], _: &Tree<Value>| Ok(Vec::new()));

        let _vmap = interp.enter(LayerTag::Batch { size: 2 }).expect("vmap");
        let level = interp.top().expect("top").1;
        let _grad = interp.enter(LayerTag::Grad(Tape::new())).expect("grad");
        let grad_level = interp.top().expect("top").1;
        let x = fv_trace::add_batch_dim(
            &Value::from(
                fv_core::Tensor::new(fv_core::Shape::from_dims(&[2, 3]), vec![0.0; 6])
                    .expect("tensor"),
            ),
            Some(0),
            level,
        )
        .expect("batched");
        let tape = match interp.top_layer().expect("layer").tag() {
            LayerTag::Grad(tape) => tape.clone(),
            _ => unreachable!("grad layer on top"),
        };
        let x = tape.leaf(grad_level, x).expect("leaf");

        let before = interp.depth();
        let err = custom_vjp(&interp, &forward, &backward, &[x]).expect_err("forward fails");
        assert!(matches!(err, DispatchError::Trace(TraceError::Eval(_))));
        assert_eq!(interp.depth(), before);
        assert_eq!(
            interp.top().expect("top"),
            (TransformKind::Differentiated, grad_level)
        );
    }

    #[test]
    fn display_names_operator_and_kind() {
        let err = DispatchError::UnhandledTransform {
            operator: "custom_vjp",
            kind: TransformKind::Batched,
        };
        assert_eq!(err.to_string(), "operator custom_vjp has no rule for transform vmap");
    }
}
