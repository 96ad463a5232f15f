#![forbid(unsafe_code)]

use std::rc::Rc;

use fv_core::{Level, Tree};
use fv_interpreters::{Interpreter, LayerTag};
use fv_trace::{Value, add_batch_dim, broadcast_batch, unpack_batched};

use crate::boundary::DiffBoundary;
use crate::call::{BackwardFn, BatchDims, ForwardFn, SideChannel, VjpCall, VjpOutput};
use crate::operator::TransformableOperator;
use crate::DispatchError;

type CustomVjp = TransformableOperator<VjpCall, VjpOutput>;

pub fn plain_rule(
    op: &CustomVjp,
    interp: &Interpreter,
    call: &VjpCall,
) -> Result<VjpOutput, DispatchError> {
    tracing::debug!(rule = "plain", "custom vjp rule");
    DiffBoundary::build(Level::ROOT, call.forward.clone(), call.backward.clone())
        .forward(op, interp, &call.operands)
}

pub fn grad_rule(
    op: &CustomVjp,
    interp: &Interpreter,
    call: &VjpCall,
) -> Result<VjpOutput, DispatchError> {
    let (_, level) = interp.top()?;
    tracing::debug!(rule = "grad", %level, "custom vjp rule");
    DiffBoundary::build(level, call.forward.clone(), call.backward.clone())
        .forward(op, interp, &call.operands)
}

pub fn batched_rule(
    op: &CustomVjp,
    interp: &Interpreter,
    call: &VjpCall,
) -> Result<VjpOutput, DispatchError> {
    let [operand] = call.operands.as_slice() else {
        return Err(DispatchError::BatchedArity {
            actual: call.operands.len(),
        });
    };
    let (_, level) = interp.top()?;
    let (bare, batch_dim) = unpack_batched(operand, level);
    let batch_dim = batch_dim.ok_or(DispatchError::UnbatchedOperand { level })?;
    let size = bare.shape().dims[batch_dim];
    tracing::debug!(rule = "vmap", %level, batch_dim, size, "custom vjp rule");

    let mut inner = {
        let _suspended = interp.suspend_top()?;
        let lowered = VjpCall {
            forward: batch_forward(call.forward.clone(), batch_dim, size),
            backward: batch_backward(call.backward.clone(), batch_dim, size),
            operands: vec![bare],
        };
        op.dispatch(interp, &lowered)?
    };

    let frame = inner.side_channel.pop()?;
    Ok(VjpOutput {
        result: rewrap(inner.result, &frame.result, level)?,
        saved: rewrap(inner.saved, &frame.saved, level)?,
        side_channel: inner.side_channel,
    })
}

/// Wrap every leaf of `tree` at `level` using the matching entry of `dims`.
fn rewrap(
    tree: Tree<Value>,
    dims: &[Option<usize>],
    level: Level,
) -> Result<Tree<Value>, DispatchError> {
    let (leaves, spec) = tree.flatten();
    if leaves.len() != dims.len() {
        return Err(DispatchError::BatchDimCountMismatch {
            expected: dims.len(),
            actual: leaves.len(),
        });
    }
    let wrapped = leaves
        .iter()
        .zip(dims)
        .map(|(leaf, dim)| add_batch_dim(leaf, *dim, level))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(spec.unflatten(wrapped)?)
}

/// Peel the level-`level` batch wrapper off every leaf, returning the bare
/// tree and the batch dim of each leaf in flattening order.
fn unwrap_leaves(
    tree: Tree<Value>,
    level: Level,
) -> Result<(Tree<Value>, Vec<Option<usize>>), DispatchError> {
    let (leaves, spec) = tree.flatten();
    let (bare, dims): (Vec<Value>, Vec<Option<usize>>) = leaves
        .iter()
        .map(|leaf| unpack_batched(leaf, level))
        .unzip();
    Ok((spec.unflatten(bare)?, dims))
}

/// Forward that runs the user forward under a fresh batch layer and reports
/// the resulting batch dims through the side channel.
fn batch_forward(forward: ForwardFn, batch_dim: usize, size: usize) -> ForwardFn {
    Rc::new(
        move |interp: &Interpreter, operands: &[Value]| -> Result<VjpOutput, DispatchError> {
            let [operand] = operands else {
                return Err(DispatchError::BatchedArity {
                    actual: operands.len(),
                });
            };
            let layer = interp.enter(LayerTag::Batch { size })?;
            let level = layer.level();
            let wrapped = add_batch_dim(operand, Some(batch_dim), level)?;
            let out = forward(interp, &[wrapped])?;

            let (result, result_dims) = unwrap_leaves(out.result, level)?;
            let (saved, saved_dims) = unwrap_leaves(out.saved, level)?;
            tracing::trace!(%level, ?result_dims, ?saved_dims, "batched forward");
            let mut side_channel = out.side_channel;
            side_channel.push(BatchDims {
                result: result_dims,
                saved: saved_dims,
            });
            Ok(VjpOutput {
                result,
                saved,
                side_channel,
            })
        },
    )
}

/// Backward that re-wraps cotangents and saved values with the batch dims the
/// matching [`batch_forward`] recorded, then moves the gradient's batch dim
/// back to where the operand had it.
fn batch_backward(backward: BackwardFn, batch_dim: usize, size: usize) -> BackwardFn {
    Rc::new(
        move |interp: &Interpreter,
              cts: &[Value],
              saved: &Tree<Value>,
              side_channel: &SideChannel|
              -> Result<Vec<Value>, DispatchError> {
            let mut side_channel = side_channel.clone();
            let frame = side_channel.pop()?;
            if cts.len() != frame.leaf_count() {
                return Err(DispatchError::BatchDimCountMismatch {
                    expected: frame.leaf_count(),
                    actual: cts.len(),
                });
            }

            let layer = interp.enter(LayerTag::Batch { size })?;
            let level = layer.level();
            let cts = cts
                .iter()
                .zip(frame.iter())
                .map(|(ct, dim)| add_batch_dim(ct, dim, level))
                .collect::<Result<Vec<_>, _>>()?;
            let saved = rewrap(saved.clone(), &frame.saved, level)?;

            let grads = backward(interp, &cts, &saved, &side_channel)?;
            let [grad] = grads.as_slice() else {
                return Err(DispatchError::GradientArity {
                    expected: 1,
                    actual: grads.len(),
                });
            };
            let (grad, grad_dim) = unpack_batched(grad, level);
            let aligned = match grad_dim {
                Some(dim) => grad.movedim(dim, batch_dim)?,
                None => broadcast_batch(&grad, size, batch_dim)?,
            };
            tracing::trace!(%level, ?grad_dim, batch_dim, "batched backward");
            Ok(vec![aligned])
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CUSTOM_VJP, backward_fn, forward_fn};
    use fv_core::{Shape, Tensor, TransformKind};
    use fv_interpreters::InterpreterConfig;

    fn interp() -> Interpreter {
        Interpreter::with_config(InterpreterConfig::default())
    }

    fn identity_pair() -> (ForwardFn, BackwardFn) {
        let forward = forward_fn(|operands: &[Value]| {
            let x = &operands[0];
            Ok((
                Tree::pair(Tree::leaf(x.neg()?), Tree::leaf(x.clone())),
                Tree::leaf(x.clone()),
            ))
        });
        let backward = backward_fn(|cts: &[Value], _: &Tree<Value>| Ok(vec![cts[0].neg()?]));
        (forward, backward)
    }

    #[test]
    fn batched_rule_rejects_multiple_operands() {
        let (forward, backward) = identity_pair();
        let interp = interp();
        let _layer = interp.enter(LayerTag::Batch { size: 1 }).expect("vmap");
        let call = VjpCall {
            forward,
            backward,
            operands: vec![Value::scalar(1.0), Value::scalar(2.0)],
        };
        let err = CUSTOM_VJP.dispatch(&interp, &call).expect_err("arity");
        assert!(matches!(err, DispatchError::BatchedArity { actual: 2 }));
        assert_eq!(interp.depth(), 1);
    }

    #[test]
    fn batched_rule_rejects_unbatched_operand() {
        let (forward, backward) = identity_pair();
        let interp = interp();
        let layer = interp.enter(LayerTag::Batch { size: 1 }).expect("vmap");
        let call = VjpCall {
            forward,
            backward,
            operands: vec![Value::scalar(1.0)],
        };
        let err = CUSTOM_VJP.dispatch(&interp, &call).expect_err("unbatched");
        assert!(matches!(
            err,
            DispatchError::UnbatchedOperand { level } if level == layer.level()
        ));
    }

    #[test]
    fn batched_rule_keeps_leaf_positions_and_dims() {
        let (forward, backward) = identity_pair();
        let interp = interp();
        let layer = interp.enter(LayerTag::Batch { size: 3 }).expect("vmap");
        let level = layer.level();
        let data = Tensor::new(Shape::from_dims(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .expect("tensor");
        let x = add_batch_dim(&Value::from(data), Some(1), level).expect("batched");

        let call = VjpCall {
            forward,
            backward,
            operands: vec![x],
        };
        let out = CUSTOM_VJP.dispatch(&interp, &call).expect("dispatch");
        assert!(out.side_channel.is_empty());
        assert_eq!(interp.top().expect("top"), (TransformKind::Batched, level));

        let leaves = out.result.leaves();
        assert_eq!(leaves.len(), 2);
        for leaf in &leaves {
            assert_eq!(leaf.level(), Some(level));
            assert_eq!(leaf.shape(), Shape::vector(2));
        }
        // The negation went through the batching rule, which puts the batch
        // axis first; the passthrough leaf keeps the operand's layout.
        let (negated, dim) = unpack_batched(leaves[0], level);
        assert_eq!(dim, Some(0));
        assert_eq!(negated.to_f64_vec(), Some(vec![-1.0, -4.0, -2.0, -5.0, -3.0, -6.0]));
        let (passthrough, dim) = unpack_batched(leaves[1], level);
        assert_eq!(dim, Some(1));
        assert_eq!(passthrough.shape(), Shape::from_dims(&[2, 3]));
    }

    #[test]
    fn rewrap_rejects_count_mismatch() {
        let tree = Tree::pair(Tree::leaf(Value::scalar(1.0)), Tree::leaf(Value::scalar(2.0)));
        let err = rewrap(tree, &[None], Level(1)).expect_err("mismatch");
        assert!(matches!(
            err,
            DispatchError::BatchDimCountMismatch {
                expected: 1,
                actual: 2,
            }
        ));
    }

    #[test]
    fn batch_backward_rejects_cotangent_count_mismatch() {
        let (_, backward) = identity_pair();
        let interp = interp();
        let lowered = batch_backward(backward, 0, 2);
        let mut side_channel = SideChannel::new();
        side_channel.push(BatchDims {
            result: vec![Some(0), Some(0)],
            saved: vec![Some(0)],
        });
        let err = lowered(
            &interp,
            &[Value::vector(&[1.0, 1.0])],
            &Tree::leaf(Value::vector(&[0.0, 0.0])),
            &side_channel,
        )
        .expect_err("count");
        assert!(matches!(
            err,
            DispatchError::BatchDimCountMismatch {
                expected: 3,
                actual: 1,
            }
        ));
        assert!(!interp.is_active());
    }

    #[test]
    fn batch_backward_without_frame_fails() {
        let (_, backward) = identity_pair();
        let lowered = batch_backward(backward, 0, 2);
        let err = lowered(
            &interp(),
            &[],
            &Tree::unit(),
            &SideChannel::new(),
        )
        .expect_err("no frame");
        assert!(matches!(err, DispatchError::MissingSideChannel));
    }

    #[test]
    fn batch_backward_broadcasts_unbatched_gradient() {
        let backward = backward_fn(|_: &[Value], _: &Tree<Value>| Ok(vec![Value::scalar(5.0)]));
        let lowered = batch_backward(backward, 0, 3);
        let mut side_channel = SideChannel::new();
        side_channel.push(BatchDims {
            result: vec![Some(0)],
            saved: vec![],
        });
        let grads = lowered(
            &interp(),
            &[Value::vector(&[1.0, 1.0, 1.0])],
            &Tree::unit(),
            &side_channel,
        )
        .expect("backward");
        assert_eq!(grads[0].to_f64_vec(), Some(vec![5.0, 5.0, 5.0]));
    }
}
