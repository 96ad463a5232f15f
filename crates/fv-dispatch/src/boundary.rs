#![forbid(unsafe_code)]

//! Differentiation boundaries.
//!
//! A boundary built at level 0 runs the forward directly. A boundary built at
//! level `L > 0` strips the level-`L` grad wrappers from its operands, takes
//! the level-`L` layer off the stack, re-dispatches the operator one level
//! down, and records one node on the level-`L` tape whose vjp is this
//! boundary's backward. Saved values are kept with the level-`L` wrapper
//! already removed, so the backward computes on lower-level values and is
//! itself differentiable by the enclosing transforms.

use std::cell::RefCell;
use std::rc::Rc;

use fv_core::{Level, TransformKind, Tree, TreeSpec};
use fv_interpreters::{Interpreter, LayerTag};
use fv_trace::{TraceError, Value, VjpFn, attach_custom_vjp, unwrap_for_grad};

use crate::call::{BackwardFn, ForwardFn, SideChannel, VjpCall, VjpOutput};
use crate::operator::TransformableOperator;
use crate::DispatchError;

#[derive(Debug)]
struct Residuals {
    saved: Vec<Value>,
    spec: TreeSpec,
    side_channel: SideChannel,
}

pub struct DiffBoundary {
    level: Level,
    forward: ForwardFn,
    backward: BackwardFn,
    residuals: RefCell<Option<Residuals>>,
}

impl std::fmt::Debug for DiffBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffBoundary")
            .field("level", &self.level)
            .field("residuals", &self.residuals)
            .finish_non_exhaustive()
    }
}

impl DiffBoundary {
    #[must_use]
    pub fn build(level: Level, forward: ForwardFn, backward: BackwardFn) -> Rc<Self> {
        Rc::new(Self {
            level,
            forward,
            backward,
            residuals: RefCell::new(None),
        })
    }

    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub fn has_residuals(&self) -> bool {
        self.residuals.borrow().is_some()
    }

    fn store(&self, saved: &Tree<Value>, side_channel: &SideChannel) {
        let (saved, spec) = saved.clone().flatten();
        *self.residuals.borrow_mut() = Some(Residuals {
            saved,
            spec,
            side_channel: side_channel.clone(),
        });
    }

    pub fn forward(
        self: &Rc<Self>,
        op: &TransformableOperator<VjpCall, VjpOutput>,
        interp: &Interpreter,
        operands: &[Value],
    ) -> Result<VjpOutput, DispatchError> {
        if self.level.is_root() {
            tracing::debug!(level = %self.level, "boundary forward");
            let out = (self.forward)(interp, operands)?;
            self.store(&out.saved, &out.side_channel);
            return Ok(out);
        }
        self.nested_forward(op, interp, operands)
    }

    fn nested_forward(
        self: &Rc<Self>,
        op: &TransformableOperator<VjpCall, VjpOutput>,
        interp: &Interpreter,
        operands: &[Value],
    ) -> Result<VjpOutput, DispatchError> {
        let level = self.level;
        tracing::debug!(%level, operands = operands.len(), "boundary forward");

        let call = VjpCall {
            forward: self.forward.clone(),
            backward: self.backward.clone(),
            operands: operands
                .iter()
                .map(|operand| unwrap_for_grad(operand, level))
                .collect(),
        };

        let (tape, inner) = {
            let suspended = interp.suspend_top()?;
            let tape = match suspended.tag() {
                Some(LayerTag::Grad(tape)) if suspended.level() == level => tape.clone(),
                _ => {
                    return Err(DispatchError::LayerMismatch {
                        level: suspended.level(),
                        expected: TransformKind::Differentiated,
                    });
                }
            };
            (tape, op.dispatch(interp, &call)?)
        };

        let (result_leaves, result_spec) = inner.result.flatten();
        let (saved_leaves, saved_spec) = inner.saved.clone().flatten();
        let result_count = result_leaves.len();
        let mut outputs = result_leaves;
        outputs.extend(saved_leaves);

        let boundary = Rc::clone(self);
        let backward_interp = interp.clone();
        let vjp: VjpFn = Rc::new(move |cts: &[Value]| {
            boundary
                .backward(&backward_interp, cts)
                .map_err(|err| TraceError::CustomRule(Box::new(err)))
        });
        let mut wrapped = attach_custom_vjp(&tape, level, operands, outputs, vjp)?;
        let wrapped_saved = wrapped.split_off(result_count);

        self.store(&inner.saved, &inner.side_channel);
        Ok(VjpOutput {
            result: result_spec.unflatten(wrapped)?,
            saved: saved_spec.unflatten(wrapped_saved)?,
            side_channel: inner.side_channel,
        })
    }

    /// Gradients of the operands given cotangents for the result leaves
    /// followed by the saved leaves. Saved values are released on the first
    /// call; a second call fails.
    pub fn backward(&self, interp: &Interpreter, cts: &[Value]) -> Result<Vec<Value>, DispatchError> {
        let residuals = self
            .residuals
            .borrow_mut()
            .take()
            .ok_or(DispatchError::ResidualsConsumed { level: self.level })?;
        tracing::debug!(level = %self.level, cotangents = cts.len(), "boundary backward");
        let saved = residuals.spec.unflatten(residuals.saved)?;
        (self.backward)(interp, cts, &saved, &residuals.side_channel)
    }
}
