#![forbid(unsafe_code)]

use std::rc::Rc;

use fv_core::Tree;
use fv_interpreters::Interpreter;
use fv_trace::{TraceError, Value};
use serde::{Deserialize, Serialize};

use crate::DispatchError;

/// Forward half of a custom-vjp operator: operands to (result, saved).
pub type ForwardFn = Rc<dyn Fn(&Interpreter, &[Value]) -> Result<VjpOutput, DispatchError>>;

/// Backward half: cotangents of the result leaves followed by those of the
/// saved leaves, plus the saved values themselves, to one gradient per
/// operand.
pub type BackwardFn =
    Rc<dyn Fn(&Interpreter, &[Value], &Tree<Value>, &SideChannel) -> Result<Vec<Value>, DispatchError>>;

/// Batch axes recorded by one batched forward, one entry per flattened leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDims {
    pub result: Vec<Option<usize>>,
    pub saved: Vec<Option<usize>>,
}

impl BatchDims {
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.result.len() + self.saved.len()
    }

    /// Dims for the concatenated (result, saved) leaf sequence.
    pub fn iter(&self) -> impl Iterator<Item = Option<usize>> + '_ {
        self.result.iter().chain(&self.saved).copied()
    }
}

/// Frames pushed by batched forwards on the way down and popped by the
/// matching batched backwards, innermost last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideChannel {
    frames: Vec<BatchDims>,
}

impl SideChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: BatchDims) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Result<BatchDims, DispatchError> {
        self.frames.pop().ok_or(DispatchError::MissingSideChannel)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Clone)]
pub struct VjpCall {
    pub forward: ForwardFn,
    pub backward: BackwardFn,
    pub operands: Vec<Value>,
}

impl std::fmt::Debug for VjpCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VjpCall")
            .field("operands", &self.operands)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct VjpOutput {
    pub result: Tree<Value>,
    pub saved: Tree<Value>,
    pub side_channel: SideChannel,
}

/// Lift a forward that ignores the interpreter and produces no side channel.
pub fn forward_fn<F>(f: F) -> ForwardFn
where
    F: Fn(&[Value]) -> Result<(Tree<Value>, Tree<Value>), TraceError> + 'static,
{
    Rc::new(
        move |_: &Interpreter, operands: &[Value]| -> Result<VjpOutput, DispatchError> {
            let (result, saved) = f(operands)?;
            Ok(VjpOutput {
                result,
                saved,
                side_channel: SideChannel::new(),
            })
        },
    )
}

/// Lift a backward written only in terms of cotangents and saved values.
pub fn backward_fn<F>(f: F) -> BackwardFn
where
    F: Fn(&[Value], &Tree<Value>) -> Result<Vec<Value>, TraceError> + 'static,
{
    Rc::new(
        move |_: &Interpreter,
              cts: &[Value],
              saved: &Tree<Value>,
              _: &SideChannel|
              -> Result<Vec<Value>, DispatchError> { Ok(f(cts, saved)?) },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_channel_is_lifo() {
        let mut channel = SideChannel::new();
        channel.push(BatchDims {
            result: vec![Some(0)],
            saved: vec![],
        });
        channel.push(BatchDims {
            result: vec![None, Some(1)],
            saved: vec![Some(0)],
        });
        assert_eq!(channel.pop().expect("top").leaf_count(), 3);
        assert_eq!(channel.pop().expect("bottom").result, vec![Some(0)]);
        assert!(matches!(channel.pop(), Err(DispatchError::MissingSideChannel)));
    }

    #[test]
    fn batch_dims_iterate_result_then_saved() {
        let dims = BatchDims {
            result: vec![Some(2), None],
            saved: vec![Some(0)],
        };
        assert_eq!(dims.iter().collect::<Vec<_>>(), vec![Some(2), None, Some(0)]);
    }

    #[test]
    fn side_channel_json_shape() {
        let mut channel = SideChannel::new();
        channel.push(BatchDims {
            result: vec![Some(0), None],
            saved: vec![Some(1)],
        });
        let encoded = serde_json::to_string(&channel).expect("json");
        assert_eq!(
            encoded,
            r#"{"frames":[{"result":[0,null],"saved":[1]}]}"#
        );
    }

    #[test]
    fn lifted_forward_has_empty_side_channel() {
        let forward = forward_fn(|operands: &[Value]| {
            Ok((Tree::leaf(operands[0].neg()?), Tree::unit()))
        });
        let interp = Interpreter::default();
        let out = forward(&interp, &[Value::scalar(2.0)]).expect("forward");
        assert!(out.side_channel.is_empty());
        assert_eq!(
            out.result.as_leaf().and_then(Value::as_f64_scalar),
            Some(-2.0)
        );
    }
}
