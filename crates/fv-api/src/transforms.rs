#![forbid(unsafe_code)]

use fv_interpreters::{Interpreter, LayerTag};
use fv_trace::{
    Tape, TraceError, Value, add_batch_dim, broadcast_batch, unpack_batched, unwrap_for_grad,
};

use crate::errors::ApiError;

/// A single-input, single-output function that can run under transforms.
/// Closures and every wrapper in this module implement it, so wrappers nest.
pub trait Function {
    fn call(&self, interp: &Interpreter, x: &Value) -> Result<Value, ApiError>;
}

impl<F> Function for F
where
    F: Fn(&Interpreter, &Value) -> Result<Value, ApiError>,
{
    fn call(&self, interp: &Interpreter, x: &Value) -> Result<Value, ApiError> {
        self(interp, x)
    }
}

#[derive(Debug, Clone)]
pub struct GradWrapped<F> {
    f: F,
}

#[derive(Debug, Clone)]
pub struct GradAndValueWrapped<F> {
    f: F,
}

#[derive(Debug, Clone)]
pub struct VmapWrapped<F> {
    f: F,
    in_axis: usize,
    out_axis: usize,
}

/// `f` followed by a sum over every element of its output.
#[derive(Debug, Clone)]
pub struct Summed<F> {
    f: F,
}

#[must_use]
pub fn grad<F: Function>(f: F) -> GradWrapped<F> {
    GradWrapped { f }
}

#[must_use]
pub fn grad_and_value<F: Function>(f: F) -> GradAndValueWrapped<F> {
    GradAndValueWrapped { f }
}

#[must_use]
pub fn vmap<F: Function>(f: F) -> VmapWrapped<F> {
    VmapWrapped {
        f,
        in_axis: 0,
        out_axis: 0,
    }
}

/// Clears the tape when dropped so records do not outlive the transform.
struct TapeScope(Tape);

impl Drop for TapeScope {
    fn drop(&mut self) {
        self.0.clear();
    }
}

/// Gradient of scalar-valued `f` at `x`, together with `f(x)`.
fn grad_impl<F: Function>(
    f: &F,
    interp: &Interpreter,
    x: &Value,
) -> Result<(Value, Value), ApiError> {
    let scope = TapeScope(Tape::new());
    let tape = &scope.0;
    let (level, input, output) = {
        let layer = interp.enter(LayerTag::Grad(tape.clone()))?;
        let level = layer.level();
        let input = tape.leaf(level, x.clone())?;
        let output = f.call(interp, &input)?;
        (level, input, output)
    };

    let shape = output.shape();
    if !shape.is_scalar() {
        return Err(ApiError::GradRequiresScalar { shape });
    }
    tracing::debug!(%level, records = tape.record_count(), "grad backward");
    let gradient = tape
        .backward(level, &output, std::slice::from_ref(&input))?
        .pop()
        .ok_or(TraceError::CotangentArity {
            expected: 1,
            actual: 0,
        })?;
    Ok((gradient, unwrap_for_grad(&output, level)))
}

impl<F: Function> Function for GradWrapped<F> {
    fn call(&self, interp: &Interpreter, x: &Value) -> Result<Value, ApiError> {
        Ok(grad_impl(&self.f, interp, x)?.0)
    }
}

impl<F: Function> GradAndValueWrapped<F> {
    /// Returns `(gradient, value)`.
    pub fn call(&self, interp: &Interpreter, x: &Value) -> Result<(Value, Value), ApiError> {
        grad_impl(&self.f, interp, x)
    }
}

impl<F: Function> VmapWrapped<F> {
    /// Axis of the input to map over.
    #[must_use]
    pub fn with_in_axis(mut self, in_axis: usize) -> Self {
        self.in_axis = in_axis;
        self
    }

    /// Axis of the output where the mapped axis is placed.
    #[must_use]
    pub fn with_out_axis(mut self, out_axis: usize) -> Self {
        self.out_axis = out_axis;
        self
    }

    #[must_use]
    pub fn summed(self) -> Summed<Self> {
        Summed { f: self }
    }
}

impl<F: Function> Function for VmapWrapped<F> {
    fn call(&self, interp: &Interpreter, x: &Value) -> Result<Value, ApiError> {
        let shape = x.shape();
        let size = *shape
            .dims
            .get(self.in_axis)
            .ok_or(ApiError::BatchAxisOutOfRange {
                axis: self.in_axis,
                rank: shape.rank(),
            })?;

        let (output, batch_dim) = {
            let layer = interp.enter(LayerTag::Batch { size })?;
            let level = layer.level();
            let batched = add_batch_dim(x, Some(self.in_axis), level)?;
            let output = self.f.call(interp, &batched)?;
            unpack_batched(&output, level)
        };

        match batch_dim {
            Some(dim) => {
                if self.out_axis >= output.rank() {
                    return Err(ApiError::BatchAxisOutOfRange {
                        axis: self.out_axis,
                        rank: output.rank(),
                    });
                }
                Ok(output.movedim(dim, self.out_axis)?)
            }
            None => {
                if self.out_axis > output.rank() {
                    return Err(ApiError::BatchAxisOutOfRange {
                        axis: self.out_axis,
                        rank: output.rank() + 1,
                    });
                }
                Ok(broadcast_batch(&output, size, self.out_axis)?)
            }
        }
    }
}

impl<F: Function> Function for Summed<F> {
    fn call(&self, interp: &Interpreter, x: &Value) -> Result<Value, ApiError> {
        Ok(self.f.call(interp, x)?.sum()?)
    }
}
