#![forbid(unsafe_code)]

//! Batching rules.
//!
//! Every rule first moves the batch axis of each batched operand to the
//! front, evaluates the primitive one level down on the stacked data, and
//! returns a tracer whose batch axis is 0.

use std::rc::Rc;

use fv_core::{Dims, Level, Shape};
use fv_lax::Primitive;

use crate::value::{BatchTracer, Value};
use crate::{TraceError, apply_primitive};

/// Wrap `value` so that axis `batch_dim` becomes the implicit batch of a vmap
/// at `level`. `None` means the value is not batched and is returned as-is.
pub fn add_batch_dim(
    value: &Value,
    batch_dim: Option<usize>,
    level: Level,
) -> Result<Value, TraceError> {
    let Some(batch_dim) = batch_dim else {
        return Ok(value.clone());
    };
    let rank = value.rank();
    if batch_dim >= rank {
        return Err(TraceError::BatchDimOutOfRange { batch_dim, rank });
    }
    if let Some(inner) = value.level()
        && inner >= level
    {
        return Err(TraceError::LevelOrder {
            wrapper: level,
            inner,
        });
    }
    Ok(Value::Batched(Rc::new(BatchTracer {
        level,
        value: value.clone(),
        batch_dim,
    })))
}

/// Split a value into its level-`level` payload and batch axis. Values not
/// batched at `level` come back unchanged with `None`.
#[must_use]
pub fn unpack_batched(value: &Value, level: Level) -> (Value, Option<usize>) {
    match value {
        Value::Batched(tracer) if tracer.level == level => {
            (tracer.value.clone(), Some(tracer.batch_dim))
        }
        _ => (value.clone(), None),
    }
}

/// Materialize an unbatched value as `size` stacked copies along `axis`.
pub fn broadcast_batch(value: &Value, size: usize, axis: usize) -> Result<Value, TraceError> {
    let shape = value.shape();
    if axis > shape.rank() {
        return Err(TraceError::AxisOutOfRange {
            axis,
            rank: shape.rank() + 1,
        });
    }
    value
        .reshape(shape.with_axis(0, 1))?
        .broadcast_to(shape.with_axis(0, size))?
        .movedim(0, axis)
}

fn move_batch_dim_to_front(value: &Value, batch_dim: usize) -> Result<Value, TraceError> {
    value.movedim(batch_dim, 0)
}

/// Insert `count` unit axes right after the leading batch axis.
fn pad_after_batch(value: &Value, count: usize) -> Result<Value, TraceError> {
    if count == 0 {
        return Ok(value.clone());
    }
    let shape = value.shape();
    let mut dims: Dims = Dims::with_capacity(shape.rank() + count);
    dims.push(shape.dims[0]);
    dims.extend(std::iter::repeat_n(1, count));
    dims.extend_from_slice(&shape.dims[1..]);
    value.reshape(Shape { dims })
}

pub(crate) fn apply_batch_rule(
    primitive: &Primitive,
    inputs: &[Value],
    level: Level,
) -> Result<Value, TraceError> {
    let mut batch_size: Option<usize> = None;
    let mut operands = Vec::with_capacity(inputs.len());
    for input in inputs {
        let (value, batch_dim) = unpack_batched(input, level);
        match batch_dim {
            Some(batch_dim) => {
                let front = move_batch_dim_to_front(&value, batch_dim)?;
                let size = front.shape().dims[0];
                match batch_size {
                    Some(expected) if expected != size => {
                        return Err(TraceError::BatchSizeMismatch {
                            expected,
                            actual: size,
                        });
                    }
                    _ => batch_size = Some(size),
                }
                operands.push((front, true));
            }
            None => operands.push((value, false)),
        }
    }
    let Some(size) = batch_size else {
        let values: Vec<Value> = operands.into_iter().map(|(value, _)| value).collect();
        return apply_primitive(primitive, &values);
    };

    let out = match primitive {
        Primitive::Neg | Primitive::Sin | Primitive::Cos => {
            apply_primitive(primitive, &[operands[0].0.clone()])?
        }
        Primitive::Add | Primitive::Mul => {
            let logical_rank = |(value, batched): &(Value, bool)| {
                value.rank() - usize::from(*batched)
            };
            let target = operands.iter().map(logical_rank).max().unwrap_or(0);
            let aligned = operands
                .iter()
                .map(|operand| {
                    if operand.1 {
                        pad_after_batch(&operand.0, target - logical_rank(operand))
                    } else {
                        Ok(operand.0.clone())
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            apply_primitive(primitive, &aligned)?
        }
        Primitive::ReduceSum { axes } => {
            let shifted: Dims = axes.iter().map(|axis| axis + 1).collect();
            operands[0].0.reduce_sum(&shifted)?
        }
        Primitive::BroadcastTo { shape } => {
            let operand = &operands[0].0;
            let padded = pad_after_batch(operand, shape.rank().saturating_sub(operand.rank() - 1))?;
            padded.broadcast_to(shape.with_axis(0, size))?
        }
        Primitive::Reshape { shape } => operands[0].0.reshape(shape.with_axis(0, size))?,
        Primitive::Transpose { permutation } => {
            let mut shifted: Dims = Dims::with_capacity(permutation.len() + 1);
            shifted.push(0);
            shifted.extend(permutation.iter().map(|axis| axis + 1));
            operands[0].0.transpose(&shifted)?
        }
    };
    add_batch_dim(&out, Some(0), level)
}
