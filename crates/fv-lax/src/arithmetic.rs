#![forbid(unsafe_code)]

use fv_core::{Dims, Shape, Tensor};

use crate::tensor_ops::broadcast_index_map;
use crate::{EvalError, Primitive};

pub(crate) fn eval_unary_elementwise(input: &Tensor, op: impl Fn(f64) -> f64) -> Tensor {
    input.map(op)
}

/// Numpy broadcasting of two shapes (right-aligned, size-1 axes stretch).
#[must_use]
pub fn broadcast_shapes(left: &Shape, right: &Shape) -> Option<Shape> {
    let rank = left.rank().max(right.rank());
    let mut dims: Dims = smallvec::smallvec![0; rank];
    for (axis, slot) in dims.iter_mut().enumerate() {
        let l = aligned_dim(left, rank, axis);
        let r = aligned_dim(right, rank, axis);
        *slot = match (l, r) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
    }
    Some(Shape { dims })
}

fn aligned_dim(shape: &Shape, rank: usize, axis: usize) -> usize {
    let offset = rank - shape.rank();
    if axis < offset {
        1
    } else {
        shape.dims[axis - offset]
    }
}

pub(crate) fn eval_binary_elementwise(
    primitive: &Primitive,
    left: &Tensor,
    right: &Tensor,
    op: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, EvalError> {
    if left.shape() == right.shape() {
        let data = left
            .data()
            .iter()
            .zip(right.data())
            .map(|(a, b)| op(*a, *b))
            .collect();
        return Ok(Tensor::new(left.shape().clone(), data)?);
    }

    let out_shape =
        broadcast_shapes(left.shape(), right.shape()).ok_or_else(|| EvalError::IncompatibleShapes {
            primitive: primitive.as_str(),
            left: left.shape().clone(),
            right: right.shape().clone(),
        })?;

    let left_map = broadcast_index_map(&out_shape, left.shape());
    let right_map = broadcast_index_map(&out_shape, right.shape());
    let data = left_map
        .iter()
        .zip(&right_map)
        .map(|(l, r)| op(left.data()[*l], right.data()[*r]))
        .collect();
    Ok(Tensor::new(out_shape, data)?)
}

#[cfg(test)]
mod tests {
    use super::broadcast_shapes;
    use fv_core::Shape;

    #[test]
    fn broadcast_shapes_right_aligns() {
        let out = broadcast_shapes(&Shape::from_dims(&[4, 1]), &Shape::from_dims(&[3]));
        assert_eq!(out, Some(Shape::from_dims(&[4, 3])));
        assert_eq!(
            broadcast_shapes(&Shape::scalar(), &Shape::from_dims(&[2, 2])),
            Some(Shape::from_dims(&[2, 2]))
        );
        assert_eq!(
            broadcast_shapes(&Shape::from_dims(&[2]), &Shape::from_dims(&[3])),
            None
        );
    }
}
