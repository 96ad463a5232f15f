#![forbid(unsafe_code)]

use fv_core::{Dims, Shape, Tensor};

use crate::EvalError;
use crate::tensor_ops::increment_index;

/// Sum over `axes`, dropping them from the output shape. Duplicate axes are
/// treated as one.
pub(crate) fn eval_reduce_sum(input: &Tensor, axes: &[usize]) -> Result<Tensor, EvalError> {
    let rank = input.rank();
    let mut reduced = vec![false; rank];
    for &axis in axes {
        if axis >= rank {
            return Err(EvalError::AxisOutOfBounds {
                primitive: "reduce_sum",
                axis,
                rank,
            });
        }
        reduced[axis] = true;
    }

    let kept: Dims = (0..rank).filter(|axis| !reduced[*axis]).collect();
    let out_shape = Shape {
        dims: kept.iter().map(|&axis| input.shape().dims[axis]).collect(),
    };
    let out_strides = out_shape.strides();
    let mut out = vec![0.0; out_shape.element_count().unwrap_or(0)];

    let mut index: Dims = smallvec::smallvec![0; rank];
    for value in input.data() {
        let flat: usize = kept
            .iter()
            .zip(&out_strides)
            .map(|(&axis, stride)| index[axis] * stride)
            .sum();
        out[flat] += value;
        increment_index(&mut index, &input.shape().dims);
    }
    Ok(Tensor::new(out_shape, out)?)
}
