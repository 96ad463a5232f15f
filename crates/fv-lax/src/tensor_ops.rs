#![forbid(unsafe_code)]

use fv_core::{Dims, Shape, Tensor};

use crate::EvalError;

/// Advance a row-major multi-index by one element.
pub(crate) fn increment_index(index: &mut [usize], dims: &[usize]) {
    for axis in (0..dims.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] {
            return;
        }
        index[axis] = 0;
    }
}

/// For every flat position of `out`, the flat position of `input` it reads
/// under right-aligned broadcasting. Caller guarantees compatibility.
pub(crate) fn broadcast_index_map(out: &Shape, input: &Shape) -> Vec<usize> {
    let out_rank = out.rank();
    let in_rank = input.rank();
    let offset = out_rank.saturating_sub(in_rank);
    let in_strides = input.strides();
    let total = out.element_count().unwrap_or(0);

    let mut map = Vec::with_capacity(total);
    let mut index: Dims = smallvec::smallvec![0; out_rank];
    for _ in 0..total {
        let flat = (0..in_rank)
            .filter(|axis| input.dims[*axis] != 1)
            .map(|axis| index[axis + offset] * in_strides[axis])
            .sum();
        map.push(flat);
        increment_index(&mut index, &out.dims);
    }
    map
}

fn can_broadcast_to(input: &Shape, target: &Shape) -> bool {
    if input.rank() > target.rank() {
        return false;
    }
    let offset = target.rank() - input.rank();
    input
        .dims
        .iter()
        .enumerate()
        .all(|(axis, dim)| *dim == 1 || *dim == target.dims[axis + offset])
}

pub(crate) fn eval_broadcast_to(input: &Tensor, shape: &Shape) -> Result<Tensor, EvalError> {
    if input.shape() == shape {
        return Ok(input.clone());
    }
    if !can_broadcast_to(input.shape(), shape) {
        return Err(EvalError::IncompatibleShapes {
            primitive: "broadcast_to",
            left: input.shape().clone(),
            right: shape.clone(),
        });
    }
    let data = broadcast_index_map(shape, input.shape())
        .into_iter()
        .map(|idx| input.data()[idx])
        .collect();
    Ok(Tensor::new(shape.clone(), data)?)
}

pub(crate) fn eval_reshape(input: &Tensor, shape: &Shape) -> Result<Tensor, EvalError> {
    if input.shape().element_count() != shape.element_count() {
        return Err(EvalError::IncompatibleShapes {
            primitive: "reshape",
            left: input.shape().clone(),
            right: shape.clone(),
        });
    }
    Ok(input.with_shape(shape.clone())?)
}

pub(crate) fn eval_transpose(input: &Tensor, permutation: &[usize]) -> Result<Tensor, EvalError> {
    let rank = input.rank();
    if permutation.len() != rank {
        return Err(EvalError::InvalidPermutation {
            permutation: Dims::from_slice(permutation),
            rank,
        });
    }
    let mut seen = vec![false; rank];
    for &axis in permutation {
        if axis >= rank || seen[axis] {
            return Err(EvalError::InvalidPermutation {
                permutation: Dims::from_slice(permutation),
                rank,
            });
        }
        seen[axis] = true;
    }

    let old_dims = &input.shape().dims;
    let new_shape = Shape {
        dims: permutation.iter().map(|&axis| old_dims[axis]).collect(),
    };
    let old_strides = input.shape().strides();

    let total = input.data().len();
    let mut data = Vec::with_capacity(total);
    let mut index: Dims = smallvec::smallvec![0; rank];
    for _ in 0..total {
        let flat: usize = permutation
            .iter()
            .zip(&index)
            .map(|(&src_axis, &pos)| pos * old_strides[src_axis])
            .sum();
        data.push(input.data()[flat]);
        increment_index(&mut index, &new_shape.dims);
    }
    Ok(Tensor::new(new_shape, data)?)
}
