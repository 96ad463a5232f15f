#![forbid(unsafe_code)]

mod arithmetic;
mod reduction;
mod tensor_ops;

use fv_core::{Dims, Shape, Tensor, ValueError};

use arithmetic::{eval_binary_elementwise, eval_unary_elementwise};
use reduction::eval_reduce_sum;
use tensor_ops::{eval_broadcast_to, eval_reshape, eval_transpose};

pub use arithmetic::broadcast_shapes;

/// Primitive operations understood by the tensor kernels. Shape-carrying
/// variants hold their parameters inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primitive {
    Neg,
    Sin,
    Cos,
    Add,
    Mul,
    /// Sum over the listed axes; the reduced axes are dropped.
    ReduceSum {
        axes: Dims,
    },
    /// Numpy-style broadcast (right-aligned) to `shape`.
    BroadcastTo {
        shape: Shape,
    },
    Reshape {
        shape: Shape,
    },
    Transpose {
        permutation: Dims,
    },
}

impl Primitive {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Add => "add",
            Self::Mul => "mul",
            Self::ReduceSum { .. } => "reduce_sum",
            Self::BroadcastTo { .. } => "broadcast_to",
            Self::Reshape { .. } => "reshape",
            Self::Transpose { .. } => "transpose",
        }
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        match self {
            Self::Add | Self::Mul => 2,
            Self::Neg
            | Self::Sin
            | Self::Cos
            | Self::ReduceSum { .. }
            | Self::BroadcastTo { .. }
            | Self::Reshape { .. }
            | Self::Transpose { .. } => 1,
        }
    }

    #[must_use]
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Self::Neg | Self::Sin | Self::Cos | Self::Add | Self::Mul
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    ArityMismatch {
        primitive: &'static str,
        expected: usize,
        actual: usize,
    },
    IncompatibleShapes {
        primitive: &'static str,
        left: Shape,
        right: Shape,
    },
    AxisOutOfBounds {
        primitive: &'static str,
        axis: usize,
        rank: usize,
    },
    InvalidPermutation {
        permutation: Dims,
        rank: usize,
    },
    InvalidTensor(ValueError),
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ArityMismatch {
                primitive,
                expected,
                actual,
            } => write!(
                f,
                "arity mismatch for {}: expected {}, got {}",
                primitive, expected, actual
            ),
            Self::IncompatibleShapes {
                primitive,
                left,
                right,
            } => write!(
                f,
                "incompatible shapes for {}: {} vs {}",
                primitive, left, right
            ),
            Self::AxisOutOfBounds {
                primitive,
                axis,
                rank,
            } => write!(
                f,
                "axis {} out of bounds for rank {} in {}",
                axis, rank, primitive
            ),
            Self::InvalidPermutation { permutation, rank } => write!(
                f,
                "invalid permutation {:?} for rank {}",
                permutation.as_slice(),
                rank
            ),
            Self::InvalidTensor(err) => write!(f, "invalid tensor: {err}"),
        }
    }
}

impl std::error::Error for EvalError {}

impl From<ValueError> for EvalError {
    fn from(value: ValueError) -> Self {
        Self::InvalidTensor(value)
    }
}

/// Evaluate `primitive` on concrete tensors.
pub fn eval_primitive(primitive: &Primitive, inputs: &[Tensor]) -> Result<Tensor, EvalError> {
    if inputs.len() != primitive.arity() {
        return Err(EvalError::ArityMismatch {
            primitive: primitive.as_str(),
            expected: primitive.arity(),
            actual: inputs.len(),
        });
    }

    match primitive {
        Primitive::Neg => Ok(eval_unary_elementwise(&inputs[0], |x| -x)),
        Primitive::Sin => Ok(eval_unary_elementwise(&inputs[0], f64::sin)),
        Primitive::Cos => Ok(eval_unary_elementwise(&inputs[0], f64::cos)),
        Primitive::Add => eval_binary_elementwise(primitive, &inputs[0], &inputs[1], |a, b| a + b),
        Primitive::Mul => eval_binary_elementwise(primitive, &inputs[0], &inputs[1], |a, b| a * b),
        Primitive::ReduceSum { axes } => eval_reduce_sum(&inputs[0], axes),
        Primitive::BroadcastTo { shape } => eval_broadcast_to(&inputs[0], shape),
        Primitive::Reshape { shape } => eval_reshape(&inputs[0], shape),
        Primitive::Transpose { permutation } => eval_transpose(&inputs[0], permutation),
    }
}

/// Permutation that undoes `permutation`.
#[must_use]
pub fn inverse_permutation(permutation: &[usize]) -> Dims {
    let mut inverse: Dims = smallvec::smallvec![0; permutation.len()];
    for (dst, &src) in permutation.iter().enumerate() {
        if let Some(slot) = inverse.get_mut(src) {
            *slot = dst;
        }
    }
    inverse
}

/// Permutation moving axis `from` to position `to`, keeping the others in order.
#[must_use]
pub fn movedim_permutation(rank: usize, from: usize, to: usize) -> Dims {
    let mut order: Dims = (0..rank).filter(|axis| *axis != from).collect();
    order.insert(to.min(order.len()), from);
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn matrix(rows: usize, cols: usize, data: &[f64]) -> Tensor {
        Tensor::new(Shape::from_dims(&[rows, cols]), data.to_vec()).expect("matrix")
    }

    #[test]
    fn sin_is_elementwise() {
        let out = eval_primitive(
            &Primitive::Sin,
            &[Tensor::vector(&[0.0, std::f64::consts::FRAC_PI_2])],
        )
        .expect("sin");
        assert!(out.data()[0].abs() < 1e-12);
        assert!((out.data()[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn mul_broadcasts_scalar() {
        let out = eval_primitive(
            &Primitive::Mul,
            &[Tensor::vector(&[1.0, 2.0, 3.0]), Tensor::scalar(10.0)],
        )
        .expect("mul");
        assert_eq!(out.data(), &[10.0, 20.0, 30.0]);
    }

    #[test]
    fn add_broadcasts_column_against_row() {
        let column = matrix(2, 1, &[1.0, 2.0]);
        let row = Tensor::vector(&[10.0, 20.0, 30.0]);
        let out = eval_primitive(&Primitive::Add, &[column, row]).expect("add");
        assert_eq!(out.shape().dims.as_slice(), &[2, 3]);
        assert_eq!(out.data(), &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn add_rejects_incompatible_shapes() {
        let err = eval_primitive(
            &Primitive::Add,
            &[Tensor::vector(&[1.0, 2.0]), Tensor::vector(&[1.0, 2.0, 3.0])],
        )
        .expect_err("should fail");
        assert!(matches!(err, EvalError::IncompatibleShapes { .. }));
    }

    #[test]
    fn arity_is_checked() {
        let err = eval_primitive(&Primitive::Add, &[Tensor::scalar(1.0)]).expect_err("arity");
        assert_eq!(
            err,
            EvalError::ArityMismatch {
                primitive: "add",
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn reduce_sum_over_rows_and_all() {
        let m = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let rows = eval_primitive(&Primitive::ReduceSum { axes: smallvec![1] }, &[m.clone()])
            .expect("row sums");
        assert_eq!(rows.data(), &[6.0, 15.0]);
        let cols = eval_primitive(&Primitive::ReduceSum { axes: smallvec![0] }, &[m.clone()])
            .expect("col sums");
        assert_eq!(cols.data(), &[5.0, 7.0, 9.0]);
        let all = eval_primitive(
            &Primitive::ReduceSum {
                axes: smallvec![0, 1],
            },
            &[m],
        )
        .expect("total");
        assert_eq!(all.as_scalar(), Some(21.0));
    }

    #[test]
    fn reduce_sum_rejects_bad_axis() {
        let err = eval_primitive(
            &Primitive::ReduceSum { axes: smallvec![1] },
            &[Tensor::vector(&[1.0])],
        )
        .expect_err("axis");
        assert!(matches!(err, EvalError::AxisOutOfBounds { axis: 1, rank: 1, .. }));
    }

    #[test]
    fn broadcast_to_repeats_rows() {
        let out = eval_primitive(
            &Primitive::BroadcastTo {
                shape: Shape::from_dims(&[2, 3]),
            },
            &[Tensor::vector(&[1.0, 2.0, 3.0])],
        )
        .expect("broadcast");
        assert_eq!(out.data(), &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn transpose_swaps_axes() {
        let m = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = eval_primitive(
            &Primitive::Transpose {
                permutation: smallvec![1, 0],
            },
            &[m],
        )
        .expect("transpose");
        assert_eq!(out.shape().dims.as_slice(), &[3, 2]);
        assert_eq!(out.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn transpose_rejects_duplicate_axes() {
        let err = eval_primitive(
            &Primitive::Transpose {
                permutation: smallvec![0, 0],
            },
            &[matrix(1, 1, &[1.0])],
        )
        .expect_err("permutation");
        assert!(matches!(err, EvalError::InvalidPermutation { .. }));
    }

    #[test]
    fn reshape_keeps_row_major_order() {
        let out = eval_primitive(
            &Primitive::Reshape {
                shape: Shape::from_dims(&[3, 2]),
            },
            &[matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])],
        )
        .expect("reshape");
        assert_eq!(out.shape().dims.as_slice(), &[3, 2]);
        assert_eq!(out.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn movedim_permutation_moves_one_axis() {
        assert_eq!(movedim_permutation(3, 2, 0).as_slice(), &[2, 0, 1]);
        assert_eq!(movedim_permutation(3, 0, 2).as_slice(), &[1, 2, 0]);
        assert_eq!(movedim_permutation(1, 0, 0).as_slice(), &[0]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn vector_pair() -> impl Strategy<Value = (Vec<f64>, Vec<f64>)> {
        (1_usize..6).prop_flat_map(|len| {
            (
                prop::collection::vec(-100.0_f64..100.0, len),
                prop::collection::vec(-100.0_f64..100.0, len),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_add_commutative((a, b) in vector_pair()) {
            let (a, b) = (Tensor::vector(&a), Tensor::vector(&b));
            let ab = eval_primitive(&Primitive::Add, &[a.clone(), b.clone()]).unwrap();
            let ba = eval_primitive(&Primitive::Add, &[b, a]).unwrap();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_mul_commutative((a, b) in vector_pair()) {
            let (a, b) = (Tensor::vector(&a), Tensor::vector(&b));
            let ab = eval_primitive(&Primitive::Mul, &[a.clone(), b.clone()]).unwrap();
            let ba = eval_primitive(&Primitive::Mul, &[b, a]).unwrap();
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_movedim_then_inverse_is_identity(
            rows in 1_usize..4,
            cols in 1_usize..4,
            depth in 1_usize..4,
            from in 0_usize..3,
            to in 0_usize..3,
        ) {
            let count = rows * cols * depth;
            let data: Vec<f64> = (0..count).map(|x| x as f64).collect();
            let tensor = Tensor::new(Shape::from_dims(&[rows, cols, depth]), data).unwrap();
            let forward = movedim_permutation(3, from, to);
            let moved = eval_primitive(
                &Primitive::Transpose { permutation: forward.clone() },
                std::slice::from_ref(&tensor),
            ).unwrap();
            let back = eval_primitive(
                &Primitive::Transpose { permutation: inverse_permutation(&forward) },
                &[moved],
            ).unwrap();
            prop_assert_eq!(back, tensor);
        }
    }
}
