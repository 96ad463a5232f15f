#![forbid(unsafe_code)]

use std::rc::Rc;

use fv_core::{Dims, Level, Shape};
use fv_lax::{Primitive, inverse_permutation};
use smallvec::SmallVec;

use crate::tape::{Tape, VarId, VjpFn, var_at};
use crate::value::Value;
use crate::{TraceError, apply_primitive};

/// Strip the level-`level` grad wrapper, if any. Values from other levels are
/// returned as-is.
#[must_use]
pub fn unwrap_for_grad(value: &Value, level: Level) -> Value {
    match value {
        Value::Grad(tracer) if tracer.level == level => tracer.primal.clone(),
        _ => value.clone(),
    }
}

fn input_vars(inputs: &[Value], level: Level, tape: &Tape) -> SmallVec<[Option<VarId>; 2]> {
    inputs
        .iter()
        .map(|value| var_at(value, level, tape))
        .collect()
}

pub(crate) fn apply_grad_rule(
    primitive: &Primitive,
    inputs: &[Value],
    level: Level,
    tape: &Tape,
) -> Result<Value, TraceError> {
    let primals: Vec<Value> = inputs
        .iter()
        .map(|value| unwrap_for_grad(value, level))
        .collect();
    let out = apply_primitive(primitive, &primals)?;

    let rule_primitive = primitive.clone();
    let vjp: VjpFn = Rc::new(move |cts: &[Value]| {
        let [ct] = cts else {
            return Err(TraceError::CotangentArity {
                expected: 1,
                actual: cts.len(),
            });
        };
        vjp_rule(&rule_primitive, &primals, ct)
    });

    let mut wrapped = tape.record(level, input_vars(inputs, level, tape), vec![out], vjp)?;
    wrapped.pop().ok_or(TraceError::CotangentArity {
        expected: 1,
        actual: 0,
    })
}

/// Cotangents of each primitive input, given the output cotangent `ct`.
fn vjp_rule(primitive: &Primitive, primals: &[Value], ct: &Value) -> Result<Vec<Value>, TraceError> {
    match primitive {
        Primitive::Neg => Ok(vec![ct.neg()?]),
        Primitive::Sin => Ok(vec![ct.mul(&primals[0].cos()?)?]),
        Primitive::Cos => Ok(vec![ct.mul(&primals[0].sin()?)?.neg()?]),
        Primitive::Add => Ok(vec![
            sum_to_shape(ct, &primals[0].shape())?,
            sum_to_shape(ct, &primals[1].shape())?,
        ]),
        Primitive::Mul => Ok(vec![
            sum_to_shape(&ct.mul(&primals[1])?, &primals[0].shape())?,
            sum_to_shape(&ct.mul(&primals[0])?, &primals[1].shape())?,
        ]),
        Primitive::ReduceSum { axes } => {
            let in_shape = primals[0].shape();
            let mut kept = in_shape.clone();
            for &axis in axes {
                if let Some(dim) = kept.dims.get_mut(axis) {
                    *dim = 1;
                }
            }
            Ok(vec![ct.reshape(kept)?.broadcast_to(in_shape)?])
        }
        Primitive::BroadcastTo { .. } => Ok(vec![sum_to_shape(ct, &primals[0].shape())?]),
        Primitive::Reshape { .. } => Ok(vec![ct.reshape(primals[0].shape())?]),
        Primitive::Transpose { permutation } => {
            Ok(vec![ct.transpose(&inverse_permutation(permutation))?])
        }
    }
}

/// Undo broadcasting: sum `value` down to `target`.
pub(crate) fn sum_to_shape(value: &Value, target: &Shape) -> Result<Value, TraceError> {
    let shape = value.shape();
    if &shape == target {
        return Ok(value.clone());
    }
    if shape.rank() < target.rank() {
        return value.broadcast_to(target.clone());
    }

    let lead = shape.rank() - target.rank();
    let mut axes: Dims = (0..lead).collect();
    for (offset, (&want, &have)) in target.dims.iter().zip(&shape.dims[lead..]).enumerate() {
        if want == 1 && have != 1 {
            axes.push(lead + offset);
        }
    }
    value.reduce_sum(&axes)?.reshape(target.clone())
}

/// Record a node at `level` whose outputs are `outputs` and whose backward
/// pass is `vjp`. `inputs` are the level-`level` operands the node consumed;
/// `vjp` must return one cotangent per input. Returns the outputs wrapped as
/// level-`level` tracers.
pub fn attach_custom_vjp(
    tape: &Tape,
    level: Level,
    inputs: &[Value],
    outputs: Vec<Value>,
    vjp: VjpFn,
) -> Result<Vec<Value>, TraceError> {
    tracing::trace!(
        %level,
        inputs = inputs.len(),
        outputs = outputs.len(),
        "attach custom vjp"
    );
    tape.record(level, input_vars(inputs, level, tape), outputs, vjp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fv_core::Tensor;

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-12
    }

    #[test]
    fn sum_to_shape_reduces_leading_and_unit_axes() {
        let value = Value::from(
            Tensor::new(Shape::from_dims(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
                .expect("tensor"),
        );
        let rows = sum_to_shape(&value, &Shape::vector(3)).expect("rows");
        assert_eq!(rows.to_f64_vec(), Some(vec![5.0, 7.0, 9.0]));

        let column = sum_to_shape(&value, &Shape::from_dims(&[2, 1])).expect("column");
        assert_eq!(column.shape(), Shape::from_dims(&[2, 1]));
        assert_eq!(column.to_f64_vec(), Some(vec![6.0, 15.0]));
    }

    #[test]
    fn grad_of_sin_is_cos() {
        let tape = Tape::new();
        let x = tape.leaf(Level(1), Value::scalar(0.3)).expect("leaf");
        let y = x.sin().expect("sin");
        let grads = tape.backward(Level(1), &y, &[x]).expect("backward");
        let got = grads[0].as_f64_scalar().expect("scalar");
        assert!(close(got, 0.3_f64.cos()));
    }

    #[test]
    fn nested_tapes_give_second_derivative() {
        let outer = Tape::new();
        let inner = Tape::new();
        let x1 = outer.leaf(Level(1), Value::scalar(0.7)).expect("outer leaf");
        let x2 = inner.leaf(Level(2), x1.clone()).expect("inner leaf");
        let y = x2.sin().expect("sin");

        let first = inner.backward(Level(2), &y, &[x2]).expect("first");
        assert_eq!(first[0].level(), Some(Level(1)));
        let second = outer.backward(Level(1), &first[0], &[x1]).expect("second");
        let got = second[0].as_f64_scalar().expect("scalar");
        assert!(close(got, -(0.7_f64.sin())));
    }

    #[test]
    fn broadcast_add_gradient_sums_back() {
        let tape = Tape::new();
        let x = tape.leaf(Level(1), Value::scalar(2.0)).expect("leaf");
        let y = x
            .add(&Value::vector(&[1.0, 2.0, 3.0]))
            .and_then(|v| v.sum())
            .expect("forward");
        let grads = tape.backward(Level(1), &y, &[x]).expect("backward");
        assert_eq!(grads[0].as_f64_scalar(), Some(3.0));
    }

    #[test]
    fn transpose_gradient_inverts_permutation() {
        let tape = Tape::new();
        let data: Vec<f64> = (0..6).map(f64::from).collect();
        let x = tape
            .leaf(
                Level(1),
                Value::from(Tensor::new(Shape::from_dims(&[2, 3]), data).expect("tensor")),
            )
            .expect("leaf");
        let weights = Value::from(
            Tensor::new(Shape::from_dims(&[3, 2]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
                .expect("tensor"),
        );
        let y = x
            .transpose(&[1, 0])
            .and_then(|t| t.mul(&weights))
            .and_then(|v| v.sum())
            .expect("forward");
        let grads = tape.backward(Level(1), &y, &[x]).expect("backward");
        assert_eq!(grads[0].shape(), Shape::from_dims(&[2, 3]));
        assert_eq!(
            grads[0].to_f64_vec(),
            Some(vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0])
        );
    }

    #[test]
    fn custom_vjp_node_routes_cotangents() {
        let tape = Tape::new();
        let x = tape.leaf(Level(1), Value::scalar(4.0)).expect("leaf");
        let vjp: VjpFn = Rc::new(|cts: &[Value]| Ok(vec![cts[0].scale(10.0)?]));
        let outputs = attach_custom_vjp(&tape, Level(1), &[x.clone()], vec![Value::scalar(1.0)], vjp)
            .expect("attach");
        let grads = tape.backward(Level(1), &outputs[0], &[x]).expect("backward");
        assert_eq!(grads[0].as_f64_scalar(), Some(10.0));
    }
}
