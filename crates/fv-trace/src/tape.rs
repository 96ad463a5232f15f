#![forbid(unsafe_code)]

//! Per-level reverse-mode tape.
//!
//! Each grad level owns one tape. Records are appended in evaluation order
//! and replayed in reverse by [`Tape::backward`]. Vjp closures are written in
//! terms of [`Value`] operations on lower-level primals, so a backward pass at
//! level `L` is itself recorded on the tapes below `L`.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::rc::Rc;

use fv_core::{Level, Shape, Tensor};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::grad::unwrap_for_grad;
use crate::value::{GradTracer, Value};
use crate::TraceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub u32);

/// Maps cotangents of a record's outputs to cotangents of its inputs.
pub type VjpFn = Rc<dyn Fn(&[Value]) -> Result<Vec<Value>, TraceError>>;

struct Record {
    inputs: SmallVec<[Option<VarId>; 2]>,
    outputs: SmallVec<[(VarId, Shape); 2]>,
    vjp: VjpFn,
}

#[derive(Default)]
struct TapeState {
    records: Vec<Rc<Record>>,
    next_var: u32,
}

#[derive(Clone, Default)]
pub struct Tape {
    state: Rc<RefCell<TapeState>>,
}

impl std::fmt::Debug for Tape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tape")
            .field("records", &self.record_count())
            .finish()
    }
}

fn check_order(wrapper: Level, inner: &Value) -> Result<(), TraceError> {
    match inner.level() {
        Some(level) if level >= wrapper => Err(TraceError::LevelOrder {
            wrapper,
            inner: level,
        }),
        _ => Ok(()),
    }
}

impl Tape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.state.borrow().records.len()
    }

    #[must_use]
    pub fn same_tape(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    fn fresh_var(&self) -> VarId {
        let mut state = self.state.borrow_mut();
        let var = VarId(state.next_var);
        state.next_var += 1;
        var
    }

    /// Start tracking `primal` as a differentiation input at `level`.
    pub fn leaf(&self, level: Level, primal: Value) -> Result<Value, TraceError> {
        check_order(level, &primal)?;
        Ok(Value::Grad(Rc::new(GradTracer {
            level,
            primal,
            var: self.fresh_var(),
            tape: self.clone(),
        })))
    }

    /// Append a record whose outputs are `output_primals`; returns them wrapped
    /// as level-`level` tracers in the same order.
    pub(crate) fn record(
        &self,
        level: Level,
        inputs: SmallVec<[Option<VarId>; 2]>,
        output_primals: Vec<Value>,
        vjp: VjpFn,
    ) -> Result<Vec<Value>, TraceError> {
        let mut outputs = SmallVec::with_capacity(output_primals.len());
        let mut wrapped = Vec::with_capacity(output_primals.len());
        for primal in output_primals {
            check_order(level, &primal)?;
            let var = self.fresh_var();
            outputs.push((var, primal.shape()));
            wrapped.push(Value::Grad(Rc::new(GradTracer {
                level,
                primal,
                var,
                tape: self.clone(),
            })));
        }
        self.state.borrow_mut().records.push(Rc::new(Record {
            inputs,
            outputs,
            vjp,
        }));
        Ok(wrapped)
    }

    /// Drop every record. Breaks reference cycles between records and the
    /// residuals their vjp closures hold.
    pub fn clear(&self) {
        self.state.borrow_mut().records.clear();
    }

    /// Cotangents of `output` (a scalar at `level`) with respect to each of
    /// `wrt`. Inputs `output` does not depend on get zeros.
    pub fn backward(
        &self,
        level: Level,
        output: &Value,
        wrt: &[Value],
    ) -> Result<Vec<Value>, TraceError> {
        let mut cotangents: FxHashMap<VarId, Value> = FxHashMap::default();
        if let Some(var) = var_at(output, level, self) {
            let seed = unwrap_for_grad(output, level).ones_like()?;
            cotangents.insert(var, seed);
        }

        // Replay a snapshot: vjp closures may append records to lower tapes,
        // and must not observe a live borrow of this one.
        let records = self.state.borrow().records.clone();
        tracing::trace!(%level, records = records.len(), "tape backward");

        for record in records.iter().rev() {
            let mut any = false;
            let mut output_cts = Vec::with_capacity(record.outputs.len());
            for (var, shape) in &record.outputs {
                match cotangents.remove(var) {
                    Some(ct) => {
                        any = true;
                        output_cts.push(ct);
                    }
                    None => output_cts.push(Value::Tensor(Tensor::zeros(shape.clone())?)),
                }
            }
            if !any {
                continue;
            }

            let input_cts = (record.vjp)(&output_cts)?;
            if input_cts.len() != record.inputs.len() {
                return Err(TraceError::CotangentArity {
                    expected: record.inputs.len(),
                    actual: input_cts.len(),
                });
            }
            for (input, ct) in record.inputs.iter().zip(input_cts) {
                let Some(var) = input else { continue };
                match cotangents.entry(*var) {
                    Entry::Occupied(mut slot) => {
                        let total = slot.get().add(&ct)?;
                        slot.insert(total);
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(ct);
                    }
                }
            }
        }

        wrt.iter()
            .map(|input| {
                match var_at(input, level, self).and_then(|var| cotangents.get(&var)) {
                    Some(ct) => Ok(ct.clone()),
                    None => unwrap_for_grad(input, level).zeros_like(),
                }
            })
            .collect()
    }
}

pub(crate) fn var_at(value: &Value, level: Level, tape: &Tape) -> Option<VarId> {
    match value {
        Value::Grad(tracer) if tracer.level == level && tracer.tape.same_tape(tape) => {
            Some(tracer.var)
        }
        _ => None,
    }
}
