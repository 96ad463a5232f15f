#![forbid(unsafe_code)]

pub mod errors;
pub mod transforms;

pub use errors::ApiError;
pub use transforms::{Function, GradAndValueWrapped, GradWrapped, Summed, VmapWrapped};
pub use transforms::{grad, grad_and_value, vmap};

pub use fv_interpreters::{Interpreter, InterpreterConfig};
pub use fv_trace::Value;
