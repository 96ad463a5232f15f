#![forbid(unsafe_code)]

use fv_core::Shape;
use fv_dispatch::DispatchError;
use fv_interpreters::StackError;
use fv_trace::TraceError;

#[derive(Debug)]
pub enum ApiError {
    /// grad needs a function whose output is a scalar.
    GradRequiresScalar {
        shape: Shape,
    },
    BatchAxisOutOfRange {
        axis: usize,
        rank: usize,
    },
    Dispatch(DispatchError),
    Stack(StackError),
    Trace(TraceError),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GradRequiresScalar { shape } => write!(
                f,
                "grad requires a scalar output, got shape {}",
                shape
            ),
            Self::BatchAxisOutOfRange { axis, rank } => write!(
                f,
                "vmap axis {} out of range for rank {}",
                axis, rank
            ),
            Self::Dispatch(err) => write!(f, "dispatch error: {err}"),
            Self::Stack(err) => write!(f, "interpreter stack error: {err}"),
            Self::Trace(err) => write!(f, "trace error: {err}"),
        }
    }
}

impl std::error::Error for ApiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dispatch(err) => Some(err),
            Self::Stack(err) => Some(err),
            Self::Trace(err) => Some(err),
            Self::GradRequiresScalar { .. } | Self::BatchAxisOutOfRange { .. } => None,
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        Self::Dispatch(value)
    }
}

impl From<StackError> for ApiError {
    fn from(value: StackError) -> Self {
        Self::Stack(value)
    }
}

impl From<TraceError> for ApiError {
    fn from(value: TraceError) -> Self {
        Self::Trace(value)
    }
}
