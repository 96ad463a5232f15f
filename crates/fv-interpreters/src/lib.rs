#![forbid(unsafe_code)]

//! The interpreter stack: which functional transforms are active, in what
//! order, and at which level.

pub mod stack;

use fv_core::Level;
use serde::{Deserialize, Serialize};

pub use stack::{Interpreter, InterpreterStack, Layer, LayerTag, PushedLayer, SuspendedLayer};

pub const MAX_DEPTH_ENV: &str = "FV_MAX_TRANSFORM_DEPTH";
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Pushing past this many active layers fails instead of recursing on.
    pub max_depth: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl InterpreterConfig {
    /// Defaults, with `FV_MAX_TRANSFORM_DEPTH` taking precedence when it holds
    /// a positive integer.
    #[must_use]
    pub fn from_env() -> Self {
        if let Ok(raw) = std::env::var(MAX_DEPTH_ENV)
            && let Ok(parsed) = raw.parse::<usize>()
            && parsed > 0
        {
            return Self { max_depth: parsed };
        }
        Self::default()
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    Empty,
    DepthExceeded { max_depth: usize },
    OutOfOrderRestore { level: Level, top: Level },
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "interpreter stack is empty"),
            Self::DepthExceeded { max_depth } => {
                write!(f, "interpreter stack exceeded max depth {}", max_depth)
            }
            Self::OutOfOrderRestore { level, top } => write!(
                f,
                "cannot restore layer {} above current top {}",
                level, top
            ),
        }
    }
}

impl std::error::Error for StackError {}
