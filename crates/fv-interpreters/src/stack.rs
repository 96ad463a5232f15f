#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::rc::Rc;

use fv_core::{Level, TransformKind};
use fv_trace::Tape;

use crate::{InterpreterConfig, StackError};

/// Per-layer state. The transform kind of a layer is derived from it.
#[derive(Debug, Clone)]
pub enum LayerTag {
    Plain,
    Batch { size: usize },
    Grad(Tape),
}

impl LayerTag {
    #[must_use]
    pub fn kind(&self) -> TransformKind {
        match self {
            Self::Plain => TransformKind::Plain,
            Self::Batch { .. } => TransformKind::Batched,
            Self::Grad(_) => TransformKind::Differentiated,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Layer {
    level: Level,
    tag: LayerTag,
}

impl Layer {
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }

    #[must_use]
    pub fn kind(&self) -> TransformKind {
        self.tag.kind()
    }

    #[must_use]
    pub fn tag(&self) -> &LayerTag {
        &self.tag
    }
}

/// Active layers, bottom first. Levels strictly increase towards the top and
/// are never handed out twice.
#[derive(Debug)]
pub struct InterpreterStack {
    layers: Vec<Layer>,
    next_level: u32,
    config: InterpreterConfig,
}

impl Default for InterpreterStack {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

impl InterpreterStack {
    #[must_use]
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            layers: Vec::new(),
            next_level: Level::ROOT.0 + 1,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> InterpreterConfig {
        self.config
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.layers.is_empty()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn top(&self) -> Result<(TransformKind, Level), StackError> {
        self.layers
            .last()
            .map(|layer| (layer.kind(), layer.level))
            .ok_or(StackError::Empty)
    }

    pub fn top_layer(&self) -> Result<&Layer, StackError> {
        self.layers.last().ok_or(StackError::Empty)
    }

    fn check_depth(&self) -> Result<(), StackError> {
        if self.layers.len() >= self.config.max_depth {
            return Err(StackError::DepthExceeded {
                max_depth: self.config.max_depth,
            });
        }
        Ok(())
    }

    pub fn push(&mut self, tag: LayerTag) -> Result<Level, StackError> {
        self.check_depth()?;
        let level = Level(self.next_level);
        self.next_level += 1;
        tracing::trace!(%level, kind = %tag.kind(), depth = self.layers.len() + 1, "push layer");
        self.layers.push(Layer { level, tag });
        Ok(level)
    }

    pub fn pop(&mut self) -> Result<Layer, StackError> {
        let layer = self.layers.pop().ok_or(StackError::Empty)?;
        tracing::trace!(level = %layer.level, kind = %layer.kind(), "pop layer");
        Ok(layer)
    }

    /// Re-push a layer obtained from [`pop`](Self::pop), keeping its level.
    pub fn restore(&mut self, layer: Layer) -> Result<(), StackError> {
        self.check_depth()?;
        if let Some(top) = self.layers.last()
            && top.level >= layer.level
        {
            return Err(StackError::OutOfOrderRestore {
                level: layer.level,
                top: top.level,
            });
        }
        tracing::trace!(level = %layer.level, kind = %layer.kind(), "restore layer");
        self.layers.push(layer);
        Ok(())
    }
}

/// Shared handle to an [`InterpreterStack`]. Clones see the same stack, which
/// lets backward closures re-enter it long after the forward pass returned.
#[derive(Debug, Clone)]
pub struct Interpreter {
    stack: Rc<RefCell<InterpreterStack>>,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl Interpreter {
    /// A fresh stack configured from the environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(InterpreterConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: InterpreterConfig) -> Self {
        Self {
            stack: Rc::new(RefCell::new(InterpreterStack::new(config))),
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stack.borrow().is_active()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.borrow().depth()
    }

    pub fn top(&self) -> Result<(TransformKind, Level), StackError> {
        self.stack.borrow().top()
    }

    pub fn top_layer(&self) -> Result<Layer, StackError> {
        self.stack.borrow().top_layer().cloned()
    }

    pub fn push(&self, tag: LayerTag) -> Result<Level, StackError> {
        self.stack.borrow_mut().push(tag)
    }

    pub fn pop(&self) -> Result<Layer, StackError> {
        self.stack.borrow_mut().pop()
    }

    pub fn restore(&self, layer: Layer) -> Result<(), StackError> {
        self.stack.borrow_mut().restore(layer)
    }

    /// Pop the top layer until the returned guard drops, then put it back.
    pub fn suspend_top(&self) -> Result<SuspendedLayer, StackError> {
        let layer = self.pop()?;
        Ok(SuspendedLayer {
            interpreter: self.clone(),
            layer: Some(layer),
        })
    }

    /// Push a layer until the returned guard drops.
    pub fn enter(&self, tag: LayerTag) -> Result<PushedLayer, StackError> {
        let level = self.push(tag)?;
        Ok(PushedLayer {
            interpreter: self.clone(),
            level,
        })
    }
}

/// A layer taken off the stack by [`Interpreter::suspend_top`]. Dropping the
/// guard restores it, on error paths too.
#[must_use = "the layer is restored as soon as the guard drops"]
#[derive(Debug)]
pub struct SuspendedLayer {
    interpreter: Interpreter,
    layer: Option<Layer>,
}

impl SuspendedLayer {
    #[must_use]
    pub fn level(&self) -> Level {
        self.layer.as_ref().map_or(Level::ROOT, Layer::level)
    }

    #[must_use]
    pub fn tag(&self) -> Option<&LayerTag> {
        self.layer.as_ref().map(Layer::tag)
    }
}

impl Drop for SuspendedLayer {
    fn drop(&mut self) {
        let Some(layer) = self.layer.take() else {
            return;
        };
        let level = layer.level;
        if let Err(err) = self.interpreter.restore(layer) {
            tracing::error!(%level, error = %err, "failed to restore suspended layer");
        }
    }
}

/// A layer pushed by [`Interpreter::enter`]. Dropping the guard pops it.
#[must_use = "the layer is popped as soon as the guard drops"]
#[derive(Debug)]
pub struct PushedLayer {
    interpreter: Interpreter,
    level: Level,
}

impl PushedLayer {
    #[must_use]
    pub fn level(&self) -> Level {
        self.level
    }
}

impl Drop for PushedLayer {
    fn drop(&mut self) {
        match self.interpreter.pop() {
            Ok(layer) if layer.level == self.level => {}
            Ok(layer) => tracing::error!(
                expected = %self.level,
                popped = %layer.level,
                "pushed layer guard popped a foreign layer"
            ),
            Err(err) => tracing::error!(level = %self.level, error = %err, "pushed layer already gone"),
        }
    }
}
