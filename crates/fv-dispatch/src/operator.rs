#![forbid(unsafe_code)]

use fv_core::TransformKind;
use fv_interpreters::Interpreter;

use crate::DispatchError;

/// A rule receives the operator itself so it can re-dispatch one level down.
pub type Rule<Call, Out> =
    fn(&TransformableOperator<Call, Out>, &Interpreter, &Call) -> Result<Out, DispatchError>;

/// A named operator with at most one rule per [`TransformKind`].
pub struct TransformableOperator<Call, Out> {
    name: &'static str,
    rules: [Option<Rule<Call, Out>>; TransformKind::COUNT],
}

impl<Call, Out> TransformableOperator<Call, Out> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            rules: [None; TransformKind::COUNT],
        }
    }

    /// Builder form of [`register`](Self::register) for `static` operators.
    /// A later rule for the same kind replaces the earlier one.
    #[must_use]
    pub const fn with_rule(mut self, kind: TransformKind, rule: Rule<Call, Out>) -> Self {
        self.rules[kind.index()] = Some(rule);
        self
    }

    pub fn register(
        &mut self,
        kind: TransformKind,
        rule: Rule<Call, Out>,
    ) -> Result<(), DispatchError> {
        let slot = &mut self.rules[kind.index()];
        if slot.is_some() {
            return Err(DispatchError::DuplicateRule {
                operator: self.name,
                kind,
            });
        }
        *slot = Some(rule);
        Ok(())
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn has_rule(&self, kind: TransformKind) -> bool {
        self.rules[kind.index()].is_some()
    }

    /// Run the rule for the transform on top of `interp`, or the plain rule
    /// when no transform is active.
    pub fn dispatch(&self, interp: &Interpreter, call: &Call) -> Result<Out, DispatchError> {
        let kind = interp.top().map_or(TransformKind::Plain, |(kind, _)| kind);
        let rule = self.rules[kind.index()].ok_or(DispatchError::UnhandledTransform {
            operator: self.name,
            kind,
        })?;
        tracing::debug!(operator = self.name, %kind, depth = interp.depth(), "dispatch");
        rule(self, interp, call)
    }
}

impl<Call, Out> std::fmt::Debug for TransformableOperator<Call, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<TransformKind> = TransformKind::ALL
            .into_iter()
            .filter(|kind| self.has_rule(*kind))
            .collect();
        f.debug_struct("TransformableOperator")
            .field("name", &self.name)
            .field("rules", &registered)
            .finish()
    }
}
