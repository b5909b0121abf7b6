// Marlais Condition System - Conditions and Handlers
//
// Runtime errors are raised as `RuntimeError`, turned into `Condition` objects
// and carried outward as `ControlSignal::Error`. `block` forms with
// `exception` clauses push handler clusters while their body runs.

use crate::clos::ClassId;
use crate::types::Value;
use thiserror::Error;

/// Coarse kind of a condition; selects its class when no user instance is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionKind {
    SimpleError,
    TypeError,
    SimpleWarning,
    SimpleRestart,
    Abort,
}

/// Errors raised by the runtime core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("unbound variable: {0}")]
    UnboundVariable(String),

    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("no applicable method for {generic} with argument classes ({classes})")]
    NoApplicableMethod { generic: String, classes: String },

    #[error("cannot modify constant binding {0}")]
    ConstantBinding(String),

    #[error("type check failed: {value} is not an instance of {expected}")]
    TypeCheck { value: String, expected: String },

    #[error("slot {slot} of {class} is not initialized")]
    SlotNotInitialized { slot: String, class: String },

    #[error("inconsistent precedence among the superclasses of {0}")]
    InconsistentPrecedence(String),

    #[error("wrong number of arguments to {callee}: expected {expected}, got {got}")]
    Arity {
        callee: String,
        expected: String,
        got: usize,
    },

    #[error("stack exhausted: depth limit {0} exceeded")]
    StackExhausted(usize),

    #[error("cannot subclass sealed class {0}")]
    SealedClass(String),

    #[error("cannot instantiate abstract class {0}")]
    AbstractInstantiation(String),

    #[error("missing required init keyword {keyword} for {class}")]
    MissingInitKeyword { keyword: String, class: String },

    #[error("zero values returned in a single-value context")]
    ZeroValues,

    #[error("{0}")]
    Simple(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ConditionKind {
        match self {
            RuntimeError::TypeCheck { .. } => ConditionKind::TypeError,
            _ => ConditionKind::SimpleError,
        }
    }

    /// Fatal errors terminate the REPL instead of returning to the prompt
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::StackExhausted(_))
    }

    pub fn simple(message: impl Into<String>) -> Self {
        RuntimeError::Simple(message.into())
    }
}

/// A signaled condition
#[derive(Debug, Clone)]
pub struct Condition {
    pub kind: ConditionKind,
    pub message: String,
    /// Values involved in the failure (arguments, offending value, ...)
    pub values: Vec<Value>,
    /// The runtime error this condition was raised for, if any
    pub error: Option<RuntimeError>,
    /// A user-made condition instance passed to `signal` or `error`
    pub payload: Option<Value>,
}

impl Condition {
    pub fn new(kind: ConditionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            values: Vec::new(),
            error: None,
            payload: None,
        }
    }

    pub fn from_error(error: RuntimeError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            values: Vec::new(),
            error: Some(error),
            payload: None,
        }
    }

    /// Wrap a user-level condition instance
    pub fn from_instance(instance: Value, kind: ConditionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            values: Vec::new(),
            error: None,
            payload: Some(instance),
        }
    }

    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    /// Errors (as opposed to warnings and restarts) unwind when unhandled
    pub fn is_serious(&self) -> bool {
        matches!(self.kind, ConditionKind::SimpleError | ConditionKind::TypeError)
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ConditionKind::Abort || self.error.as_ref().is_some_and(RuntimeError::is_fatal)
    }
}

/// One `exception` clause of an active `block`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    /// Condition class the clause accepts
    pub class: ClassId,
    /// Tag of the block that installed the clause
    pub tag: u64,
}

/// Stack of handler clusters (one cluster per active `block`)
#[derive(Debug, Default)]
pub struct ConditionSystem {
    handler_stack: Vec<Vec<Handler>>,
}

impl ConditionSystem {
    pub fn new() -> Self {
        Self {
            handler_stack: Vec::new(),
        }
    }

    /// Push a new handler cluster
    pub fn push_handlers(&mut self, handlers: Vec<Handler>) {
        self.handler_stack.push(handlers);
    }

    /// Pop a handler cluster
    pub fn pop_handlers(&mut self) {
        self.handler_stack.pop();
    }

    pub fn depth(&self) -> usize {
        self.handler_stack.len()
    }

    /// Drop every cluster above `depth` (used when a non-local exit unwinds)
    pub fn truncate(&mut self, depth: usize) {
        self.handler_stack.truncate(depth);
    }

    /// Innermost handler whose class is accepted by `accepts`
    pub fn find_handler(&self, mut accepts: impl FnMut(ClassId) -> bool) -> Option<Handler> {
        for cluster in self.handler_stack.iter().rev() {
            for handler in cluster {
                if accepts(handler.class) {
                    return Some(*handler);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = RuntimeError::TypeCheck {
            value: "1".into(),
            expected: "<string>".into(),
        };
        assert_eq!(err.kind(), ConditionKind::TypeError);
        assert_eq!(RuntimeError::ZeroValues.kind(), ConditionKind::SimpleError);
        assert!(RuntimeError::StackExhausted(10).is_fatal());
        assert!(!RuntimeError::UnboundVariable("x".into()).is_fatal());
    }

    #[test]
    fn test_condition_from_error_keeps_message() {
        let cond = Condition::from_error(RuntimeError::UnboundVariable("frob".into()));
        assert_eq!(cond.message, "unbound variable: frob");
        assert!(cond.is_serious());
        assert!(!cond.is_fatal());

        let warning = Condition::new(ConditionKind::SimpleWarning, "careful");
        assert!(!warning.is_serious());
        assert!(Condition::new(ConditionKind::Abort, "stop").is_fatal());
    }

    #[test]
    fn test_nested_handlers() {
        let mut sys = ConditionSystem::new();
        let condition_class = ClassId(10);
        let error_class = ClassId(11);

        sys.push_handlers(vec![Handler { class: condition_class, tag: 1 }]);
        sys.push_handlers(vec![Handler { class: error_class, tag: 2 }]);

        // Inner handler wins when both accept
        let found = sys.find_handler(|_| true);
        assert_eq!(found.map(|h| h.tag), Some(2));

        // Only the outer one accepts
        let found = sys.find_handler(|c| c == condition_class);
        assert_eq!(found.map(|h| h.tag), Some(1));

        sys.pop_handlers();
        assert_eq!(sys.depth(), 1);
        sys.truncate(0);
        assert!(sys.find_handler(|_| true).is_none());
    }
}
