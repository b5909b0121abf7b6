// Marlais Process State
//
// Per-evaluation state: the diagnostic eval stack, the nesting depth used for
// stack exhaustion, the handler stack and the module top-level forms are
// evaluated in. Value-count adjustment happens at the call site through
// `ValueCount::adjust`.

use crate::conditions::ConditionSystem;
use crate::module::ModuleId;
use crate::types::Value;

/// One call-context record, kept for backtraces only
#[derive(Debug, Clone)]
pub struct StackRecord {
    pub expr: Value,
}

/// How many values a call site wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCount {
    pub required: usize,
    /// Keep values beyond `required`
    pub rest: bool,
}

impl ValueCount {
    pub fn exactly(required: usize) -> Self {
        Self {
            required,
            rest: false,
        }
    }

    /// Pad with the unspecified marker, truncate unless `rest`
    pub fn adjust(&self, mut values: Vec<Value>) -> Vec<Value> {
        if values.len() < self.required {
            values.resize(self.required, Value::Unspecified);
        } else if !self.rest {
            values.truncate(self.required);
        }
        values
    }
}

pub struct Process {
    pub eval_stack: Vec<StackRecord>,
    /// Non-tail nesting depth
    pub depth: usize,
    pub conditions: ConditionSystem,
    /// Module that top-level forms are evaluated in
    pub current_module: ModuleId,
    /// Eval stack captured where the last error was raised
    pub last_backtrace: Vec<Value>,
    next_tag: u64,
}

impl Process {
    pub fn new(current_module: ModuleId) -> Self {
        Self {
            eval_stack: Vec::new(),
            depth: 0,
            conditions: ConditionSystem::new(),
            current_module,
            last_backtrace: Vec::new(),
            next_tag: 0,
        }
    }

    /// Fresh identity for an exit procedure
    pub fn fresh_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    /// Snapshot the eval stack, innermost first. The first snapshot after a
    /// reset wins, so it shows where the error was raised.
    pub fn capture_backtrace(&mut self) {
        if self.last_backtrace.is_empty() {
            self.last_backtrace = self.eval_stack.iter().rev().map(|r| r.expr.clone()).collect();
        }
    }

    /// Forget per-form state before the next top-level form
    pub fn reset(&mut self) {
        self.eval_stack.clear();
        self.conditions.truncate(0);
        self.last_backtrace.clear();
        self.depth = 0;
    }
}
