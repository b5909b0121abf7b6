// Marlais: Dylan-style object runtime
// Modules, CLOS-style classes, multiple dispatch and a tail-calling evaluator.

pub mod types;
pub mod symbol;
pub mod environment;
pub mod module;
pub mod clos;
pub mod slots;
pub mod dispatch;
pub mod conditions;
pub mod context;
pub mod process;
pub mod eval;
pub mod definitions;
pub mod primitives;
pub mod reader;
pub mod printer;

pub use conditions::{Condition, ConditionKind, RuntimeError};
pub use context::{GlobalContext, RuntimeConfig};
pub use eval::{ControlSignal, EvalResult, Interpreter};
pub use process::Process;
pub use types::Value;
