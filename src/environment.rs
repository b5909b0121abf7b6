// Marlais Environments - lexical frames and bindings
//
// A frame chain always ends in a frame owned by a module; name lookup walks
// the frames outward and then falls through to that module's definitions and
// imports.

use crate::conditions::RuntimeError;
use crate::module::{ModuleId, ModuleTable};
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A named value cell. Shared by reference between a module and its importers.
pub struct Binding {
    pub name: SymbolId,
    value: RefCell<Value>,
    /// Type every stored value must be an instance of
    type_constraint: RefCell<Option<Value>>,
    constant: Cell<bool>,
    exported: Cell<bool>,
}

impl Binding {
    pub fn new(name: SymbolId, value: Value, constant: bool) -> Self {
        Self {
            name,
            value: RefCell::new(value),
            type_constraint: RefCell::new(None),
            constant: Cell::new(constant),
            exported: Cell::new(false),
        }
    }

    pub fn typed(name: SymbolId, value: Value, type_constraint: Option<Value>, constant: bool) -> Self {
        let binding = Self::new(name, value, constant);
        *binding.type_constraint.borrow_mut() = type_constraint;
        binding
    }

    /// A declared name with no value yet
    pub fn unbound(name: SymbolId) -> Self {
        Self::new(name, Value::Uninitialized, false)
    }

    pub fn get(&self) -> Value {
        self.value.borrow().clone()
    }

    pub fn is_bound(&self) -> bool {
        !matches!(*self.value.borrow(), Value::Uninitialized)
    }

    /// Store without any checks (definitions)
    pub fn set(&self, value: Value) {
        *self.value.borrow_mut() = value;
    }

    pub fn type_constraint(&self) -> Option<Value> {
        self.type_constraint.borrow().clone()
    }

    pub fn set_type_constraint(&self, type_constraint: Option<Value>) {
        *self.type_constraint.borrow_mut() = type_constraint;
    }

    pub fn is_constant(&self) -> bool {
        self.constant.get()
    }

    pub fn set_constant(&self, constant: bool) {
        self.constant.set(constant);
    }

    pub fn is_exported(&self) -> bool {
        self.exported.get()
    }

    pub fn set_exported(&self, exported: bool) {
        self.exported.set(exported);
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("value", &*self.value.borrow())
            .field("constant", &self.constant.get())
            .finish()
    }
}

/// What introduced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOwner {
    Module(ModuleId),
    Method,
    Local,
    Let,
    Block,
}

pub struct Frame {
    owner: FrameOwner,
    module: ModuleId,
    bindings: RefCell<HashMap<SymbolId, Rc<Binding>>>,
    parent: Option<Rc<Frame>>,
}

/// Handle on the innermost frame of a lexical environment
#[derive(Clone)]
pub struct Environment {
    frame: Rc<Frame>,
}

impl Environment {
    /// The outermost frame of a chain, owned by `module`
    pub fn module_root(module: ModuleId) -> Self {
        Self {
            frame: Rc::new(Frame {
                owner: FrameOwner::Module(module),
                module,
                bindings: RefCell::new(HashMap::new()),
                parent: None,
            }),
        }
    }

    /// New empty frame enclosed by this one
    pub fn push_scope(&self, owner: FrameOwner) -> Self {
        Self {
            frame: Rc::new(Frame {
                owner,
                module: self.frame.module,
                bindings: RefCell::new(HashMap::new()),
                parent: Some(self.frame.clone()),
            }),
        }
    }

    /// The enclosing environment; the current frame is dropped with its last handle
    pub fn pop_scope(&self) -> Option<Self> {
        self.frame.parent.clone().map(|frame| Self { frame })
    }

    pub fn module(&self) -> ModuleId {
        self.frame.module
    }

    pub fn owner(&self) -> FrameOwner {
        self.frame.owner
    }

    /// Number of frames in the chain, the module frame included
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut current = self.frame.parent.as_ref();
        while let Some(frame) = current {
            depth += 1;
            current = frame.parent.as_ref();
        }
        depth
    }

    pub fn same_frame(&self, other: &Environment) -> bool {
        Rc::ptr_eq(&self.frame, &other.frame)
    }

    pub fn add_local(&self, name: SymbolId, value: Value, constant: bool) -> Rc<Binding> {
        self.add_binding(Binding::new(name, value, constant))
    }

    pub fn add_binding(&self, binding: Binding) -> Rc<Binding> {
        let binding = Rc::new(binding);
        self.frame
            .bindings
            .borrow_mut()
            .insert(binding.name, binding.clone());
        binding
    }

    pub fn add_locals(&self, locals: impl IntoIterator<Item = (SymbolId, Value)>) {
        let mut bindings = self.frame.bindings.borrow_mut();
        for (name, value) in locals {
            bindings.insert(name, Rc::new(Binding::new(name, value, false)));
        }
    }

    /// Search the lexical frames only
    pub fn lookup_local(&self, name: SymbolId) -> Option<Rc<Binding>> {
        let mut current = Some(&self.frame);
        while let Some(frame) = current {
            if let Some(binding) = frame.bindings.borrow().get(&name) {
                return Some(binding.clone());
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Full resolution: frames outward, then module definitions, then imports
    pub fn lookup(&self, name: SymbolId, modules: &ModuleTable) -> Option<Rc<Binding>> {
        self.lookup_local(name)
            .or_else(|| modules.lookup(self.frame.module, name))
    }

    /// Assign to an existing binding. A constant binding or a value failing the
    /// binding's type constraint leaves the old value in place.
    pub fn modify(
        &self,
        name: SymbolId,
        value: Value,
        modules: &ModuleTable,
        symbols: &SymbolTable,
        type_check: impl FnOnce(&Value, &Value) -> Result<(), RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let binding = self
            .lookup(name, modules)
            .ok_or_else(|| RuntimeError::UnboundVariable(symbols.name_or_placeholder(name)))?;
        if binding.is_constant() {
            return Err(RuntimeError::ConstantBinding(symbols.name_or_placeholder(name)));
        }
        if let Some(ty) = binding.type_constraint() {
            type_check(&value, &ty)?;
        }
        binding.set(value);
        Ok(())
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#<environment {:?} depth {}>",
            self.frame.owner,
            self.depth()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SymbolTable, ModuleTable, Environment) {
        let mut symbols = SymbolTable::new();
        let mut modules = ModuleTable::new();
        let module = modules.get_or_create(symbols.intern("test"));
        (symbols, modules, Environment::module_root(module))
    }

    #[test]
    fn test_shadowing_and_scope_pop() {
        let (mut symbols, modules, root) = setup();
        let x = symbols.intern("x");

        let outer = root.push_scope(FrameOwner::Let);
        outer.add_local(x, Value::Integer(1), false);
        let inner = outer.push_scope(FrameOwner::Let);
        inner.add_local(x, Value::Integer(2), false);

        assert_eq!(inner.lookup(x, &modules).map(|b| b.get()), Some(Value::Integer(2)));
        let popped = inner.pop_scope().unwrap();
        assert!(popped.same_frame(&outer));
        assert_eq!(popped.lookup(x, &modules).map(|b| b.get()), Some(Value::Integer(1)));
        assert!(root.lookup(x, &modules).is_none());
    }

    #[test]
    fn test_modify_constant_keeps_value() {
        let (mut symbols, modules, root) = setup();
        let k = symbols.intern("k");
        let env = root.push_scope(FrameOwner::Let);
        env.add_local(k, Value::Integer(10), true);

        let result = env.modify(k, Value::Integer(11), &modules, &symbols, |_, _| Ok(()));
        assert_eq!(result, Err(RuntimeError::ConstantBinding("k".into())));
        assert_eq!(env.lookup(k, &modules).unwrap().get(), Value::Integer(10));
    }

    #[test]
    fn test_modify_runs_type_check() {
        let (mut symbols, modules, root) = setup();
        let n = symbols.intern("n");
        let env = root.push_scope(FrameOwner::Let);
        env.add_binding(Binding::typed(n, Value::Integer(0), Some(Value::Boolean(true)), false));

        let rejected = env.modify(n, Value::string("no"), &modules, &symbols, |v, _| match v {
            Value::Integer(_) => Ok(()),
            _ => Err(RuntimeError::TypeCheck {
                value: "\"no\"".into(),
                expected: "<integer>".into(),
            }),
        });
        assert!(matches!(rejected, Err(RuntimeError::TypeCheck { .. })));
        assert_eq!(env.lookup(n, &modules).unwrap().get(), Value::Integer(0));

        env.modify(n, Value::Integer(5), &modules, &symbols, |_, _| Ok(()))
            .unwrap();
        assert_eq!(env.lookup(n, &modules).unwrap().get(), Value::Integer(5));
    }

    #[test]
    fn test_add_locals_and_depth() {
        let (mut symbols, modules, root) = setup();
        let a = symbols.intern("a");
        let b = symbols.intern("b");
        let env = root.push_scope(FrameOwner::Method);
        env.add_locals(vec![(a, Value::Integer(1)), (b, Value::Integer(2))]);
        assert_eq!(env.depth(), 2);
        assert_eq!(env.owner(), FrameOwner::Method);
        assert_eq!(env.lookup(b, &modules).unwrap().get(), Value::Integer(2));
        assert!(env.lookup(symbols.intern("c"), &modules).is_none());
    }
}
