// Marlais Runtime Context
//
// The explicitly constructed runtime instance: symbol table, module table,
// object system and configuration. Separate contexts share nothing.

use crate::clos::{Linearization, Method, MethodBody, ParamList};
use crate::conditions::RuntimeError;
use crate::environment::Environment;
use crate::eval::{EvalResult, Interpreter, SpecialForms};
use crate::module::{ModuleId, ModuleTable, UseOptions};
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::{Arity, Primitive, Value};
use std::rc::Rc;

/// Type for primitive functions
pub type PrimitiveFn = fn(&mut Interpreter<'_>, &[Value]) -> EvalResult;

/// Runtime limits and algorithm choices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Non-tail nesting allowed before StackExhaustedError
    pub max_depth: usize,
    pub linearization: Linearization,
    /// Stack size in bytes of the thread the REPL evaluates on
    pub stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_depth: 4096,
            linearization: Linearization::Clos,
            stack_size: 256 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by MARLAIS_MAX_DEPTH, MARLAIS_LINEARIZATION and
    /// MARLAIS_STACK_SIZE. Unparseable values are rejected.
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Self::default();
        if let Some(v) = lookup("MARLAIS_MAX_DEPTH") {
            config.max_depth = v
                .parse()
                .map_err(|_| format!("MARLAIS_MAX_DEPTH: not a number: {}", v))?;
        }
        if let Some(v) = lookup("MARLAIS_LINEARIZATION") {
            config.linearization = v.parse()?;
        }
        if let Some(v) = lookup("MARLAIS_STACK_SIZE") {
            config.stack_size = v
                .parse()
                .map_err(|_| format!("MARLAIS_STACK_SIZE: not a number: {}", v))?;
        }
        Ok(config)
    }
}

pub struct GlobalContext {
    pub symbols: SymbolTable,
    pub special_forms: SpecialForms,
    pub modules: ModuleTable,
    pub mop: crate::clos::MetaObjectProtocol,
    pub config: RuntimeConfig,

    pub dylan_module: ModuleId,
    pub user_module: ModuleId,

    // Cached standard symbols
    pub next_method_sym: SymbolId,
    pub initialize_sym: SymbolId,
    pub rest_marker: SymbolId,
    pub key_marker: SymbolId,
    pub all_keys_marker: SymbolId,
}

impl GlobalContext {
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Build and boot a runtime: bind the built-in classes and primitives in
    /// `dylan` and make `dylan-user` use it.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let mut symbols = SymbolTable::new();
        let special_forms = SpecialForms::new(&mut symbols);
        let mop = crate::clos::MetaObjectProtocol::new(&mut symbols, config.linearization);
        let mut modules = ModuleTable::new();
        let dylan_module = modules.get_or_create(symbols.intern("dylan"));
        let user_module = modules.get_or_create(symbols.intern("dylan-user"));

        let mut ctx = Self {
            next_method_sym: symbols.intern("next-method"),
            initialize_sym: symbols.intern("initialize"),
            rest_marker: symbols.intern("#rest"),
            key_marker: symbols.intern("#key"),
            all_keys_marker: symbols.intern("#all-keys"),
            symbols,
            special_forms,
            modules,
            mop,
            config,
            dylan_module,
            user_module,
        };
        ctx.boot()?;
        Ok(ctx)
    }

    fn boot(&mut self) -> Result<(), RuntimeError> {
        let dylan = self.dylan_module;

        let classes: Vec<(SymbolId, crate::clos::ClassId)> =
            self.mop.classes().map(|c| (c.name, c.id)).collect();
        for (name, id) in classes {
            self.define_exported(dylan, name, Value::Class(id), true)?;
        }

        crate::primitives::register_primitives(self)?;

        // `make` calls `initialize`; the default method does nothing
        let initialize = self
            .mop
            .define_generic(&self.symbols, self.initialize_sym, 1, true, false);
        let object = self.symbols.intern("object");
        let rest = self.symbols.intern("initargs");
        let default_method = Method {
            name: Some(self.initialize_sym),
            specializers: vec![Value::Class(self.mop.builtin.object)],
            params: ParamList {
                required: vec![object],
                rest: Some(rest),
                ..ParamList::default()
            },
            body: MethodBody::Code {
                body: Value::list(vec![Value::Name(self.special_forms.begin), Value::Boolean(false)]),
                env: Environment::module_root(dylan),
            },
        };
        self.mop.add_method(initialize, Rc::new(default_method))?;
        self.define_exported(dylan, self.initialize_sym, Value::Generic(initialize), false)?;

        let user = self.user_module;
        self.modules
            .use_module(&mut self.symbols, user, dylan, &UseOptions::default())?;
        Ok(())
    }

    /// Define and export a top-level binding
    pub fn define_exported(
        &mut self,
        module: ModuleId,
        name: SymbolId,
        value: Value,
        constant: bool,
    ) -> Result<(), RuntimeError> {
        if self.modules.is_constant_definition(module, name) {
            return Err(RuntimeError::ConstantBinding(self.name(name)));
        }
        self.modules.define(module, name, value, constant)?;
        self.modules.export(module, name)
    }

    /// Bind a host function as a constant exported from `module`
    pub fn register_primitive(
        &mut self,
        module: ModuleId,
        name: &str,
        arity: Arity,
        func: PrimitiveFn,
    ) -> Result<(), RuntimeError> {
        let sym = self.symbols.intern(name);
        let primitive = Value::Primitive(Rc::new(Primitive {
            name: sym,
            arity,
            func,
        }));
        self.define_exported(module, sym, primitive, true)
    }

    /// Fresh outermost environment of a module
    pub fn module_env(&self, module: ModuleId) -> Environment {
        Environment::module_root(module)
    }

    pub fn name(&self, sym: SymbolId) -> String {
        self.symbols.name_or_placeholder(sym)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_lookup() {
        let config = RuntimeConfig::from_lookup(|key| match key {
            "MARLAIS_MAX_DEPTH" => Some("100".into()),
            "MARLAIS_LINEARIZATION" => Some("local".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.max_depth, 100);
        assert_eq!(config.linearization, Linearization::LocalPrecedence);
        assert_eq!(config.stack_size, RuntimeConfig::default().stack_size);

        assert!(RuntimeConfig::from_lookup(|_| Some("lots".into())).is_err());
    }

    #[test]
    fn test_boot_binds_classes_and_primitives() {
        let ctx = GlobalContext::new().unwrap();
        let integer = ctx.symbols.find("<integer>").unwrap();
        let binding = ctx.modules.lookup(ctx.user_module, integer).unwrap();
        assert_eq!(binding.get(), Value::Class(ctx.mop.builtin.integer));
        assert!(binding.is_constant());

        let plus = ctx.symbols.find("+").unwrap();
        assert!(matches!(
            ctx.modules.lookup(ctx.user_module, plus).map(|b| b.get()),
            Some(Value::Primitive(_))
        ));
        assert!(matches!(
            ctx.modules.lookup(ctx.user_module, ctx.initialize_sym).map(|b| b.get()),
            Some(Value::Generic(_))
        ));
    }

    #[test]
    fn test_primitive_registration_reports_conflicts() {
        let mut ctx = GlobalContext::new().unwrap();
        let dylan = ctx.dylan_module;
        let err = ctx
            .register_primitive(dylan, "+", Arity::exactly(2), |_, _| Ok(Value::Integer(0)))
            .unwrap_err();
        assert_eq!(err, RuntimeError::ConstantBinding("+".into()));
        let plus = ctx.symbols.find("+").unwrap();
        assert!(matches!(
            ctx.modules.lookup(dylan, plus).map(|b| b.get()),
            Some(Value::Primitive(p)) if p.arity != Arity::exactly(2)
        ));
    }

    #[test]
    fn test_contexts_are_isolated() {
        let mut a = GlobalContext::new().unwrap();
        let b = GlobalContext::new().unwrap();
        let sym = a.symbols.intern("only-in-a");
        let user = a.user_module;
        a.define_exported(user, sym, Value::Integer(1), false).unwrap();
        assert!(b.symbols.find("only-in-a").is_none());
    }
}
