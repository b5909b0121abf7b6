// Marlais Definitions
//
// Defining forms: variables and constants, classes with their slot accessors,
// generic functions, methods and modules.

use crate::clos::{ClassFlags, GenericId, Method, MethodBody, ParamList};
use crate::conditions::RuntimeError;
use crate::environment::Environment;
use crate::eval::{syntax_error, ControlSignal, Interpreter, Step, StepResult};
use crate::module::{ModuleId, NameSet, UseOptions};
use crate::slots::{SlotAllocation, SlotDescriptor, SlotInit};
use crate::symbol::SymbolId;
use crate::types::Value;
use log::debug;
use std::rc::Rc;

impl Interpreter<'_> {
    /// `(define-variable name [init])`, `(define-constant (name type) init)`
    pub(crate) fn step_define_variable(&mut self, args: &Value, env: &Environment, constant: bool) -> StepResult {
        let form = if constant { "define-constant" } else { "define-variable" };
        let forms = self.forms(args, form)?;
        let (target, init) = match forms.as_slice() {
            [target] if !constant => (target, None),
            [target, init] => (target, Some(init)),
            _ => return Err(syntax_error(form, "expected (name init)")),
        };
        let (name, ty) = self.parse_typed_name(target, env)?;
        if self.globals.modules.is_constant_definition(env.module(), name) {
            return Err(RuntimeError::ConstantBinding(self.globals.name(name)).into());
        }
        let value = match init {
            Some(init) => self.eval(init, env)?,
            None => Value::Uninitialized,
        };
        if let (Some(ty), Some(_)) = (&ty, init) {
            self.globals
                .mop
                .check_type(&value, ty)
                .map_err(|e| self.error_with(e, vec![value.clone()]))?;
        }
        self.globals
            .modules
            .define_typed(env.module(), name, value, ty, constant)?;
        Ok(Step::Done(Value::Symbol(name)))
    }

    /// The generic bound to `name`, created when the name is unbound
    fn ensure_generic(
        &mut self,
        module: ModuleId,
        name: SymbolId,
        required: usize,
        rest: bool,
        keys: bool,
    ) -> Result<GenericId, ControlSignal> {
        let binding = self.globals.modules.lookup(module, name);
        match binding.as_ref().map(|b| b.get()) {
            Some(Value::Generic(id)) => Ok(id),
            Some(Value::Uninitialized) | None => {
                let id = self
                    .globals
                    .mop
                    .define_generic(&self.globals.symbols, name, required, rest, keys);
                match binding {
                    Some(binding) => binding.set(Value::Generic(id)),
                    None => {
                        self.globals.modules.define(module, name, Value::Generic(id), false)?;
                    }
                }
                Ok(id)
            }
            Some(other) => Err(self.error_with(
                RuntimeError::simple(format!(
                    "{} is bound to a value that is not a generic function",
                    self.globals.name(name)
                )),
                vec![other],
            )),
        }
    }

    /// `(define-generic name (params))`
    pub(crate) fn step_define_generic(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "define-generic")?;
        let [Value::Name(name), params] = forms.as_slice() else {
            return Err(syntax_error("define-generic", "expected (define-generic name (params))"));
        };
        let (params, _) = self.parse_params(params, env)?;
        let (required, rest, keys) = (params.required.len(), params.rest.is_some(), params.keys.is_some());
        let existed = matches!(
            self.globals.modules.lookup(env.module(), *name).map(|b| b.get()),
            Some(Value::Generic(_))
        );
        let id = self.ensure_generic(env.module(), *name, required, rest, keys)?;
        if existed {
            self.globals.mop.set_generic_signature(id, required, rest, keys)?;
        }
        Ok(Step::Done(Value::Generic(id)))
    }

    /// `(define-method name (params) body...)`; creates the generic if needed
    pub(crate) fn step_define_method(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "define-method")?;
        let [Value::Name(name), params, body @ ..] = forms.as_slice() else {
            return Err(syntax_error("define-method", "expected (define-method name (params) body...)"));
        };
        let method = self.make_method(Some(*name), params, body, env)?;
        let id = self.ensure_generic(
            env.module(),
            *name,
            method.specializers.len(),
            method.params.rest.is_some(),
            method.params.keys.is_some(),
        )?;
        let method = Rc::new(method);
        self.globals.mop.add_method(id, method.clone())?;
        Ok(Step::Done(Value::Method(method)))
    }

    /// `(define-class <name> (supers...) option: value ... (slot name [type] option: value ...) ...)`
    pub(crate) fn step_define_class(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "define-class")?;
        let [Value::Name(name), supers_form, specs @ ..] = forms.as_slice() else {
            return Err(syntax_error("define-class", "expected (define-class name (supers...) ...)"));
        };

        let mut supers = Vec::new();
        for expr in self.forms(supers_form, "define-class")? {
            match self.eval(&expr, env)? {
                Value::Class(class) => supers.push(class),
                other => return Err(self.type_error(other, "<class>")),
            }
        }

        let mut flags = ClassFlags::default();
        let mut slots = Vec::new();
        let mut i = 0;
        while i < specs.len() {
            match &specs[i] {
                Value::Symbol(option) => {
                    let expr = specs
                        .get(i + 1)
                        .ok_or_else(|| syntax_error("define-class", "class option without a value"))?;
                    let on = self.eval(expr, env)?.is_true();
                    match self.globals.name(*option).as_str() {
                        "abstract" => flags.is_abstract = on,
                        "primary" => flags.primary = on,
                        "sealed" => flags.sealed = on,
                        other => {
                            return Err(syntax_error("define-class", &format!("unknown class option {}:", other)))
                        }
                    }
                    i += 2;
                }
                spec @ Value::Pair(_) => {
                    slots.push(self.parse_slot(spec, env)?);
                    i += 1;
                }
                _ => return Err(syntax_error("define-class", "expected a slot spec or class option")),
            }
        }

        let id = self
            .globals
            .mop
            .define_class(&self.globals.symbols, *name, supers, slots, flags)?;
        let class_value = Value::Class(id);
        let own_slots = self
            .globals
            .mop
            .get_class(id)
            .map(|c| c.direct_slots.clone())
            .unwrap_or_default();

        // Class storage is filled once, here
        for slot in own_slots.iter().filter(|s| s.allocation == SlotAllocation::Class) {
            let value = match &slot.init {
                SlotInit::Value(v) => v.clone(),
                SlotInit::Function(thunk) => self.apply(thunk, Vec::new())?,
                SlotInit::None => continue,
            };
            self.globals.mop.store_slot(&class_value, slot, value)?;
        }

        let module = env.module();
        self.globals.modules.define(module, *name, class_value.clone(), true)?;
        self.add_slot_accessors(module, &class_value, &own_slots)?;
        Ok(Step::Done(class_value))
    }

    fn add_slot_accessors(
        &mut self,
        module: ModuleId,
        class_value: &Value,
        slots: &[SlotDescriptor],
    ) -> Result<(), ControlSignal> {
        let Value::Class(owner) = *class_value else {
            return Ok(());
        };
        let object_sym = self.globals.symbols.intern("object");
        let value_sym = self.globals.symbols.intern("new-value");
        let object = Value::Class(self.globals.mop.builtin.object);
        for slot in slots {
            if let Some(getter) = slot.getter {
                let id = self.ensure_generic(module, getter, 1, false, false)?;
                let method = Method {
                    name: Some(getter),
                    specializers: vec![class_value.clone()],
                    params: ParamList {
                        required: vec![object_sym],
                        ..ParamList::default()
                    },
                    body: MethodBody::SlotGetter { owner, slot: slot.name },
                };
                self.globals.mop.add_method(id, Rc::new(method))?;
            }
            if let Some(setter) = slot.setter {
                let id = self.ensure_generic(module, setter, 2, false, false)?;
                let method = Method {
                    name: Some(setter),
                    specializers: vec![object.clone(), class_value.clone()],
                    params: ParamList {
                        required: vec![value_sym, object_sym],
                        ..ParamList::default()
                    },
                    body: MethodBody::SlotSetter { owner, slot: slot.name },
                };
                self.globals.mop.add_method(id, Rc::new(method))?;
            }
        }
        Ok(())
    }

    fn type_error(&self, value: Value, expected: &str) -> ControlSignal {
        let described = self.globals.mop.describe_value(&value);
        self.error_with(
            RuntimeError::TypeCheck {
                value: described,
                expected: expected.to_string(),
            },
            vec![value],
        )
    }

    /// `(slot name [type] init-value: v init-keyword: k: ...)`
    fn parse_slot(&mut self, spec: &Value, env: &Environment) -> Result<SlotDescriptor, ControlSignal> {
        let parts = self.forms(spec, "slot")?;
        let [Value::Name(head), Value::Name(name), options @ ..] = parts.as_slice() else {
            return Err(syntax_error("slot", "expected (slot name options...)"));
        };
        if *head != self.globals.special_forms.slot {
            return Err(syntax_error("define-class", "slot specs start with `slot`"));
        }
        let mut slot = SlotDescriptor::new(*name).with_default_accessors(&mut self.globals.symbols);

        let mut options = options;
        if let Some((first, rest)) = options.split_first() {
            if !matches!(first, Value::Symbol(_)) {
                slot.type_constraint = Some(self.eval_type(first, env)?);
                options = rest;
            }
        }

        for pair in options.chunks(2) {
            let [Value::Symbol(option), value] = pair else {
                return Err(syntax_error("slot", "options must be keyword/value pairs"));
            };
            match self.globals.name(*option).as_str() {
                "init-value" => slot.init = SlotInit::Value(self.eval(value, env)?),
                "init-function" => {
                    let thunk = self.eval(value, env)?;
                    if !thunk.is_callable() {
                        return Err(self.type_error(thunk, "<function>"));
                    }
                    slot.init = SlotInit::Function(thunk);
                }
                "init-keyword" => slot.init_keyword = Some(keyword_literal(value)?),
                "required-init-keyword" => {
                    slot.init_keyword = Some(keyword_literal(value)?);
                    slot.required_init_keyword = true;
                }
                "allocation" => {
                    let kind = value.as_name().or_else(|| value.as_symbol()).map(|s| self.globals.name(s));
                    slot.allocation = match kind.as_deref() {
                        Some("instance") => SlotAllocation::Instance,
                        Some("class") | Some("each-subclass") => SlotAllocation::Class,
                        _ => return Err(syntax_error("slot", "allocation: expects instance or class")),
                    };
                }
                "getter" => slot.getter = accessor_name(value)?,
                "setter" => slot.setter = accessor_name(value)?,
                "type" => slot.type_constraint = Some(self.eval_type(value, env)?),
                other => return Err(syntax_error("slot", &format!("unknown slot option {}:", other))),
            }
        }
        Ok(slot)
    }

    fn eval_type(&mut self, expr: &Value, env: &Environment) -> Result<Value, ControlSignal> {
        let ty = self.eval(expr, env)?;
        if ty.is_type() {
            Ok(ty)
        } else {
            Err(self.type_error(ty, "<type>"))
        }
    }

    /// `(define-module name (use other option: value ...) (export name ...) ...)`
    pub(crate) fn step_define_module(&mut self, args: &Value) -> StepResult {
        let forms = self.forms(args, "define-module")?;
        let [Value::Name(name), clauses @ ..] = forms.as_slice() else {
            return Err(syntax_error("define-module", "expected (define-module name clauses...)"));
        };
        let sf = self.globals.special_forms;
        let module = self.globals.modules.get_or_create(*name);
        for clause in clauses {
            let parts = self.forms(clause, "define-module")?;
            let [Value::Name(kind), rest @ ..] = parts.as_slice() else {
                return Err(syntax_error("define-module", "expected (use ...), (export ...) or (create ...)"));
            };
            if *kind == sf.r#use {
                let [Value::Name(source_name), options @ ..] = rest else {
                    return Err(syntax_error("use", "expected (use module options...)"));
                };
                let source = self.globals.modules.get_or_create(*source_name);
                let options = self.parse_use_options(options)?;
                self.globals
                    .modules
                    .use_module(&mut self.globals.symbols, module, source, &options)?;
            } else if *kind == sf.export || *kind == sf.create {
                for item in rest {
                    let exported = item
                        .as_name()
                        .ok_or_else(|| syntax_error("export", "expected names"))?;
                    self.globals.modules.export(module, exported)?;
                }
            } else {
                return Err(syntax_error("define-module", "unknown clause"));
            }
        }
        debug!("defined module {}", self.globals.name(*name));
        Ok(Step::Done(Value::Module(module)))
    }

    fn parse_use_options(&self, options: &[Value]) -> Result<UseOptions, ControlSignal> {
        let mut result = UseOptions::default();
        for pair in options.chunks(2) {
            let [Value::Symbol(option), value] = pair else {
                return Err(syntax_error("use", "options must be keyword/value pairs"));
            };
            match self.globals.name(*option).as_str() {
                "import" => result.imports = self.name_set(value)?,
                "exclude" => result.exclusions = self.name_list(value)?,
                "prefix" => {
                    let Value::String(prefix) = value else {
                        return Err(syntax_error("use", "prefix: expects a string"));
                    };
                    result.prefix = Some(prefix.borrow().clone());
                }
                "rename" => {
                    let mut renames = Vec::new();
                    for entry in self.forms(value, "rename")? {
                        match self.forms(&entry, "rename")?.as_slice() {
                            [Value::Name(from), Value::Name(to)] => renames.push((*from, *to)),
                            _ => return Err(syntax_error("use", "rename: expects ((from to) ...)")),
                        }
                    }
                    result.renames = renames;
                }
                "export" => result.exports = self.name_set(value)?,
                other => return Err(syntax_error("use", &format!("unknown option {}:", other))),
            }
        }
        Ok(result)
    }

    /// `all` or a list of names
    fn name_set(&self, value: &Value) -> Result<NameSet, ControlSignal> {
        match value {
            Value::Name(name) if self.globals.name(*name) == "all" => Ok(NameSet::All),
            _ => Ok(NameSet::Only(self.name_list(value)?)),
        }
    }

    fn name_list(&self, value: &Value) -> Result<Vec<SymbolId>, ControlSignal> {
        self.forms(value, "use")?
            .iter()
            .map(|v| v.as_name().ok_or_else(|| syntax_error("use", "expected a list of names")))
            .collect()
    }

    /// `(in-module name)`: later top-level forms evaluate in that module
    pub(crate) fn step_in_module(&mut self, args: &Value) -> StepResult {
        let forms = self.forms(args, "in-module")?;
        let [Value::Name(name)] = forms.as_slice() else {
            return Err(syntax_error("in-module", "expected (in-module name)"));
        };
        let module = self.globals.modules.get_or_create(*name);
        self.process.current_module = module;
        Ok(Step::Done(Value::Module(module)))
    }
}

fn keyword_literal(value: &Value) -> Result<SymbolId, ControlSignal> {
    value
        .as_symbol()
        .ok_or_else(|| syntax_error("slot", "init keywords are written name:"))
}

/// `getter: name` or `getter: #f`
fn accessor_name(value: &Value) -> Result<Option<SymbolId>, ControlSignal> {
    match value {
        Value::Name(name) => Ok(Some(*name)),
        Value::Boolean(false) => Ok(None),
        _ => Err(syntax_error("slot", "accessor names must be names or #f")),
    }
}

#[cfg(test)]
mod tests {
    use crate::conditions::RuntimeError;
    use crate::context::GlobalContext;
    use crate::eval::{ControlSignal, EvalResult, Interpreter};
    use crate::process::Process;
    use crate::types::Value;

    fn run(source: &str) -> EvalResult {
        let mut globals = GlobalContext::new().unwrap();
        let mut process = Process::new(globals.user_module);
        Interpreter::new(&mut process, &mut globals).eval_string(source)
    }

    fn error_of(result: EvalResult) -> RuntimeError {
        match result {
            Err(ControlSignal::Error(c)) => c.error.clone().expect("runtime error"),
            _ => panic!("expected an error"),
        }
    }

    #[test]
    fn test_constant_cannot_change() {
        let result = run("(define-constant limit 10) (:= limit 11)");
        assert_eq!(error_of(result), RuntimeError::ConstantBinding("limit".into()));
        assert_eq!(run("(define-constant limit 10) (block () (:= limit 11) (exception <error> #f)) limit").unwrap(),
            Value::Integer(10));
    }

    #[test]
    fn test_constant_cannot_be_redefined() {
        assert_eq!(
            error_of(run("(define-constant k 1) (define-variable k 2)")),
            RuntimeError::ConstantBinding("k".into())
        );
        assert_eq!(
            error_of(run("(define-constant k 1) (define-constant k 2)")),
            RuntimeError::ConstantBinding("k".into())
        );
        assert_eq!(
            run("(define-constant k 1) (block () (define-variable k 2) (exception <error> #f)) k").unwrap(),
            Value::Integer(1)
        );
        // A variable may be redefined, and a class name may be rebound by define-class
        assert_eq!(run("(define-variable v 1) (define-variable v 2) v").unwrap(), Value::Integer(2));
        assert!(run("(define-class <c> (<object>)) (define-class <c> (<object>))").is_ok());
    }

    #[test]
    fn test_typed_variable() {
        assert!(matches!(
            error_of(run("(define-variable (n <integer>) \"x\")")),
            RuntimeError::TypeCheck { .. }
        ));
        assert!(matches!(
            error_of(run("(define-variable (n <integer>) 1) (:= n 'a)")),
            RuntimeError::TypeCheck { .. }
        ));
    }

    #[test]
    fn test_slot_accessors_dispatch() {
        let source = "(define-class <point> (<object>)
                        (slot x init-keyword: x: init-value: 0)
                        (slot y init-keyword: y:))
                      (define-variable p (make <point> y: 5))
                      (:= (x p) 3)
                      (list (x p) (y p))";
        assert_eq!(run(source).unwrap(), Value::list(vec![Value::Integer(3), Value::Integer(5)]));
    }

    #[test]
    fn test_renamed_accessors_and_no_setter() {
        let source = "(define-class <account> (<object>)
                        (slot balance getter: account-balance setter: #f init-value: 100))
                      (account-balance (make <account>))";
        assert_eq!(run(source).unwrap(), Value::Integer(100));
        assert!(matches!(
            error_of(run("(define-class <a> (<object>) (slot b setter: #f)) (b-setter 1 (make <a>))")),
            RuntimeError::UnboundVariable(_)
        ));
    }

    #[test]
    fn test_class_options() {
        assert!(matches!(
            error_of(run("(define-class <shape> (<object>) abstract: #t) (make <shape>)")),
            RuntimeError::AbstractInstantiation(_)
        ));
        assert!(matches!(
            error_of(run("(define-class <leaf> (<object>) sealed: #t) (define-class <sub> (<leaf>))")),
            RuntimeError::SealedClass(_)
        ));
    }

    #[test]
    fn test_define_generic_then_methods() {
        let source = "(define-generic area (shape))
                      (define-method area ((n <integer>)) (* n n))
                      (area 4)";
        assert_eq!(run(source).unwrap(), Value::Integer(16));
        assert!(matches!(
            error_of(run("(define-generic g (a)) (define-method g (a b) a)")),
            RuntimeError::Arity { .. }
        ));
        assert!(run("(define-variable h 1) (define-method h (x) x)").is_err());
    }

    #[test]
    fn test_module_definition_and_use() {
        let source = "(define-module lib (use dylan) (export greet secret-name))
                      (in-module lib)
                      (define-method greet () \"hello\")
                      (define-variable secret-name 'lib)
                      (define-module app (use dylan) (use lib prefix: \"lib/\" exclude: (secret-name)))
                      (in-module app)
                      (lib/greet)";
        assert_eq!(run(source).unwrap(), Value::string("hello"));

        let hidden = "(define-module lib (use dylan) (export a b))
                      (in-module lib)
                      (define-variable a 1)
                      (define-variable b 2)
                      (define-module app (use dylan) (use lib import: (a) exclude: (a)))
                      (in-module app)
                      a";
        assert!(matches!(error_of(run(hidden)), RuntimeError::UnboundVariable(_)));
    }

    #[test]
    fn test_imported_binding_sees_later_assignment() {
        let source = "(define-module lib (use dylan) (export counter bump))
                      (in-module lib)
                      (define-variable counter 0)
                      (define-method bump () (:= counter (+ counter 1)))
                      (define-module app (use dylan) (use lib))
                      (in-module app)
                      (bump)
                      (bump)
                      counter";
        assert_eq!(run(source).unwrap(), Value::Integer(2));
    }
}
