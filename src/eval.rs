// Marlais Evaluator
//
// Expression evaluation, application and the core syntax forms. The inner loop
// is a trampoline: syntax forms and method application hand back `Step::Tail`
// instead of recursing, so an unbounded chain of tail calls runs in one Rust
// frame. Definition forms live in definitions.rs.

use crate::clos::{KeyParam, Method, MethodBody, ParamList};
use crate::conditions::{Condition, Handler, RuntimeError};
use crate::context::GlobalContext;
use crate::environment::{Binding, Environment, FrameOwner};
use crate::process::{Process, StackRecord, ValueCount};
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::{NextMethodState, Value};
use std::rc::Rc;

/// Remaining native stack below which a nested evaluation moves to a new segment
const STACK_RED_ZONE: usize = 128 * 1024;
/// Size of each additional stack segment
const STACK_GROW_SIZE: usize = 4 * 1024 * 1024;

/// Control flow signals for non-local exits
#[derive(Debug, Clone)]
pub enum ControlSignal {
    /// A signaled condition unwinding to its handler
    Error(Rc<Condition>),
    /// Exit procedure of the block with this tag was called
    Exit { tag: u64, value: Value },
}

impl From<RuntimeError> for ControlSignal {
    fn from(error: RuntimeError) -> Self {
        ControlSignal::Error(Rc::new(Condition::from_error(error)))
    }
}

impl ControlSignal {
    pub fn condition(&self) -> Option<&Rc<Condition>> {
        match self {
            ControlSignal::Error(condition) => Some(condition),
            ControlSignal::Exit { .. } => None,
        }
    }
}

/// Result of evaluation
pub type EvalResult = Result<Value, ControlSignal>;

/// Outcome of one trampoline step
pub enum Step {
    Done(Value),
    /// Continue with this expression in place of the current one
    Tail(Value, Environment),
}

pub(crate) type StepResult = Result<Step, ControlSignal>;

/// `(values ...)` packaging: one value stands for itself
pub fn values_from(mut values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.pop().unwrap_or(Value::Unspecified)
    } else {
        Value::values(values)
    }
}

/// First value of a result used in a single-value context
pub fn single_value(value: Value) -> EvalResult {
    match value {
        Value::Values(values) => values
            .first()
            .cloned()
            .ok_or_else(|| RuntimeError::ZeroValues.into()),
        other => Ok(other),
    }
}

pub(crate) fn syntax_error(form: &str, detail: &str) -> ControlSignal {
    RuntimeError::simple(format!("{}: {}", form, detail)).into()
}

pub struct Interpreter<'a> {
    pub process: &'a mut Process,
    pub globals: &'a mut GlobalContext,
}

impl<'a> Interpreter<'a> {
    pub fn new(process: &'a mut Process, globals: &'a mut GlobalContext) -> Self {
        Self { process, globals }
    }

    /// Read and evaluate each top-level form of `source` in the current
    /// module. Returns the result of the last form, multiple values intact.
    pub fn eval_string(&mut self, source: &str) -> EvalResult {
        let forms = crate::reader::read_all(source, &mut self.globals.symbols)
            .map_err(|e| RuntimeError::simple(e.to_string()))?;
        let mut result = Value::Unspecified;
        for form in forms {
            self.process.reset();
            let env = self.globals.module_env(self.process.current_module);
            result = self.eval_values(&form, &env)?;
        }
        Ok(result)
    }

    /// Evaluate in a single-value context
    pub fn eval(&mut self, expr: &Value, env: &Environment) -> EvalResult {
        let value = self.eval_values(expr, env)?;
        single_value(value)
    }

    /// Evaluate, keeping multiple values as a values object
    pub fn eval_values(&mut self, expr: &Value, env: &Environment) -> EvalResult {
        match expr {
            Value::Name(name) => self.lookup_value(*name, env),
            Value::Pair(_) => {
                self.enter()?;
                let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
                    self.run(expr.clone(), env.clone())
                });
                self.process.depth -= 1;
                result
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate wanting `count` values: missing ones are padded with the
    /// unspecified marker, extra ones dropped unless `count.rest`.
    pub fn eval_expecting(
        &mut self,
        expr: &Value,
        env: &Environment,
        count: ValueCount,
    ) -> Result<Vec<Value>, ControlSignal> {
        let values = match self.eval_values(expr, env)? {
            Value::Values(values) => values.to_vec(),
            other => vec![other],
        };
        Ok(count.adjust(values))
    }

    /// Apply a callable to already evaluated arguments
    pub fn apply(&mut self, function: &Value, args: Vec<Value>) -> EvalResult {
        self.enter()?;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            match self.step_apply(function.clone(), args) {
                Ok(Step::Done(value)) => Ok(value),
                Ok(Step::Tail(expr, env)) => self.run(expr, env),
                Err(signal) => Err(signal),
            }
        });
        self.process.depth -= 1;
        result
    }

    /// Wrap a runtime error with the values involved
    pub fn error_with(&self, error: RuntimeError, values: Vec<Value>) -> ControlSignal {
        ControlSignal::Error(Rc::new(Condition::from_error(error).with_values(values)))
    }

    fn enter(&mut self) -> Result<(), ControlSignal> {
        let limit = self.globals.config.max_depth;
        if self.process.depth >= limit {
            return Err(RuntimeError::StackExhausted(limit).into());
        }
        self.process.depth += 1;
        Ok(())
    }

    /// The trampoline. The record pushed here is replaced on every tail call.
    fn run(&mut self, mut expr: Value, mut env: Environment) -> EvalResult {
        let base = self.process.eval_stack.len();
        self.process.eval_stack.push(StackRecord { expr: expr.clone() });
        let result = loop {
            match self.step(&expr, &env) {
                Ok(Step::Done(value)) => break Ok(value),
                Ok(Step::Tail(next, next_env)) => {
                    expr = next;
                    env = next_env;
                    if let Some(record) = self.process.eval_stack.get_mut(base) {
                        record.expr = expr.clone();
                    }
                }
                Err(signal) => {
                    if let ControlSignal::Error(_) = signal {
                        self.process.capture_backtrace();
                    }
                    break Err(signal);
                }
            }
        };
        self.process.eval_stack.truncate(base);
        result
    }

    fn step(&mut self, expr: &Value, env: &Environment) -> StepResult {
        let Value::Pair(pair) = expr else {
            return self.eval_values(expr, env).map(Step::Done);
        };
        let operator = pair.head.borrow().clone();
        let operands = pair.tail.borrow().clone();
        if let Value::Name(op) = operator {
            if let Some(step) = self.special_form(op, &operands, env) {
                return step;
            }
        }
        let function = self.eval(&operator, env)?;
        let operands = self.forms(&operands, "combination")?;
        let mut args = Vec::with_capacity(operands.len());
        for operand in &operands {
            args.push(self.eval(operand, env)?);
        }
        self.step_apply(function, args)
    }

    fn lookup_value(&self, name: SymbolId, env: &Environment) -> EvalResult {
        match env.lookup(name, &self.globals.modules) {
            Some(binding) if binding.is_bound() => Ok(binding.get()),
            _ => Err(self.error_with(
                RuntimeError::UnboundVariable(self.globals.name(name)),
                vec![Value::Symbol(name)],
            )),
        }
    }

    /// Elements of a proper list, or a syntax error naming `form`
    pub(crate) fn forms(&self, list: &Value, form: &str) -> Result<Vec<Value>, ControlSignal> {
        list.list_to_vec()
            .ok_or_else(|| syntax_error(form, "malformed form"))
    }

    // Application

    fn step_apply(&mut self, function: Value, args: Vec<Value>) -> StepResult {
        match &function {
            Value::Primitive(primitive) => {
                if !primitive.arity.accepts(args.len()) {
                    let callee = self.globals.name(primitive.name);
                    return Err(self.arity_error(callee, primitive.arity.required, primitive.arity.rest, args));
                }
                let func = primitive.func;
                func(self, &args).map(Step::Done)
            }
            Value::Generic(id) => {
                let methods = match self.globals.mop.sorted_applicable_methods(*id, &args) {
                    Ok(methods) => methods,
                    Err(e) => return Err(self.error_with(e, args)),
                };
                self.invoke_methods(methods, 0, args.into())
            }
            Value::Method(method) => {
                let method = method.clone();
                self.check_method_call(&method, &args)?;
                self.apply_method(&method, &args, Value::Boolean(false))
            }
            Value::NextMethod(state) => {
                let args: Rc<[Value]> = if args.is_empty() {
                    state.args.clone()
                } else {
                    args.into()
                };
                self.invoke_methods(state.methods.clone(), state.index, args)
            }
            Value::Exit(tag) => Err(ControlSignal::Exit {
                tag: *tag,
                value: values_from(args),
            }),
            _ => {
                let described = self.globals.mop.describe_value(&function);
                Err(self.error_with(RuntimeError::NotApplicable(described), vec![function.clone()]))
            }
        }
    }

    fn arity_error(&self, callee: String, required: usize, rest: bool, args: Vec<Value>) -> ControlSignal {
        let expected = if rest {
            format!("at least {}", required)
        } else {
            required.to_string()
        };
        let got = args.len();
        self.error_with(RuntimeError::Arity { callee, expected, got }, args)
    }

    fn method_name(&self, method: &Method) -> String {
        method
            .name
            .map(|n| self.globals.name(n))
            .unwrap_or_else(|| "method".to_string())
    }

    /// Arity and specializer check for a method called directly
    fn check_method_call(&self, method: &Method, args: &[Value]) -> Result<(), ControlSignal> {
        let required = method.specializers.len();
        let optionals = method.params.accepts_optionals();
        if args.len() < required || (args.len() > required && !optionals) {
            return Err(self.arity_error(self.method_name(method), required, optionals, args.to_vec()));
        }
        for (spec, arg) in method.specializers.iter().zip(args) {
            self.globals
                .mop
                .check_type(arg, spec)
                .map_err(|e| self.error_with(e, args.to_vec()))?;
        }
        Ok(())
    }

    /// Run `methods[index]` with `next-method` bound to the rest of the chain
    fn invoke_methods(&mut self, methods: Rc<[Rc<Method>]>, index: usize, args: Rc<[Value]>) -> StepResult {
        let Some(method) = methods.get(index).cloned() else {
            return Err(RuntimeError::simple("next-method: no next method").into());
        };
        let next = if index + 1 < methods.len() {
            Value::NextMethod(Rc::new(NextMethodState {
                methods: methods.clone(),
                index: index + 1,
                args: args.clone(),
            }))
        } else {
            Value::Boolean(false)
        };
        self.apply_method(&method, &args, next)
    }

    fn apply_method(&mut self, method: &Rc<Method>, args: &[Value], next: Value) -> StepResult {
        match &method.body {
            MethodBody::SlotGetter { owner, slot } => {
                let object = args.first().cloned().unwrap_or(Value::Unspecified);
                let value = self
                    .globals
                    .mop
                    .slot_value(&self.globals.symbols, &object, *owner, *slot)
                    .map_err(|e| self.error_with(e, vec![object.clone()]))?;
                Ok(Step::Done(value))
            }
            MethodBody::SlotSetter { owner, slot } => {
                let [value, object, ..] = args else {
                    return Err(self.arity_error(self.method_name(method), 2, false, args.to_vec()));
                };
                self.globals
                    .mop
                    .set_slot_value(&self.globals.symbols, object, *owner, *slot, value.clone())
                    .map_err(|e| self.error_with(e, vec![value.clone(), object.clone()]))?;
                Ok(Step::Done(value.clone()))
            }
            MethodBody::Code { body, env } => {
                let frame = env.push_scope(FrameOwner::Method);
                frame.add_local(self.globals.next_method_sym, next, true);
                self.bind_parameters(method, args, &frame)?;
                Ok(Step::Tail(body.clone(), frame))
            }
        }
    }

    fn bind_parameters(&mut self, method: &Method, args: &[Value], frame: &Environment) -> Result<(), ControlSignal> {
        let params = &method.params;
        let object = self.globals.mop.builtin.object;
        for (i, name) in params.required.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or(Value::Unspecified);
            let constraint = method
                .specializers
                .get(i)
                .filter(|spec| !matches!(spec, Value::Class(c) if *c == object))
                .cloned();
            frame.add_binding(Binding::typed(*name, value, constraint, false));
        }

        let optionals = args.get(params.required.len()..).unwrap_or(&[]);
        if let Some(rest) = params.rest {
            frame.add_local(rest, Value::list(optionals.to_vec()), false);
        }
        if let Some(keys) = &params.keys {
            if optionals.len() % 2 != 0 {
                return Err(self.error_with(
                    RuntimeError::simple(format!(
                        "{}: keyword arguments must come in pairs",
                        self.method_name(method)
                    )),
                    optionals.to_vec(),
                ));
            }
            for key in keys {
                let supplied = optionals
                    .chunks(2)
                    .find(|pair| pair[0].as_symbol() == Some(key.keyword))
                    .map(|pair| pair[1].clone());
                let value = match (supplied, &key.default) {
                    (Some(value), _) => value,
                    (None, Some(default)) => self.eval(default, frame)?,
                    (None, None) => Value::Boolean(false),
                };
                frame.add_local(key.var, value, false);
            }
        }
        Ok(())
    }

    // Syntax forms

    fn special_form(&mut self, op: SymbolId, args: &Value, env: &Environment) -> Option<StepResult> {
        let sf = self.globals.special_forms;
        let step = if op == sf.quote {
            self.step_quote(args)
        } else if op == sf.begin {
            self.forms(args, "begin").and_then(|forms| self.step_body(&forms, env))
        } else if op == sf.r#if {
            self.step_if(args, env)
        } else if op == sf.when {
            self.step_when(args, env, true)
        } else if op == sf.unless {
            self.step_when(args, env, false)
        } else if op == sf.cond {
            self.step_cond(args, env)
        } else if op == sf.and {
            self.step_and(args, env)
        } else if op == sf.or {
            self.step_or(args, env)
        } else if op == sf.r#while {
            self.step_while(args, env)
        } else if op == sf.r#let {
            self.step_let(args, env)
        } else if op == sf.bind_values {
            self.step_bind_values(args, env)
        } else if op == sf.local {
            self.step_local(args, env)
        } else if op == sf.method {
            self.step_method(args, env)
        } else if op == sf.assign || op == sf.set {
            self.step_assign(args, env)
        } else if op == sf.block {
            self.step_block(args, env)
        } else if op == sf.define_variable || op == sf.define {
            self.step_define_variable(args, env, false)
        } else if op == sf.define_constant {
            self.step_define_variable(args, env, true)
        } else if op == sf.define_class {
            self.step_define_class(args, env)
        } else if op == sf.define_generic {
            self.step_define_generic(args, env)
        } else if op == sf.define_method {
            self.step_define_method(args, env)
        } else if op == sf.define_module {
            self.step_define_module(args)
        } else if op == sf.in_module {
            self.step_in_module(args)
        } else {
            return None;
        };
        Some(step)
    }

    fn step_quote(&mut self, args: &Value) -> StepResult {
        match self.forms(args, "quote")?.as_slice() {
            [datum] => Ok(Step::Done(datum.clone())),
            _ => Err(syntax_error("quote", "expected exactly one datum")),
        }
    }

    /// Body in tail position: all but the last form for effect
    fn step_body(&mut self, forms: &[Value], env: &Environment) -> StepResult {
        match forms.split_last() {
            None => Ok(Step::Done(Value::Boolean(false))),
            Some((last, init)) => {
                for form in init {
                    self.eval_values(form, env)?;
                }
                Ok(Step::Tail(last.clone(), env.clone()))
            }
        }
    }

    /// Body whose result is needed here, not in tail position
    pub(crate) fn eval_body(&mut self, forms: &[Value], env: &Environment) -> EvalResult {
        match self.step_body(forms, env)? {
            Step::Done(value) => Ok(value),
            Step::Tail(expr, env) => self.eval_values(&expr, &env),
        }
    }

    fn step_if(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "if")?;
        let (test, then, otherwise) = match forms.as_slice() {
            [test, then] => (test, then, None),
            [test, then, otherwise] => (test, then, Some(otherwise)),
            _ => return Err(syntax_error("if", "expected (if test then [else])")),
        };
        if self.eval(test, env)?.is_true() {
            Ok(Step::Tail(then.clone(), env.clone()))
        } else if let Some(otherwise) = otherwise {
            Ok(Step::Tail(otherwise.clone(), env.clone()))
        } else {
            Ok(Step::Done(Value::Boolean(false)))
        }
    }

    fn step_when(&mut self, args: &Value, env: &Environment, when: bool) -> StepResult {
        let forms = self.forms(args, if when { "when" } else { "unless" })?;
        let Some((test, body)) = forms.split_first() else {
            return Err(syntax_error("when", "missing test"));
        };
        if self.eval(test, env)?.is_true() == when {
            self.step_body(body, env)
        } else {
            Ok(Step::Done(Value::Boolean(false)))
        }
    }

    fn step_cond(&mut self, args: &Value, env: &Environment) -> StepResult {
        let else_sym = self.globals.special_forms.r#else;
        for clause in self.forms(args, "cond")? {
            let clause = self.forms(&clause, "cond")?;
            let Some((test, body)) = clause.split_first() else {
                return Err(syntax_error("cond", "empty clause"));
            };
            let value = match test {
                Value::Name(name) if *name == else_sym => Value::Boolean(true),
                _ => self.eval(test, env)?,
            };
            if value.is_true() {
                if body.is_empty() {
                    return Ok(Step::Done(value));
                }
                return self.step_body(body, env);
            }
        }
        Ok(Step::Done(Value::Boolean(false)))
    }

    fn step_and(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "and")?;
        let Some((last, init)) = forms.split_last() else {
            return Ok(Step::Done(Value::Boolean(true)));
        };
        for form in init {
            if !self.eval(form, env)?.is_true() {
                return Ok(Step::Done(Value::Boolean(false)));
            }
        }
        Ok(Step::Tail(last.clone(), env.clone()))
    }

    fn step_or(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "or")?;
        let Some((last, init)) = forms.split_last() else {
            return Ok(Step::Done(Value::Boolean(false)));
        };
        for form in init {
            let value = self.eval(form, env)?;
            if value.is_true() {
                return Ok(Step::Done(value));
            }
        }
        Ok(Step::Tail(last.clone(), env.clone()))
    }

    fn step_while(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "while")?;
        let Some((test, body)) = forms.split_first() else {
            return Err(syntax_error("while", "missing test"));
        };
        while self.eval(test, env)?.is_true() {
            self.eval_body(body, env)?;
        }
        Ok(Step::Done(Value::Boolean(false)))
    }

    /// `name` or `(name type)`; the type expression is evaluated in `env`
    pub(crate) fn parse_typed_name(
        &mut self,
        target: &Value,
        env: &Environment,
    ) -> Result<(SymbolId, Option<Value>), ControlSignal> {
        match target {
            Value::Name(name) => Ok((*name, None)),
            Value::Pair(_) => match self.forms(target, "binding")?.as_slice() {
                [Value::Name(name), type_expr] => {
                    let ty = self.eval(type_expr, env)?;
                    if !ty.is_type() {
                        let described = self.globals.mop.describe_value(&ty);
                        return Err(self.error_with(
                            RuntimeError::TypeCheck {
                                value: described,
                                expected: "<type>".to_string(),
                            },
                            vec![ty],
                        ));
                    }
                    Ok((*name, Some(ty)))
                }
                _ => Err(syntax_error("binding", "expected name or (name type)")),
            },
            _ => Err(syntax_error("binding", "expected name or (name type)")),
        }
    }

    /// Bind `name` in `frame`, checking `value` against the declared type
    fn bind_typed(
        &mut self,
        frame: &Environment,
        name: SymbolId,
        value: Value,
        ty: Option<Value>,
    ) -> Result<(), ControlSignal> {
        if let Some(ty) = &ty {
            self.globals
                .mop
                .check_type(&value, ty)
                .map_err(|e| self.error_with(e, vec![value.clone()]))?;
        }
        frame.add_binding(Binding::typed(name, value, ty, false));
        Ok(())
    }

    /// `(let ((name init) ((name type) init) ...) body...)`, bound in order
    fn step_let(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "let")?;
        let Some((bindings, body)) = forms.split_first() else {
            return Err(syntax_error("let", "missing bindings"));
        };
        let frame = env.push_scope(FrameOwner::Let);
        for spec in self.forms(bindings, "let")? {
            let parts = self.forms(&spec, "let")?;
            let [target, init] = parts.as_slice() else {
                return Err(syntax_error("let", "expected (name init)"));
            };
            let (name, ty) = self.parse_typed_name(target, &frame)?;
            let value = self.eval(init, &frame)?;
            self.bind_typed(&frame, name, value, ty)?;
        }
        self.step_body(body, &frame)
    }

    /// `(bind-values (a (b type) #rest r) expr body...)`
    fn step_bind_values(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "bind-values")?;
        let [targets, init, body @ ..] = forms.as_slice() else {
            return Err(syntax_error("bind-values", "expected (bind-values (names...) expr body...)"));
        };
        let rest_marker = self.globals.rest_marker;
        let mut required = Vec::new();
        let mut rest = None;
        let mut after_rest = false;
        for target in self.forms(targets, "bind-values")? {
            match target {
                Value::Name(name) if name == rest_marker => after_rest = true,
                Value::Name(name) if after_rest => rest = Some(name),
                _ if after_rest => return Err(syntax_error("bind-values", "expected a name after #rest")),
                other => required.push(self.parse_typed_name(&other, env)?),
            }
        }

        let count = ValueCount {
            required: required.len(),
            rest: rest.is_some(),
        };
        let values = self.eval_expecting(init, env, count)?;
        let frame = env.push_scope(FrameOwner::Let);
        for ((name, ty), value) in required.iter().zip(values.iter()) {
            self.bind_typed(&frame, *name, value.clone(), ty.clone())?;
        }
        if let Some(rest) = rest {
            let excess = values.get(required.len()..).unwrap_or(&[]).to_vec();
            frame.add_local(rest, Value::list(excess), false);
        }
        self.step_body(body, &frame)
    }

    /// `(local ((name (params) body...) ...) body...)`: mutually visible methods
    fn step_local(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "local")?;
        let Some((definitions, body)) = forms.split_first() else {
            return Err(syntax_error("local", "missing method definitions"));
        };
        let frame = env.push_scope(FrameOwner::Local);
        for definition in self.forms(definitions, "local")? {
            let parts = self.forms(&definition, "local")?;
            let [Value::Name(name), params, method_body @ ..] = parts.as_slice() else {
                return Err(syntax_error("local", "expected (name (params) body...)"));
            };
            let method = self.make_method(Some(*name), params, method_body, &frame)?;
            frame.add_local(*name, Value::Method(Rc::new(method)), true);
        }
        self.step_body(body, &frame)
    }

    fn step_method(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, "method")?;
        let Some((params, body)) = forms.split_first() else {
            return Err(syntax_error("method", "missing parameter list"));
        };
        let method = self.make_method(None, params, body, env)?;
        Ok(Step::Done(Value::Method(Rc::new(method))))
    }

    /// A method closed over `env`
    pub(crate) fn make_method(
        &mut self,
        name: Option<SymbolId>,
        params: &Value,
        body: &[Value],
        env: &Environment,
    ) -> Result<Method, ControlSignal> {
        let (params, specializers) = self.parse_params(params, env)?;
        let mut form = Vec::with_capacity(body.len() + 1);
        form.push(Value::Name(self.globals.special_forms.begin));
        form.extend(body.iter().cloned());
        Ok(Method {
            name,
            specializers,
            params,
            body: MethodBody::Code {
                body: Value::list(form),
                env: env.clone(),
            },
        })
    }

    /// Parameter list: required `name` / `(name type)`, then `#rest name`,
    /// then `#key` entries `name`, `(name default)` or `(keyword: name [default])`,
    /// optionally `#all-keys`.
    pub(crate) fn parse_params(
        &mut self,
        list: &Value,
        env: &Environment,
    ) -> Result<(ParamList, Vec<Value>), ControlSignal> {
        enum Section {
            Required,
            Rest,
            Keys,
        }
        let (rest_marker, key_marker, all_keys_marker) = (
            self.globals.rest_marker,
            self.globals.key_marker,
            self.globals.all_keys_marker,
        );
        let object = Value::Class(self.globals.mop.builtin.object);
        let mut params = ParamList::default();
        let mut specializers = Vec::new();
        let mut section = Section::Required;

        for item in self.forms(list, "parameter list")? {
            match item {
                Value::Name(sym) if sym == rest_marker => {
                    section = Section::Rest;
                    continue;
                }
                Value::Name(sym) if sym == key_marker => {
                    section = Section::Keys;
                    params.keys.get_or_insert_with(Vec::new);
                    continue;
                }
                Value::Name(sym) if sym == all_keys_marker => {
                    params.all_keys = true;
                    continue;
                }
                _ => {}
            }
            match section {
                Section::Required => {
                    let (name, ty) = self.parse_typed_name(&item, env)?;
                    params.required.push(name);
                    specializers.push(ty.unwrap_or_else(|| object.clone()));
                }
                Section::Rest => {
                    let name = item
                        .as_name()
                        .ok_or_else(|| syntax_error("#rest", "expected a name"))?;
                    params.rest = Some(name);
                }
                Section::Keys => {
                    let key = self.parse_key_param(&item)?;
                    if let Some(keys) = params.keys.as_mut() {
                        keys.push(key);
                    }
                }
            }
        }
        Ok((params, specializers))
    }

    fn parse_key_param(&self, item: &Value) -> Result<KeyParam, ControlSignal> {
        let key = |keyword: SymbolId, var: SymbolId, default: Option<&Value>| KeyParam {
            keyword,
            var,
            default: default.cloned(),
        };
        match item {
            Value::Name(name) => Ok(key(*name, *name, None)),
            Value::Pair(_) => match self.forms(item, "#key")?.as_slice() {
                [Value::Name(name), default] => Ok(key(*name, *name, Some(default))),
                [Value::Symbol(keyword), Value::Name(var)] => Ok(key(*keyword, *var, None)),
                [Value::Symbol(keyword), Value::Name(var), default] => Ok(key(*keyword, *var, Some(default))),
                _ => Err(syntax_error("#key", "expected name, (name default) or (keyword: name [default])")),
            },
            _ => Err(syntax_error("#key", "expected a name")),
        }
    }

    /// `(:= name value)` or `(:= (getter args...) value)`, which calls
    /// `getter-setter(value, args...)`
    fn step_assign(&mut self, args: &Value, env: &Environment) -> StepResult {
        let forms = self.forms(args, ":=")?;
        let [place, value_expr] = forms.as_slice() else {
            return Err(syntax_error(":=", "expected (:= place value)"));
        };
        match place {
            Value::Name(name) => {
                let value = self.eval(value_expr, env)?;
                let mop = &self.globals.mop;
                env.modify(
                    *name,
                    value.clone(),
                    &self.globals.modules,
                    &self.globals.symbols,
                    |v, ty| mop.check_type(v, ty),
                )
                .map_err(|e| self.error_with(e, vec![value.clone()]))?;
                Ok(Step::Done(value))
            }
            Value::Pair(_) => {
                let parts = self.forms(place, ":=")?;
                let [Value::Name(getter), arg_exprs @ ..] = parts.as_slice() else {
                    return Err(syntax_error(":=", "expected (getter args...) as place"));
                };
                let setter_name = format!("{}-setter", self.globals.name(*getter));
                let setter_sym = self.globals.symbols.intern(&setter_name);
                let setter = self.lookup_value(setter_sym, env)?;
                let value = self.eval(value_expr, env)?;
                let mut call_args = Vec::with_capacity(arg_exprs.len() + 1);
                call_args.push(value.clone());
                for expr in arg_exprs {
                    call_args.push(self.eval(expr, env)?);
                }
                self.apply(&setter, call_args)?;
                Ok(Step::Done(value))
            }
            _ => Err(syntax_error(":=", "expected a name or (getter args...)")),
        }
    }

    /// `(block (exit-name) body... (exception (var class) handler...) (cleanup forms...))`
    ///
    /// The exit name may be omitted with `()`. Exception clauses catch serious
    /// and signaled conditions raised by the body; cleanup forms run on every
    /// way out.
    fn step_block(&mut self, args: &Value, env: &Environment) -> StepResult {
        struct Clause {
            var: Option<SymbolId>,
            class: crate::clos::ClassId,
            body: Vec<Value>,
        }

        let forms = self.forms(args, "block")?;
        let Some((exit_spec, rest)) = forms.split_first() else {
            return Err(syntax_error("block", "missing exit name list"));
        };
        let exit_name = match self.forms(exit_spec, "block")?.as_slice() {
            [] => None,
            [Value::Name(name)] => Some(*name),
            _ => return Err(syntax_error("block", "expected (exit-name) or ()")),
        };

        let sf = self.globals.special_forms;
        let clause_head = |form: &Value| form.head().and_then(|h| h.as_name());
        let mut body = Vec::new();
        let mut clause_forms = Vec::new();
        let mut cleanup = Vec::new();
        for form in rest {
            match clause_head(form) {
                Some(head) if head == sf.exception => clause_forms.push(form.clone()),
                Some(head) if head == sf.cleanup => {
                    let forms = self.forms(form, "cleanup")?;
                    cleanup.extend(forms.into_iter().skip(1));
                }
                _ => body.push(form.clone()),
            }
        }

        let tag = self.process.fresh_tag();
        let frame = env.push_scope(FrameOwner::Block);
        if let Some(name) = exit_name {
            frame.add_local(name, Value::Exit(tag), true);
        }

        let mut clauses = Vec::with_capacity(clause_forms.len());
        for form in &clause_forms {
            let parts = self.forms(form, "exception")?;
            let [_, spec, handler_body @ ..] = parts.as_slice() else {
                return Err(syntax_error("exception", "expected (exception (var class) body...)"));
            };
            let (var, class_expr) = match spec {
                Value::Pair(_) => match self.forms(spec, "exception")?.as_slice() {
                    [Value::Name(var), class_expr] => (Some(*var), class_expr.clone()),
                    _ => return Err(syntax_error("exception", "expected (var class)")),
                },
                other => (None, other.clone()),
            };
            let class = match self.eval(&class_expr, &frame)? {
                Value::Class(class) => class,
                other => {
                    let described = self.globals.mop.describe_value(&other);
                    return Err(self.error_with(
                        RuntimeError::TypeCheck {
                            value: described,
                            expected: "<class>".to_string(),
                        },
                        vec![other],
                    ));
                }
            };
            clauses.push(Clause {
                var,
                class,
                body: handler_body.to_vec(),
            });
        }

        let handler_depth = self.process.conditions.depth();
        self.process
            .conditions
            .push_handlers(clauses.iter().map(|c| Handler { class: c.class, tag }).collect());
        let mut result = self.eval_body(&body, &frame);
        self.process.conditions.truncate(handler_depth);

        let caught = match &result {
            Err(ControlSignal::Error(condition)) if !condition.is_fatal() => Some(condition.clone()),
            _ => None,
        };
        if let Some(condition) = caught {
            let class = self.globals.mop.condition_class(&condition);
            let mop = &self.globals.mop;
            if let Some(clause) = clauses.iter().find(|c| mop.is_subclass(class, c.class)) {
                let handler_frame = frame.push_scope(FrameOwner::Block);
                if let Some(var) = clause.var {
                    handler_frame.add_local(var, condition_value(&condition), false);
                }
                self.process.last_backtrace.clear();
                result = self.eval_body(&clause.body, &handler_frame);
            }
        }
        let result = match result {
            Err(ControlSignal::Exit { tag: exit_tag, value }) if exit_tag == tag => Ok(value),
            other => other,
        };
        if !cleanup.is_empty() {
            self.eval_body(&cleanup, &frame)?;
        }
        result.map(Step::Done)
    }
}

/// The value an exception clause variable is bound to
pub fn condition_value(condition: &Rc<Condition>) -> Value {
    condition
        .payload
        .clone()
        .unwrap_or_else(|| Value::Condition(condition.clone()))
}

/// Syntax form names (cached symbol IDs)
#[derive(Debug, Clone, Copy)]
pub struct SpecialForms {
    pub quote: SymbolId,
    pub begin: SymbolId,
    pub r#if: SymbolId,
    pub when: SymbolId,
    pub unless: SymbolId,
    pub cond: SymbolId,
    pub r#else: SymbolId,
    pub and: SymbolId,
    pub or: SymbolId,
    pub r#while: SymbolId,
    pub r#let: SymbolId,
    pub bind_values: SymbolId,
    pub local: SymbolId,
    pub method: SymbolId,
    pub assign: SymbolId,
    pub set: SymbolId,
    pub block: SymbolId,
    pub exception: SymbolId,
    pub cleanup: SymbolId,
    pub define: SymbolId,
    pub define_variable: SymbolId,
    pub define_constant: SymbolId,
    pub define_class: SymbolId,
    pub slot: SymbolId,
    pub define_generic: SymbolId,
    pub define_method: SymbolId,
    pub define_module: SymbolId,
    pub r#use: SymbolId,
    pub export: SymbolId,
    pub create: SymbolId,
    pub in_module: SymbolId,
}

impl SpecialForms {
    pub fn new(symbols: &mut SymbolTable) -> Self {
        let mut s = |name: &str| symbols.intern(name);
        Self {
            quote: s("quote"),
            begin: s("begin"),
            r#if: s("if"),
            when: s("when"),
            unless: s("unless"),
            cond: s("cond"),
            r#else: s("else"),
            and: s("and"),
            or: s("or"),
            r#while: s("while"),
            r#let: s("let"),
            bind_values: s("bind-values"),
            local: s("local"),
            method: s("method"),
            assign: s(":="),
            set: s("set!"),
            block: s("block"),
            exception: s("exception"),
            cleanup: s("cleanup"),
            define: s("define"),
            define_variable: s("define-variable"),
            define_constant: s("define-constant"),
            define_class: s("define-class"),
            slot: s("slot"),
            define_generic: s("define-generic"),
            define_method: s("define-method"),
            define_module: s("define-module"),
            r#use: s("use"),
            export: s("export"),
            create: s("create"),
            in_module: s("in-module"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionKind;

    fn run(source: &str) -> EvalResult {
        let mut globals = GlobalContext::new().unwrap();
        let mut process = Process::new(globals.user_module);
        let mut interp = Interpreter::new(&mut process, &mut globals);
        interp.eval_string(source)
    }

    fn error_of(result: EvalResult) -> RuntimeError {
        match result {
            Err(ControlSignal::Error(condition)) => condition.error.clone().expect("runtime error"),
            other => panic!("expected an error, got {:?}", other.map_err(|_| ())),
        }
    }

    #[test]
    fn test_self_evaluating_and_quote() {
        assert_eq!(run("42").unwrap(), Value::Integer(42));
        assert_eq!(run("\"hi\"").unwrap(), Value::string("hi"));
        assert_eq!(run("'(1 2)").unwrap(), Value::list(vec![Value::Integer(1), Value::Integer(2)]));
    }

    #[test]
    fn test_unbound_variable() {
        assert_eq!(error_of(run("nowhere")), RuntimeError::UnboundVariable("nowhere".into()));
        assert_eq!(
            error_of(run("(define-variable later) later")),
            RuntimeError::UnboundVariable("later".into())
        );
    }

    #[test]
    fn test_conditionals() {
        assert_eq!(run("(if #f 1 2)").unwrap(), Value::Integer(2));
        assert_eq!(run("(if #f 1)").unwrap(), Value::Boolean(false));
        assert_eq!(run("(when 0 1 2)").unwrap(), Value::Integer(2));
        assert_eq!(run("(unless #t 1)").unwrap(), Value::Boolean(false));
        assert_eq!(run("(cond (#f 1) ((< 1 2) 2) (else 3))").unwrap(), Value::Integer(2));
        assert_eq!(run("(cond (7))").unwrap(), Value::Integer(7));
        assert_eq!(run("(and 1 2 3)").unwrap(), Value::Integer(3));
        assert_eq!(run("(and 1 #f 3)").unwrap(), Value::Boolean(false));
        assert_eq!(run("(or #f 5)").unwrap(), Value::Integer(5));
        assert_eq!(run("(or)").unwrap(), Value::Boolean(false));
    }

    #[test]
    fn test_let_is_sequential() {
        assert_eq!(run("(let ((x 1) (y (+ x 1))) (* x y))").unwrap(), Value::Integer(2));
    }

    #[test]
    fn test_typed_let_checks_value() {
        assert!(matches!(
            error_of(run("(let (((x <integer>) \"one\")) x)")),
            RuntimeError::TypeCheck { .. }
        ));
        assert!(matches!(
            error_of(run("(let (((x <integer>) 1)) (:= x #t))")),
            RuntimeError::TypeCheck { .. }
        ));
    }

    #[test]
    fn test_while_and_assignment() {
        let source = "(define-variable n 0) (define-variable total 0)
                      (while (< n 5) (:= total (+ total n)) (:= n (+ n 1)))
                      total";
        assert_eq!(run(source).unwrap(), Value::Integer(10));
    }

    #[test]
    fn test_method_closure() {
        let source = "(define-variable make-adder (method (n) (method (x) (+ x n))))
                      ((make-adder 3) 4)";
        assert_eq!(run(source).unwrap(), Value::Integer(7));
    }

    #[test]
    fn test_method_arity_and_type() {
        assert!(matches!(error_of(run("((method (x) x))")), RuntimeError::Arity { got: 0, .. }));
        assert!(matches!(
            error_of(run("((method ((x <integer>)) x) \"s\")")),
            RuntimeError::TypeCheck { .. }
        ));
    }

    #[test]
    fn test_rest_and_keys() {
        assert_eq!(
            run("((method (a #rest more) more) 1 2 3)").unwrap(),
            Value::list(vec![Value::Integer(2), Value::Integer(3)])
        );
        assert_eq!(run("((method (#key (x 10) y) (list x y)) y: 2)").unwrap(),
            Value::list(vec![Value::Integer(10), Value::Integer(2)]));
        // Unknown keywords are ignored
        assert_eq!(run("((method (#key x) x) z: 1 x: 5)").unwrap(), Value::Integer(5));
    }

    #[test]
    fn test_local_methods_see_each_other() {
        let source = "(local ((even? (n) (if (= n 0) #t (odd? (- n 1))))
                              (odd? (n) (if (= n 0) #f (even? (- n 1)))))
                        (even? 10))";
        assert_eq!(run(source).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_not_applicable() {
        assert!(matches!(error_of(run("(1 2)")), RuntimeError::NotApplicable(_)));
    }

    #[test]
    fn test_multiple_values() {
        assert_eq!(
            run("(bind-values (a b c) (values 1 2) (list a b c))").unwrap(),
            Value::list(vec![Value::Integer(1), Value::Integer(2), Value::Unspecified])
        );
        assert_eq!(
            run("(bind-values (a #rest r) (values 1 2 3) r)").unwrap(),
            Value::list(vec![Value::Integer(2), Value::Integer(3)])
        );
        // Single-value context takes the first value
        assert_eq!(run("(+ (values 1 2) 10)").unwrap(), Value::Integer(11));
        assert_eq!(error_of(run("(+ (values) 1)")), RuntimeError::ZeroValues);
        // Values pass through tail positions
        assert!(matches!(run("(if #t (values 1 2))").unwrap(), Value::Values(v) if v.len() == 2));
    }

    #[test]
    fn test_eval_expecting_adjusts_to_the_call_site() {
        let mut globals = GlobalContext::new().unwrap();
        let mut process = Process::new(globals.user_module);
        let mut interp = Interpreter::new(&mut process, &mut globals);
        let env = interp.globals.module_env(interp.process.current_module);
        let expr = crate::reader::read_from_string("(values 1 2)", &mut interp.globals.symbols).unwrap();

        let padded = interp.eval_expecting(&expr, &env, ValueCount::exactly(3)).unwrap();
        assert_eq!(padded, vec![Value::Integer(1), Value::Integer(2), Value::Unspecified]);
        let single = interp.eval_expecting(&expr, &env, ValueCount::exactly(1)).unwrap();
        assert_eq!(single, vec![Value::Integer(1)]);
        let rest = ValueCount { required: 0, rest: true };
        assert_eq!(interp.eval_expecting(&expr, &env, rest).unwrap().len(), 2);
        assert_eq!(interp.process.depth, 0);
    }

    #[test]
    fn test_block_exit_and_cleanup() {
        let source = "(define-variable log '())
                      (define-variable r
                        (block (return)
                          (:= log (pair 'body log))
                          (return 5)
                          99
                          (cleanup (:= log (pair 'cleanup log)))))
                      (list r log)";
        let result = run(source).unwrap();
        assert_eq!(result.list_to_vec().unwrap()[0], Value::Integer(5));
        assert_eq!(result.list_to_vec().unwrap()[1].list_to_vec().unwrap().len(), 2);
    }

    #[test]
    fn test_block_exception_clause() {
        let source = "(block ()
                        (error \"boom\")
                        (exception (c <error>) (condition-message c)))";
        assert_eq!(run(source).unwrap(), Value::string("boom"));

        let source = "(block () (+ 1 \"x\") (exception (c <type-error>) 'caught))";
        assert!(matches!(run(source).unwrap(), Value::Name(_)));

        // A non-matching clause lets the condition through
        let result = run("(block () (error \"x\") (exception <warning> 1))");
        match result {
            Err(ControlSignal::Error(c)) => assert_eq!(c.kind, ConditionKind::SimpleError),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn test_backtrace_captured() {
        let mut globals = GlobalContext::new().unwrap();
        let mut process = Process::new(globals.user_module);
        let mut interp = Interpreter::new(&mut process, &mut globals);
        assert!(interp.eval_string("(define-method f (x) (g x)) (f 1)").is_err());
        assert!(!process.last_backtrace.is_empty());
    }
}
