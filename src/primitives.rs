// Marlais Primitives - Built-in Functions
//
// Host functions bound as constants in module `dylan`.

use crate::clos::ClassId;
use crate::conditions::{Condition, ConditionKind, RuntimeError};
use crate::context::{GlobalContext, PrimitiveFn};
use crate::eval::{values_from, ControlSignal, EvalResult, Interpreter};
use crate::printer;
use crate::types::{Arity, LimitedInteger, Value};
use log::warn;
use std::rc::Rc;

/// Register all standard primitives
pub fn register_primitives(globals: &mut GlobalContext) -> Result<(), RuntimeError> {
    let dylan = globals.dylan_module;
    let mut register = |name: &str, arity: Arity, func: PrimitiveFn| {
        globals.register_primitive(dylan, name, arity, func)
    };

    // Arithmetic
    register("+", Arity::at_least(0), prim_add)?;
    register("-", Arity::at_least(1), prim_sub)?;
    register("*", Arity::at_least(0), prim_mul)?;
    register("/", Arity::at_least(1), prim_div)?;
    register("modulo", Arity::exactly(2), prim_modulo)?;

    // Comparison
    register("<", Arity::at_least(1), prim_lt)?;
    register(">", Arity::at_least(1), prim_gt)?;
    register("<=", Arity::at_least(1), prim_le)?;
    register(">=", Arity::at_least(1), prim_ge)?;
    register("=", Arity::at_least(1), prim_equal)?;
    register("==", Arity::exactly(2), prim_identical)?;
    register("~=", Arity::exactly(2), prim_not_equal)?;
    register("not", Arity::exactly(1), prim_not)?;

    // Pairs and lists
    register("pair", Arity::exactly(2), prim_pair)?;
    register("head", Arity::exactly(1), prim_head)?;
    register("tail", Arity::exactly(1), prim_tail)?;
    register("head-setter", Arity::exactly(2), prim_head_setter)?;
    register("tail-setter", Arity::exactly(2), prim_tail_setter)?;
    register("list", Arity::at_least(0), prim_list)?;
    register("empty?", Arity::exactly(1), prim_empty)?;

    // Collections
    register("vector", Arity::at_least(0), prim_vector)?;
    register("size", Arity::exactly(1), prim_size)?;
    register("element", Arity::exactly(2), prim_element)?;
    register("element-setter", Arity::exactly(3), prim_element_setter)?;

    // Functions and values
    register("values", Arity::at_least(0), prim_values)?;
    register("apply", Arity::at_least(2), prim_apply)?;
    register("make", Arity::at_least(1), prim_make)?;

    // Types and classes
    register("instance?", Arity::exactly(2), prim_instance_p)?;
    register("subtype?", Arity::exactly(2), prim_subtype_p)?;
    register("object-class", Arity::exactly(1), prim_object_class)?;
    register("singleton", Arity::exactly(1), prim_singleton)?;
    register("subclass", Arity::exactly(1), prim_subclass)?;
    register("limited", Arity::at_least(1), prim_limited)?;
    register("type-union", Arity::at_least(1), prim_type_union)?;
    register("seal", Arity::exactly(1), prim_seal)?;
    register("direct-superclasses", Arity::exactly(1), prim_direct_superclasses)?;
    register("all-superclasses", Arity::exactly(1), prim_all_superclasses)?;
    register("generic-function-methods", Arity::exactly(1), prim_generic_methods)?;
    register("sorted-applicable-methods", Arity::at_least(1), prim_sorted_applicable_methods)?;

    // Conditions
    register("error", Arity::at_least(1), prim_error)?;
    register("warning", Arity::at_least(1), prim_warning)?;
    register("signal", Arity::at_least(1), prim_signal)?;
    register("abort", Arity::exactly(0), prim_abort)?;
    register("condition-message", Arity::exactly(1), prim_condition_message)?;

    // Output
    register("print", Arity::exactly(1), prim_print)?;
    register("format-out", Arity::at_least(1), prim_format_out)?;

    Ok(())
}

fn type_error(interp: &Interpreter<'_>, value: &Value, expected: ClassId) -> ControlSignal {
    let mop = &interp.globals.mop;
    interp.error_with(
        RuntimeError::TypeCheck {
            value: mop.describe_value(value),
            expected: mop.class_name(expected).to_string(),
        },
        vec![value.clone()],
    )
}

fn expect_class(interp: &Interpreter<'_>, value: &Value) -> Result<ClassId, ControlSignal> {
    match value {
        Value::Class(c) => Ok(*c),
        other => Err(type_error(interp, other, interp.globals.mop.builtin.class)),
    }
}

fn expect_type(interp: &Interpreter<'_>, value: &Value) -> Result<(), ControlSignal> {
    if value.is_type() {
        Ok(())
    } else {
        Err(type_error(interp, value, interp.globals.mop.builtin.type_class))
    }
}

fn expect_integer(interp: &Interpreter<'_>, value: &Value) -> Result<i64, ControlSignal> {
    value
        .as_integer()
        .ok_or_else(|| type_error(interp, value, interp.globals.mop.builtin.integer))
}

/// Value following the keyword `name` in a keyword/value argument list
fn keyword_arg(interp: &Interpreter<'_>, args: &[Value], name: &str) -> Option<Value> {
    args.chunks(2).find_map(|pair| match (&pair[0], pair.get(1)) {
        (Value::Symbol(sym), Some(value)) if interp.globals.name(*sym) == name => Some(value.clone()),
        _ => None,
    })
}

// ============================================================================
// Arithmetic
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum NumVal {
    Int(i64),
    Float(f64),
}

impl NumVal {
    fn to_float(self) -> f64 {
        match self {
            NumVal::Int(n) => n as f64,
            NumVal::Float(f) => f,
        }
    }

    /// Integer operation with overflow falling back to float
    fn combine(
        self,
        other: NumVal,
        checked: fn(i64, i64) -> Option<i64>,
        float: fn(f64, f64) -> f64,
    ) -> NumVal {
        match (self, other) {
            (NumVal::Int(a), NumVal::Int(b)) => match checked(a, b) {
                Some(n) => NumVal::Int(n),
                None => NumVal::Float(float(a as f64, b as f64)),
            },
            (a, b) => NumVal::Float(float(a.to_float(), b.to_float())),
        }
    }

    fn add(self, other: NumVal) -> NumVal {
        self.combine(other, i64::checked_add, |a, b| a + b)
    }

    fn sub(self, other: NumVal) -> NumVal {
        self.combine(other, i64::checked_sub, |a, b| a - b)
    }

    fn mul(self, other: NumVal) -> NumVal {
        self.combine(other, i64::checked_mul, |a, b| a * b)
    }

    fn into_value(self) -> Value {
        match self {
            NumVal::Int(n) => Value::Integer(n),
            NumVal::Float(f) => Value::Float(f),
        }
    }
}

fn extract_number(interp: &Interpreter<'_>, value: &Value) -> Result<NumVal, ControlSignal> {
    match value {
        Value::Integer(n) => Ok(NumVal::Int(*n)),
        Value::Float(f) => Ok(NumVal::Float(*f)),
        other => Err(type_error(interp, other, interp.globals.mop.builtin.number)),
    }
}

fn prim_add(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let mut sum = NumVal::Int(0);
    for arg in args {
        sum = sum.add(extract_number(interp, arg)?);
    }
    Ok(sum.into_value())
}

fn prim_sub(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let first = extract_number(interp, &args[0])?;
    if args.len() == 1 {
        // Unary minus
        return Ok(NumVal::Int(0).sub(first).into_value());
    }
    let mut result = first;
    for arg in &args[1..] {
        result = result.sub(extract_number(interp, arg)?);
    }
    Ok(result.into_value())
}

fn prim_mul(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let mut product = NumVal::Int(1);
    for arg in args {
        product = product.mul(extract_number(interp, arg)?);
    }
    Ok(product.into_value())
}

fn divide(interp: &Interpreter<'_>, a: NumVal, b: NumVal) -> Result<NumVal, ControlSignal> {
    match (a, b) {
        (_, NumVal::Int(0)) => Err(interp.error_with(
            RuntimeError::simple("division by zero"),
            vec![a.into_value(), b.into_value()],
        )),
        // Exact integer quotients stay integers
        (NumVal::Int(x), NumVal::Int(y)) if x.checked_rem(y) == Some(0) => {
            Ok(x.checked_div(y).map_or(NumVal::Float(x as f64 / y as f64), NumVal::Int))
        }
        (x, y) => Ok(NumVal::Float(x.to_float() / y.to_float())),
    }
}

fn prim_div(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let first = extract_number(interp, &args[0])?;
    if args.len() == 1 {
        // Reciprocal
        return Ok(divide(interp, NumVal::Int(1), first)?.into_value());
    }
    let mut result = first;
    for arg in &args[1..] {
        let divisor = extract_number(interp, arg)?;
        result = divide(interp, result, divisor)?;
    }
    Ok(result.into_value())
}

/// Result takes the sign of the divisor
fn prim_modulo(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let a = expect_integer(interp, &args[0])?;
    let b = expect_integer(interp, &args[1])?;
    if b == 0 {
        return Err(interp.error_with(RuntimeError::simple("division by zero"), args.to_vec()));
    }
    let r = a.wrapping_rem(b);
    let m = if r != 0 && (r < 0) != (b < 0) { r + b } else { r };
    Ok(Value::Integer(m))
}

// ============================================================================
// Comparison
// ============================================================================

fn compare_chain(
    interp: &Interpreter<'_>,
    args: &[Value],
    accept: fn(std::cmp::Ordering) -> bool,
) -> EvalResult {
    for pair in args.windows(2) {
        let ordering = match (&pair[0], &pair[1]) {
            (Value::Character(a), Value::Character(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.borrow().as_str().cmp(b.borrow().as_str())),
            (a, b) => {
                let x = extract_number(interp, a)?;
                let y = extract_number(interp, b)?;
                match (x, y) {
                    (NumVal::Int(x), NumVal::Int(y)) => Some(x.cmp(&y)),
                    (x, y) => x.to_float().partial_cmp(&y.to_float()),
                }
            }
        };
        if !ordering.is_some_and(accept) {
            return Ok(Value::Boolean(false));
        }
    }
    if let [only] = args {
        extract_number(interp, only)?;
    }
    Ok(Value::Boolean(true))
}

fn prim_lt(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    compare_chain(interp, args, |o| o.is_lt())
}

fn prim_gt(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    compare_chain(interp, args, |o| o.is_gt())
}

fn prim_le(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    compare_chain(interp, args, |o| o.is_le())
}

fn prim_ge(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    compare_chain(interp, args, |o| o.is_ge())
}

fn prim_equal(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::Boolean(args.windows(2).all(|p| p[0].equal(&p[1]))))
}

fn prim_identical(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::Boolean(args[0].id_eq(&args[1])))
}

fn prim_not_equal(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::Boolean(!args[0].equal(&args[1])))
}

fn prim_not(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::Boolean(!args[0].is_true()))
}

// ============================================================================
// Pairs and lists
// ============================================================================

fn prim_pair(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::pair(args[0].clone(), args[1].clone()))
}

fn prim_head(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    match &args[0] {
        Value::EmptyList => Ok(Value::EmptyList),
        Value::Pair(p) => Ok(p.head.borrow().clone()),
        other => Err(type_error(interp, other, interp.globals.mop.builtin.list)),
    }
}

fn prim_tail(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    match &args[0] {
        Value::EmptyList => Ok(Value::EmptyList),
        Value::Pair(p) => Ok(p.tail.borrow().clone()),
        other => Err(type_error(interp, other, interp.globals.mop.builtin.list)),
    }
}

/// `head-setter(value, pair)`
fn prim_head_setter(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    match &args[1] {
        Value::Pair(p) => {
            *p.head.borrow_mut() = args[0].clone();
            Ok(args[0].clone())
        }
        other => Err(type_error(interp, other, interp.globals.mop.builtin.pair)),
    }
}

fn prim_tail_setter(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    match &args[1] {
        Value::Pair(p) => {
            *p.tail.borrow_mut() = args[0].clone();
            Ok(args[0].clone())
        }
        other => Err(type_error(interp, other, interp.globals.mop.builtin.pair)),
    }
}

fn prim_list(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::list(args.to_vec()))
}

fn prim_empty(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let empty = match &args[0] {
        Value::EmptyList => true,
        Value::Pair(_) => false,
        Value::Vector(v) => v.borrow().is_empty(),
        Value::String(s) => s.borrow().is_empty(),
        Value::Table(t) => t.borrow().is_empty(),
        Value::ByteVector(b) => b.borrow().is_empty(),
        other => return Err(type_error(interp, other, interp.globals.mop.builtin.collection)),
    };
    Ok(Value::Boolean(empty))
}

// ============================================================================
// Collections
// ============================================================================

fn prim_vector(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::vector(args.to_vec()))
}

fn prim_size(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let size = match &args[0] {
        Value::EmptyList => 0,
        Value::Pair(_) => match args[0].list_to_vec() {
            Some(items) => items.len(),
            None => return Err(type_error(interp, &args[0], interp.globals.mop.builtin.list)),
        },
        Value::Vector(v) => v.borrow().len(),
        Value::String(s) => s.borrow().chars().count(),
        Value::Table(t) => t.borrow().len(),
        Value::ByteVector(b) => b.borrow().len(),
        other => return Err(type_error(interp, other, interp.globals.mop.builtin.collection)),
    };
    Ok(Value::Integer(size as i64))
}

fn index_error(interp: &Interpreter<'_>, collection: &Value, index: &Value) -> ControlSignal {
    interp.error_with(
        RuntimeError::simple(format!(
            "element: index {} out of range",
            printer::print_to_string(interp.globals, index)
        )),
        vec![collection.clone(), index.clone()],
    )
}

fn sequence_index(interp: &Interpreter<'_>, index: &Value) -> Result<usize, ControlSignal> {
    let n = expect_integer(interp, index)?;
    usize::try_from(n).map_err(|_| index_error(interp, &Value::Unspecified, index))
}

/// `element(collection, key)`
fn prim_element(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let (collection, key) = (&args[0], &args[1]);
    let found = match collection {
        Value::Table(_) => collection.table_get(key),
        Value::Vector(v) => {
            let i = sequence_index(interp, key)?;
            v.borrow().get(i).cloned()
        }
        Value::String(s) => {
            let i = sequence_index(interp, key)?;
            s.borrow().chars().nth(i).map(Value::Character)
        }
        Value::ByteVector(b) => {
            let i = sequence_index(interp, key)?;
            b.borrow().get(i).map(|byte| Value::Integer(i64::from(*byte)))
        }
        Value::EmptyList | Value::Pair(_) => {
            let i = sequence_index(interp, key)?;
            collection.list_to_vec().and_then(|items| items.get(i).cloned())
        }
        other => return Err(type_error(interp, other, interp.globals.mop.builtin.collection)),
    };
    found.ok_or_else(|| index_error(interp, collection, key))
}

/// `element-setter(value, collection, key)`
fn prim_element_setter(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let (value, collection, key) = (&args[0], &args[1], &args[2]);
    match collection {
        Value::Table(_) => collection.table_put(key.clone(), value.clone()),
        Value::Vector(v) => {
            let i = sequence_index(interp, key)?;
            let mut items = v.borrow_mut();
            match items.get_mut(i) {
                Some(slot) => *slot = value.clone(),
                None => return Err(index_error(interp, collection, key)),
            }
        }
        Value::String(s) => {
            let i = sequence_index(interp, key)?;
            let Value::Character(c) = value else {
                return Err(type_error(interp, value, interp.globals.mop.builtin.character));
            };
            let mut chars: Vec<char> = s.borrow().chars().collect();
            match chars.get_mut(i) {
                Some(slot) => *slot = *c,
                None => return Err(index_error(interp, collection, key)),
            }
            *s.borrow_mut() = chars.into_iter().collect();
        }
        Value::Pair(_) => {
            let i = sequence_index(interp, key)?;
            let mut cell = collection.clone();
            for _ in 0..i {
                cell = cell.tail().unwrap_or(Value::EmptyList);
            }
            match cell {
                Value::Pair(p) => *p.head.borrow_mut() = value.clone(),
                _ => return Err(index_error(interp, collection, key)),
            }
        }
        other => return Err(type_error(interp, other, interp.globals.mop.builtin.collection)),
    }
    Ok(value.clone())
}

// ============================================================================
// Functions and values
// ============================================================================

fn prim_values(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(values_from(args.to_vec()))
}

/// `apply(function, arg..., sequence)`
fn prim_apply(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let (last, init) = match args[1..].split_last() {
        Some(split) => split,
        None => return Ok(Value::Unspecified),
    };
    let mut call_args = init.to_vec();
    match last {
        Value::Vector(v) => call_args.extend(v.borrow().iter().cloned()),
        other => match other.list_to_vec() {
            Some(items) => call_args.extend(items),
            None => return Err(type_error(interp, other, interp.globals.mop.builtin.sequence)),
        },
    }
    interp.apply(&args[0], call_args)
}

fn prim_make(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let class = expect_class(interp, &args[0])?;
    let initargs = &args[1..];
    let builtin = &interp.globals.mop.builtin;
    if class == builtin.table {
        return Ok(Value::table());
    }
    if class == builtin.vector {
        let size = match keyword_arg(interp, initargs, "size") {
            Some(v) => sequence_index(interp, &v)?,
            None => 0,
        };
        let fill = keyword_arg(interp, initargs, "fill").unwrap_or(Value::Boolean(false));
        let mut items = Vec::new();
        if items.try_reserve_exact(size).is_err() {
            return Err(interp.error_with(
                RuntimeError::simple(format!("make: cannot allocate a vector of size {}", size)),
                vec![Value::Integer(size as i64)],
            ));
        }
        items.resize(size, fill);
        return Ok(Value::vector(items));
    }
    interp.make_instance(class, initargs)
}

// ============================================================================
// Types and classes
// ============================================================================

fn prim_instance_p(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    expect_type(interp, &args[1])?;
    Ok(Value::Boolean(interp.globals.mop.instance_of(&args[0], &args[1])))
}

fn prim_subtype_p(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    expect_type(interp, &args[0])?;
    expect_type(interp, &args[1])?;
    Ok(Value::Boolean(interp.globals.mop.subtype_of(&args[0], &args[1])))
}

fn prim_object_class(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::Class(interp.globals.mop.class_of(&args[0])))
}

fn prim_singleton(_interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::singleton(args[0].clone()))
}

fn prim_subclass(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::Subclass(expect_class(interp, &args[0])?))
}

/// `limited(<integer>, min: lo, max: hi)`
fn prim_limited(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let base = expect_class(interp, &args[0])?;
    let integer = interp.globals.mop.builtin.integer;
    if !interp.globals.mop.is_subclass(base, integer) {
        return Err(interp.error_with(
            RuntimeError::simple("limited: only integer classes can be limited"),
            vec![args[0].clone()],
        ));
    }
    let bound = |name: &str| -> Result<Option<i64>, ControlSignal> {
        keyword_arg(interp, &args[1..], name)
            .map(|v| expect_integer(interp, &v))
            .transpose()
    };
    let (min, max) = (bound("min")?, bound("max")?);
    Ok(Value::LimitedInteger(LimitedInteger { base, min, max }))
}

fn prim_type_union(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    for arg in args {
        expect_type(interp, arg)?;
    }
    if let [only] = args {
        return Ok(only.clone());
    }
    Ok(Value::Union(Rc::from(args)))
}

fn prim_seal(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let class = expect_class(interp, &args[0])?;
    interp.globals.mop.seal(class)?;
    Ok(args[0].clone())
}

fn prim_direct_superclasses(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let class = expect_class(interp, &args[0])?;
    let supers = interp
        .globals
        .mop
        .get_class(class)
        .map(|c| c.supers.iter().map(|s| Value::Class(*s)).collect())
        .unwrap_or_default();
    Ok(Value::list(supers))
}

/// The class precedence list, the class itself first
fn prim_all_superclasses(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let class = expect_class(interp, &args[0])?;
    let cpl = interp.globals.mop.cpl(class).iter().map(|c| Value::Class(*c)).collect();
    Ok(Value::list(cpl))
}

fn prim_generic_methods(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let Value::Generic(id) = &args[0] else {
        return Err(type_error(interp, &args[0], interp.globals.mop.builtin.generic_function));
    };
    let methods = interp
        .globals
        .mop
        .generic_methods(*id)
        .iter()
        .map(|m| Value::Method(m.clone()))
        .collect();
    Ok(Value::list(methods))
}

/// `sorted-applicable-methods(generic, arg...)`, most specific first
fn prim_sorted_applicable_methods(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let Value::Generic(id) = &args[0] else {
        return Err(type_error(interp, &args[0], interp.globals.mop.builtin.generic_function));
    };
    match interp.globals.mop.sorted_applicable_methods(*id, &args[1..]) {
        Ok(methods) => Ok(Value::list(methods.iter().map(|m| Value::Method(m.clone())).collect())),
        Err(RuntimeError::NoApplicableMethod { .. }) => Ok(Value::EmptyList),
        Err(e) => Err(interp.error_with(e, args[1..].to_vec())),
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Build a condition from `error`/`warning`/`signal` arguments: a format
/// string with arguments, a condition instance, or a condition class with
/// init arguments.
fn make_condition(
    interp: &mut Interpreter<'_>,
    args: &[Value],
    default_kind: ConditionKind,
) -> Result<Condition, ControlSignal> {
    let instance = match &args[0] {
        Value::String(control) => {
            let control = control.borrow().clone();
            let message = printer::format(interp.globals, &control, &args[1..]);
            return Ok(Condition::new(default_kind, message).with_values(args[1..].to_vec()));
        }
        Value::Condition(c) => return Ok(Condition::clone(c)),
        Value::Class(class) => interp.make_instance(*class, &args[1..])?,
        other => other.clone(),
    };
    let condition_class = interp.globals.mop.builtin.condition;
    let class = interp.globals.mop.class_of(&instance);
    if !interp.globals.mop.is_subclass(class, condition_class) {
        return Err(type_error(interp, &instance, condition_class));
    }
    let kind = interp.globals.mop.kind_for_class(class);
    let message = printer::condition_message(interp.globals, &instance);
    Ok(Condition::from_instance(instance, kind, message))
}

/// Unwind when a handler accepts the condition or it is serious; otherwise
/// log it and return #f.
fn raise(interp: &mut Interpreter<'_>, condition: Condition) -> EvalResult {
    let condition = Rc::new(condition);
    let class = interp.globals.mop.condition_class(&condition);
    let mop = &interp.globals.mop;
    let handled = interp
        .process
        .conditions
        .find_handler(|handler| mop.is_subclass(class, handler))
        .is_some();
    if handled || condition.is_serious() || condition.is_fatal() {
        return Err(ControlSignal::Error(condition));
    }
    warn!("{}: {}", mop.class_name(class), condition.message);
    Ok(Value::Boolean(false))
}

fn prim_error(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let mut condition = make_condition(interp, args, ConditionKind::SimpleError)?;
    if !condition.is_serious() && !condition.is_fatal() {
        // `error` always unwinds
        condition.kind = ConditionKind::SimpleError;
    }
    Err(ControlSignal::Error(Rc::new(condition)))
}

fn prim_warning(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let condition = make_condition(interp, args, ConditionKind::SimpleWarning)?;
    raise(interp, condition)
}

fn prim_signal(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let condition = make_condition(interp, args, ConditionKind::SimpleWarning)?;
    raise(interp, condition)
}

fn prim_abort(_interp: &mut Interpreter<'_>, _args: &[Value]) -> EvalResult {
    Err(ControlSignal::Error(Rc::new(Condition::new(ConditionKind::Abort, "abort"))))
}

fn prim_condition_message(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    Ok(Value::string(&printer::condition_message(interp.globals, &args[0])))
}

// ============================================================================
// Output
// ============================================================================

fn prim_print(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    println!("{}", printer::print_to_string(interp.globals, &args[0]));
    Ok(args[0].clone())
}

fn prim_format_out(interp: &mut Interpreter<'_>, args: &[Value]) -> EvalResult {
    let Value::String(control) = &args[0] else {
        return Err(type_error(interp, &args[0], interp.globals.mop.builtin.string));
    };
    let control = control.borrow().clone();
    print!("{}", printer::format(interp.globals, &control, &args[1..]));
    Ok(values_from(Vec::new()))
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
    fn test_arithmetic() {
        assert_eq!(run("(+ 1 2 3)").unwrap(), Value::Integer(6));
        assert_eq!(run("(- 5)").unwrap(), Value::Integer(-5));
        assert_eq!(run("(* 2 2.5)").unwrap(), Value::Float(5.0));
        assert_eq!(run("(/ 6 3)").unwrap(), Value::Integer(2));
        assert_eq!(run("(/ 1 2)").unwrap(), Value::Float(0.5));
        assert_eq!(run("(modulo -7 3)").unwrap(), Value::Integer(2));
        assert_eq!(run("(* 9223372036854775807 2)").unwrap(), Value::Float(9223372036854775807.0 * 2.0));
        assert!(matches!(error_of(run("(/ 1 0)")), RuntimeError::Simple(_)));
        assert!(matches!(error_of(run("(+ 1 \"a\")")), RuntimeError::TypeCheck { .. }));
    }

    #[test]
    fn test_comparison_and_equality() {
        assert_eq!(run("(< 1 2 3)").unwrap(), Value::Boolean(true));
        assert_eq!(run("(< 1 3 2)").unwrap(), Value::Boolean(false));
        assert_eq!(run("(>= 2.0 2)").unwrap(), Value::Boolean(true));
        assert_eq!(run("(= (list 1 2) (list 1 2))").unwrap(), Value::Boolean(true));
        assert_eq!(run("(== (list 1 2) (list 1 2))").unwrap(), Value::Boolean(false));
        assert_eq!(run("(let ((x (list 1))) (== x x))").unwrap(), Value::Boolean(true));
        assert_eq!(run("(not #f)").unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_collections() {
        assert_eq!(run("(size (list 1 2 3))").unwrap(), Value::Integer(3));
        assert_eq!(run("(element (vector 4 5) 1)").unwrap(), Value::Integer(5));
        assert_eq!(run("(element \"abc\" 2)").unwrap(), Value::Character('c'));
        assert_eq!(
            run("(let ((t (make <table>))) (element-setter 9 t #\"k\") (element t #\"k\"))").unwrap(),
            Value::Integer(9)
        );
        assert_eq!(
            run("(let ((v (make <vector> size: 2 fill: 0))) (element-setter 3 v 1) v)").unwrap(),
            Value::vector(vec![Value::Integer(0), Value::Integer(3)])
        );
        assert_eq!(run("(head (tail (list 1 2)))").unwrap(), Value::Integer(2));
        assert!(matches!(error_of(run("(element (vector 1) 5)")), RuntimeError::Simple(_)));
    }

    #[test]
    fn test_oversized_vector_is_an_error() {
        assert!(matches!(
            error_of(run("(make <vector> size: 1000000000000000000)")),
            RuntimeError::Simple(_)
        ));
        assert!(matches!(error_of(run("(make <vector> size: -1)")), RuntimeError::Simple(_)));
        assert_eq!(
            run("(block () (make <vector> size: 1000000000000000000) (exception <error> \"refused\"))").unwrap(),
            Value::string("refused")
        );
    }

    #[test]
    fn test_apply_and_values() {
        assert_eq!(run("(apply + 1 (list 2 3))").unwrap(), Value::Integer(6));
        assert_eq!(
            run("(values 1 2)").unwrap(),
            Value::values(vec![Value::Integer(1), Value::Integer(2)])
        );
    }

    #[test]
    fn test_type_operations() {
        assert_eq!(run("(instance? 3 (limited <integer> min: 0 max: 5))").unwrap(), Value::Boolean(true));
        assert_eq!(run("(instance? 7 (limited <integer> min: 0 max: 5))").unwrap(), Value::Boolean(false));
        assert_eq!(run("(instance? #f (type-union <integer> <boolean>))").unwrap(), Value::Boolean(true));
        assert_eq!(run("(subtype? <integer> <number>)").unwrap(), Value::Boolean(true));
        assert_eq!(run("(instance? <integer> (subclass <number>))").unwrap(), Value::Boolean(true));
        assert_eq!(run("(instance? 'a (singleton 'a))").unwrap(), Value::Boolean(true));
        assert!(matches!(error_of(run("(instance? 1 2)")), RuntimeError::TypeCheck { .. }));
    }

    #[test]
    fn test_class_introspection() {
        let classes = "(define-class <a> (<object>)) (define-class <b> (<a>)) ";
        assert_eq!(
            run(&format!("{}(= (direct-superclasses <b>) (list <a>))", classes)).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            run(&format!("{}(= (all-superclasses <b>) (list <b> <a> <object>))", classes)).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(run(&format!("{}(object-class (make <b>))", classes)).is_ok(), true);
        assert!(matches!(
            error_of(run(&format!("{}(seal <a>) (define-class <c> (<a>))", classes))),
            RuntimeError::SealedClass(_)
        ));
    }

    #[test]
    fn test_error_forms() {
        let result = run("(error \"bad %s\" \"thing\")");
        match result {
            Err(ControlSignal::Error(c)) => assert_eq!(c.message, "bad thing"),
            _ => panic!("expected an error"),
        }
        // Unhandled warnings return #f
        assert_eq!(run("(warning \"careful\")").unwrap(), Value::Boolean(false));
        let caught = run(
            "(block () (signal \"w\") (exception (c <warning>) (condition-message c)))",
        );
        assert_eq!(caught.unwrap(), Value::string("w"));
        match run("(abort)") {
            Err(ControlSignal::Error(c)) => assert!(c.is_fatal()),
            _ => panic!("expected abort"),
        }
    }
}
