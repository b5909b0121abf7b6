// Marlais Value Store
//
// Boxed object model: immediates live inline in the enum, everything else is a
// reference-counted heap cell that carries its variant for its whole lifetime.

use crate::clos::{ClassId, GenericId, Method};
use crate::conditions::Condition;
use crate::environment::Environment;
use crate::context::PrimitiveFn;
use crate::module::ModuleId;
use crate::symbol::SymbolId;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Variant tag of a value. `Value::tag` is O(1) and never changes for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Boolean,
    EmptyList,
    Eof,
    Unspecified,
    Uninitialized,
    Character,
    Integer,
    Float,
    Name,
    Symbol,
    Pair,
    Vector,
    Table,
    ByteVector,
    String,
    Class,
    Singleton,
    Subclass,
    LimitedInteger,
    Union,
    SlotDescriptor,
    Primitive,
    Generic,
    Method,
    NextMethod,
    Exit,
    Values,
    Instance,
    Module,
    Environment,
    Condition,
}

/// A mutable cons cell
pub struct Pair {
    pub head: RefCell<Value>,
    pub tail: RefCell<Value>,
}

// Unlink nested cells through a worklist so long or deep lists do not drop
// recursively. Nothing is allocated unless a child is itself a pair.
impl Drop for Pair {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        take_pair_children(&mut self.head, &mut self.tail, &mut pending);
        while let Some(pair) = pending.pop() {
            if let Ok(mut cell) = Rc::try_unwrap(pair) {
                take_pair_children(&mut cell.head, &mut cell.tail, &mut pending);
            }
        }
    }
}

fn take_pair_children(head: &mut RefCell<Value>, tail: &mut RefCell<Value>, pending: &mut Vec<Rc<Pair>>) {
    for slot in [head.get_mut(), tail.get_mut()] {
        if matches!(*slot, Value::Pair(_)) {
            if let Value::Pair(pair) = std::mem::replace(slot, Value::EmptyList) {
                pending.push(pair);
            }
        }
    }
}

/// `limited(<integer>, min: .., max: ..)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitedInteger {
    pub base: ClassId,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl LimitedInteger {
    pub fn contains(&self, n: i64) -> bool {
        self.min.map_or(true, |lo| n >= lo) && self.max.map_or(true, |hi| n <= hi)
    }

    /// True when every integer admitted by `self` is admitted by `other`.
    pub fn within(&self, other: &LimitedInteger) -> bool {
        let lower_ok = match (other.min, self.min) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(o), Some(s)) => s >= o,
        };
        let upper_ok = match (other.max, self.max) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(o), Some(s)) => s <= o,
        };
        lower_ok && upper_ok
    }
}

/// Host-level function registered through the primitive API
pub struct Primitive {
    pub name: SymbolId,
    pub arity: Arity,
    pub func: PrimitiveFn,
}

/// Fixed-arity signature of a primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub required: usize,
    pub rest: bool,
}

impl Arity {
    pub const fn exactly(required: usize) -> Self {
        Self { required, rest: false }
    }

    pub const fn at_least(required: usize) -> Self {
        Self { required, rest: true }
    }

    pub fn accepts(&self, count: usize) -> bool {
        if self.rest {
            count >= self.required
        } else {
            count == self.required
        }
    }
}

/// An instance of a user-defined (or condition) class
#[derive(Debug)]
pub struct Instance {
    pub class: ClassId,
    pub slots: RefCell<Vec<Value>>,
}

/// Captured state behind a `next-method` value
pub struct NextMethodState {
    /// Sorted applicable methods of the original call
    pub methods: Rc<[Rc<Method>]>,
    /// Index of the method `next-method` will run
    pub index: usize,
    /// Arguments of the original call
    pub args: Rc<[Value]>,
}

#[derive(Clone)]
pub enum Value {
    Boolean(bool),
    EmptyList,
    Eof,
    /// Result of forms evaluated only for effect; pad value for missing values
    Unspecified,
    /// Marker stored in slots and bindings that have no value yet
    Uninitialized,
    Character(char),
    Integer(i64),
    Float(f64),
    /// An identifier in an expression tree
    Name(SymbolId),
    /// A self-evaluating symbol (`#"foo"` or `foo:`)
    Symbol(SymbolId),
    Pair(Rc<Pair>),
    Vector(Rc<RefCell<Vec<Value>>>),
    /// Association table compared with structural equality
    Table(Rc<RefCell<Vec<(Value, Value)>>>),
    ByteVector(Rc<RefCell<Vec<u8>>>),
    String(Rc<RefCell<String>>),
    Class(ClassId),
    Singleton(Rc<Value>),
    Subclass(ClassId),
    LimitedInteger(LimitedInteger),
    Union(Rc<[Value]>),
    /// (class, effective slot position)
    SlotDescriptor(ClassId, u32),
    Primitive(Rc<Primitive>),
    Generic(GenericId),
    Method(Rc<Method>),
    NextMethod(Rc<NextMethodState>),
    /// Exit procedure of a `block`, identified by its tag
    Exit(u64),
    Values(Rc<[Value]>),
    Instance(Rc<Instance>),
    Module(ModuleId),
    Environment(Environment),
    Condition(Rc<Condition>),
}

impl Value {
    pub fn tag(&self) -> Tag {
        match self {
            Value::Boolean(_) => Tag::Boolean,
            Value::EmptyList => Tag::EmptyList,
            Value::Eof => Tag::Eof,
            Value::Unspecified => Tag::Unspecified,
            Value::Uninitialized => Tag::Uninitialized,
            Value::Character(_) => Tag::Character,
            Value::Integer(_) => Tag::Integer,
            Value::Float(_) => Tag::Float,
            Value::Name(_) => Tag::Name,
            Value::Symbol(_) => Tag::Symbol,
            Value::Pair(_) => Tag::Pair,
            Value::Vector(_) => Tag::Vector,
            Value::Table(_) => Tag::Table,
            Value::ByteVector(_) => Tag::ByteVector,
            Value::String(_) => Tag::String,
            Value::Class(_) => Tag::Class,
            Value::Singleton(_) => Tag::Singleton,
            Value::Subclass(_) => Tag::Subclass,
            Value::LimitedInteger(_) => Tag::LimitedInteger,
            Value::Union(_) => Tag::Union,
            Value::SlotDescriptor(..) => Tag::SlotDescriptor,
            Value::Primitive(_) => Tag::Primitive,
            Value::Generic(_) => Tag::Generic,
            Value::Method(_) => Tag::Method,
            Value::NextMethod(_) => Tag::NextMethod,
            Value::Exit(_) => Tag::Exit,
            Value::Values(_) => Tag::Values,
            Value::Instance(_) => Tag::Instance,
            Value::Module(_) => Tag::Module,
            Value::Environment(_) => Tag::Environment,
            Value::Condition(_) => Tag::Condition,
        }
    }

    // Constructors (the allocation side of the store)

    pub fn pair(head: Value, tail: Value) -> Value {
        Value::Pair(Rc::new(Pair {
            head: RefCell::new(head),
            tail: RefCell::new(tail),
        }))
    }

    pub fn string(s: &str) -> Value {
        Value::String(Rc::new(RefCell::new(s.to_string())))
    }

    pub fn vector(items: Vec<Value>) -> Value {
        Value::Vector(Rc::new(RefCell::new(items)))
    }

    pub fn table() -> Value {
        Value::Table(Rc::new(RefCell::new(Vec::new())))
    }

    pub fn byte_vector(bytes: Vec<u8>) -> Value {
        Value::ByteVector(Rc::new(RefCell::new(bytes)))
    }

    pub fn values(items: Vec<Value>) -> Value {
        Value::Values(items.into())
    }

    pub fn singleton(v: Value) -> Value {
        Value::Singleton(Rc::new(v))
    }

    /// Build a proper list from a vector
    pub fn list(items: Vec<Value>) -> Value {
        Self::list_with_tail(items, Value::EmptyList)
    }

    pub fn list_with_tail(items: Vec<Value>, tail: Value) -> Value {
        items
            .into_iter()
            .rev()
            .fold(tail, |acc, item| Value::pair(item, acc))
    }

    /// Collect a proper list; None for improper lists and non-lists
    pub fn list_to_vec(&self) -> Option<Vec<Value>> {
        let mut out = Vec::new();
        let mut current = self.clone();
        loop {
            match current {
                Value::EmptyList => return Some(out),
                Value::Pair(p) => {
                    out.push(p.head.borrow().clone());
                    let next = p.tail.borrow().clone();
                    current = next;
                }
                _ => return None,
            }
        }
    }

    pub fn head(&self) -> Option<Value> {
        match self {
            Value::Pair(p) => Some(p.head.borrow().clone()),
            _ => None,
        }
    }

    pub fn tail(&self) -> Option<Value> {
        match self {
            Value::Pair(p) => Some(p.tail.borrow().clone()),
            _ => None,
        }
    }

    /// Everything except `#f` is true
    pub fn is_true(&self) -> bool {
        !matches!(self, Value::Boolean(false))
    }

    pub fn as_name(&self) -> Option<SymbolId> {
        match self {
            Value::Name(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<SymbolId> {
        match self {
            Value::Symbol(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Type values usable as specializers
    pub fn is_type(&self) -> bool {
        matches!(
            self,
            Value::Class(_)
                | Value::Singleton(_)
                | Value::Subclass(_)
                | Value::LimitedInteger(_)
                | Value::Union(_)
        )
    }

    /// Specializers whose acceptance depends on the argument value, not only
    /// its class. Generics using them bypass the class-keyed cache; every
    /// class argument shares the class `<class>`, so `subclass` is one of them.
    pub fn is_value_dependent_type(&self) -> bool {
        match self {
            Value::Singleton(_) | Value::LimitedInteger(_) | Value::Subclass(_) => true,
            Value::Union(members) => members.iter().any(Value::is_value_dependent_type),
            _ => false,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Primitive(_)
                | Value::Generic(_)
                | Value::Method(_)
                | Value::NextMethod(_)
                | Value::Exit(_)
        )
    }

    /// Identity (`==`): pointer identity for heap values, value identity for
    /// numbers, characters and other immediates.
    pub fn id_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::EmptyList, Value::EmptyList)
            | (Value::Eof, Value::Eof)
            | (Value::Unspecified, Value::Unspecified)
            | (Value::Uninitialized, Value::Uninitialized) => true,
            (Value::Character(a), Value::Character(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Name(a), Value::Name(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => Rc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Rc::ptr_eq(a, b),
            (Value::Table(a), Value::Table(b)) => Rc::ptr_eq(a, b),
            (Value::ByteVector(a), Value::ByteVector(b)) => Rc::ptr_eq(a, b),
            (Value::String(a), Value::String(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => a == b,
            (Value::Singleton(a), Value::Singleton(b)) => Rc::ptr_eq(a, b) || a.id_eq(b),
            (Value::Subclass(a), Value::Subclass(b)) => a == b,
            (Value::LimitedInteger(a), Value::LimitedInteger(b)) => a == b,
            (Value::Union(a), Value::Union(b)) => Rc::ptr_eq(a, b),
            (Value::SlotDescriptor(c1, s1), Value::SlotDescriptor(c2, s2)) => c1 == c2 && s1 == s2,
            (Value::Primitive(a), Value::Primitive(b)) => Rc::ptr_eq(a, b),
            (Value::Generic(a), Value::Generic(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => Rc::ptr_eq(a, b),
            (Value::NextMethod(a), Value::NextMethod(b)) => Rc::ptr_eq(a, b),
            (Value::Exit(a), Value::Exit(b)) => a == b,
            (Value::Values(a), Value::Values(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => a == b,
            (Value::Environment(a), Value::Environment(b)) => a.same_frame(b),
            (Value::Condition(a), Value::Condition(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality (`=`): numeric across integer/float, deep for
    /// containers, identity for everything else.
    pub fn equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                (*a as f64) == *b
            }
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Pair(a), Value::Pair(b)) => equal_lists(a, b),
            (Value::Vector(a), Value::Vector(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Value::String(a), Value::String(b)) => *a.borrow() == *b.borrow(),
            (Value::ByteVector(a), Value::ByteVector(b)) => *a.borrow() == *b.borrow(),
            (Value::Table(a), Value::Table(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(k2, v2)| k.equal(k2) && v.equal(v2))
                    })
            }
            (Value::Values(a), Value::Values(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            (Value::Singleton(a), Value::Singleton(b)) => a.equal(b),
            (Value::Union(a), Value::Union(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equal(y))
            }
            _ => self.id_eq(other),
        }
    }

    pub fn table_get(&self, key: &Value) -> Option<Value> {
        match self {
            Value::Table(t) => t
                .borrow()
                .iter()
                .find(|(k, _)| k.equal(key))
                .map(|(_, v)| v.clone()),
            _ => None,
        }
    }

    pub fn table_put(&self, key: Value, value: Value) {
        if let Value::Table(t) = self {
            let mut entries = t.borrow_mut();
            if let Some(entry) = entries.iter_mut().find(|(k, _)| k.equal(&key)) {
                entry.1 = value;
            } else {
                entries.push((key, value));
            }
        }
    }
}

/// Structural list equality, walking tails in a loop
fn equal_lists(a: &Rc<Pair>, b: &Rc<Pair>) -> bool {
    let (mut a, mut b) = (a.clone(), b.clone());
    loop {
        if Rc::ptr_eq(&a, &b) {
            return true;
        }
        if !a.head.borrow().equal(&b.head.borrow()) {
            return false;
        }
        let next_a = a.tail.borrow().clone();
        let next_b = b.tail.borrow().clone();
        match (next_a, next_b) {
            (Value::Pair(x), Value::Pair(y)) => {
                a = x;
                b = y;
            }
            (x, y) => return x.equal(&y),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

// Debug output stays symbol-table agnostic; printer.rs renders names.
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(true) => write!(f, "#t"),
            Value::Boolean(false) => write!(f, "#f"),
            Value::EmptyList => write!(f, "()"),
            Value::Eof => write!(f, "#<eof>"),
            Value::Unspecified => write!(f, "#<unspecified>"),
            Value::Uninitialized => write!(f, "#<uninitialized>"),
            Value::Character(c) => write!(f, "#\\{}", c),
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::Name(id) => write!(f, "#<name {}>", id.0),
            Value::Symbol(id) => write!(f, "#<symbol {}>", id.0),
            Value::Pair(_) => match self.list_to_vec() {
                Some(items) => f.debug_list().entries(items.iter()).finish(),
                None => write!(f, "#<pair>"),
            },
            Value::Vector(v) => write!(f, "#{:?}", v.borrow()),
            Value::Table(t) => write!(f, "#<table size {}>", t.borrow().len()),
            Value::ByteVector(b) => write!(f, "#<byte-vector {:?}>", b.borrow()),
            Value::String(s) => write!(f, "{:?}", s.borrow()),
            Value::Class(id) => write!(f, "#<class {}>", id.0),
            Value::Singleton(v) => write!(f, "#<singleton {:?}>", v),
            Value::Subclass(id) => write!(f, "#<subclass {}>", id.0),
            Value::LimitedInteger(l) => write!(f, "#<limited {:?}..{:?}>", l.min, l.max),
            Value::Union(members) => write!(f, "#<union {:?}>", members),
            Value::SlotDescriptor(c, s) => write!(f, "#<slot-descriptor {}:{}>", c.0, s),
            Value::Primitive(p) => write!(f, "#<primitive {}>", p.name.0),
            Value::Generic(id) => write!(f, "#<generic {}>", id.0),
            Value::Method(_) => write!(f, "#<method>"),
            Value::NextMethod(_) => write!(f, "#<next-method>"),
            Value::Exit(tag) => write!(f, "#<exit {}>", tag),
            Value::Values(vs) => write!(f, "#<values {:?}>", vs),
            Value::Instance(inst) => write!(f, "#<instance of {}>", inst.class.0),
            Value::Module(id) => write!(f, "#<module {}>", id.0),
            Value::Environment(env) => write!(f, "{:?}", env),
            Value::Condition(c) => write!(f, "#<condition {}>", c.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_of_small_values() {
        assert!(Value::Integer(7).id_eq(&Value::Integer(7)));
        assert!(Value::Float(1.5).id_eq(&Value::Float(1.5)));
        assert!(Value::Character('x').id_eq(&Value::Character('x')));
        assert!(!Value::Integer(1).id_eq(&Value::Float(1.0)));
    }

    #[test]
    fn test_identity_vs_structure() {
        let a = Value::string("abc");
        let b = Value::string("abc");
        assert!(!a.id_eq(&b));
        assert!(a.equal(&b));
        assert!(a.id_eq(&a.clone()));

        let l1 = Value::list(vec![Value::Integer(1), Value::string("x")]);
        let l2 = Value::list(vec![Value::Integer(1), Value::string("x")]);
        assert!(l1.equal(&l2));
        assert!(!l1.id_eq(&l2));
    }

    #[test]
    fn test_tag_is_stable() {
        let v = Value::vector(vec![Value::Integer(1)]);
        assert_eq!(v.tag(), Tag::Vector);
        if let Value::Vector(items) = &v {
            items.borrow_mut().push(Value::Boolean(true));
        }
        assert_eq!(v.tag(), Tag::Vector);
    }

    #[test]
    fn test_list_round_trip() {
        let items = vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)];
        let list = Value::list(items.clone());
        assert_eq!(list.list_to_vec(), Some(items));
        let improper = Value::pair(Value::Integer(1), Value::Integer(2));
        assert_eq!(improper.list_to_vec(), None);
    }

    #[test]
    fn test_long_lists_compare_and_drop_iteratively() {
        let build = || Value::list((0..1_000_000).map(Value::Integer).collect());
        let a = build();
        let b = build();
        assert!(a.equal(&b));
        let c = Value::list_with_tail((0..999_999).map(Value::Integer).collect(), Value::list(vec![Value::Integer(-1)]));
        assert!(!a.equal(&c));
        drop(a);
        drop(b);
        drop(c);
    }

    #[test]
    fn test_limited_integer_ranges() {
        let base = ClassId(3);
        let small = LimitedInteger { base, min: Some(0), max: Some(9) };
        let wide = LimitedInteger { base, min: Some(-10), max: None };
        assert!(small.contains(5));
        assert!(!small.contains(10));
        assert!(small.within(&wide));
        assert!(!wide.within(&small));
    }

    #[test]
    fn test_table_uses_structural_keys() {
        let t = Value::table();
        t.table_put(Value::string("k"), Value::Integer(1));
        t.table_put(Value::string("k"), Value::Integer(2));
        assert_eq!(t.table_get(&Value::string("k")), Some(Value::Integer(2)));
        assert_eq!(t.table_get(&Value::string("missing")), None);
    }
}
