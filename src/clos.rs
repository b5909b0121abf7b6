// Marlais Object System - classes, types and generic functions
//
// Classes, generic functions and the subtype relation. Class precedence is
// computed with one of two linearizations; method selection lives in
// dispatch.rs and slot storage in slots.rs.

use crate::conditions::{Condition, ConditionKind, RuntimeError};
use crate::dispatch::DispatchKey;
use crate::environment::Environment;
use crate::slots::{SlotAllocation, SlotDescriptor, SlotInit};
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::Value;
use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::str::FromStr;

/// Unique identifier for a class (allocated in increasing order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ClassId(pub u32);

/// Unique identifier for a generic function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericId(pub u32);

/// Class precedence list algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linearization {
    /// Topological sort of local precedence orders, CLOS tie-breaking
    #[default]
    Clos,
    /// Depth-first walk keeping last occurrences
    LocalPrecedence,
}

impl FromStr for Linearization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clos" => Ok(Linearization::Clos),
            "local" | "local-precedence" => Ok(Linearization::LocalPrecedence),
            other => Err(format!("unknown linearization '{}' (expected clos or local)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassFlags {
    pub is_abstract: bool,
    pub primary: bool,
    pub sealed: bool,
    pub uninstantiable: bool,
}

/// A class definition
#[derive(Debug)]
pub struct Class {
    pub id: ClassId,
    pub name: SymbolId,
    /// Printed name, kept so errors can be rendered without the symbol table
    pub display_name: String,
    /// Direct superclasses, in local precedence order
    pub supers: Vec<ClassId>,
    /// Class precedence list (self first)
    pub cpl: Vec<ClassId>,
    pub direct_slots: Vec<SlotDescriptor>,
    /// Effective slots, inherited first in reverse precedence order
    pub slots: Vec<SlotDescriptor>,
    /// Number of instance-allocated slots
    pub instance_size: usize,
    /// Storage of the class-allocated slots this class declares
    pub class_values: RefCell<Vec<Value>>,
    pub flags: ClassFlags,
    pub direct_subclasses: Vec<ClassId>,
    /// Generics with a method specialized on this class
    pub generics: Vec<GenericId>,
}

/// A `#key` parameter
#[derive(Debug, Clone)]
pub struct KeyParam {
    pub keyword: SymbolId,
    pub var: SymbolId,
    /// Default expression, evaluated in the method's new frame
    pub default: Option<Value>,
}

/// A method's parameter list beyond its specializers
#[derive(Debug, Clone, Default)]
pub struct ParamList {
    pub required: Vec<SymbolId>,
    pub rest: Option<SymbolId>,
    pub keys: Option<Vec<KeyParam>>,
    pub all_keys: bool,
}

impl ParamList {
    pub fn accepts_optionals(&self) -> bool {
        self.rest.is_some() || self.keys.is_some()
    }
}

pub enum MethodBody {
    /// A `begin` form closed over its defining environment
    Code { body: Value, env: Environment },
    SlotGetter { owner: ClassId, slot: SymbolId },
    SlotSetter { owner: ClassId, slot: SymbolId },
}

pub struct Method {
    pub name: Option<SymbolId>,
    /// One type per required parameter
    pub specializers: Vec<Value>,
    pub params: ParamList,
    pub body: MethodBody,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("specializers", &self.specializers)
            .finish()
    }
}

/// A generic function
#[derive(Debug)]
pub struct GenericFunction {
    pub id: GenericId,
    pub name: SymbolId,
    pub display_name: String,
    pub required: usize,
    pub rest: bool,
    pub keys: bool,
    /// Methods in definition order
    pub methods: Vec<Rc<Method>>,
    /// Argument classes -> sorted applicable methods
    pub method_cache: HashMap<DispatchKey, Rc<[Rc<Method>]>>,
    /// Some method uses a singleton, limited or union-of-those specializer
    pub value_dispatch: bool,
}

/// Handles of the classes created at boot
#[derive(Debug, Clone, Default)]
pub struct BuiltinClasses {
    pub object: ClassId,
    pub type_class: ClassId,
    pub class: ClassId,
    pub singleton: ClassId,
    pub subclass: ClassId,
    pub limited_integer: ClassId,
    pub union: ClassId,
    pub number: ClassId,
    pub real: ClassId,
    pub integer: ClassId,
    pub float: ClassId,
    pub character: ClassId,
    pub boolean: ClassId,
    pub symbol: ClassId,
    pub collection: ClassId,
    pub sequence: ClassId,
    pub list: ClassId,
    pub pair: ClassId,
    pub empty_list: ClassId,
    pub vector: ClassId,
    pub string: ClassId,
    pub byte_vector: ClassId,
    pub table: ClassId,
    pub function: ClassId,
    pub generic_function: ClassId,
    pub method: ClassId,
    pub primitive: ClassId,
    pub slot_descriptor: ClassId,
    pub module: ClassId,
    pub environment: ClassId,
    pub eof: ClassId,
    pub unspecified: ClassId,
    pub condition: ClassId,
    pub serious_condition: ClassId,
    pub error: ClassId,
    pub simple_error: ClassId,
    pub type_error: ClassId,
    pub warning: ClassId,
    pub simple_warning: ClassId,
    pub restart: ClassId,
    pub simple_restart: ClassId,
    pub abort: ClassId,
}

/// The object system of one runtime
pub struct MetaObjectProtocol {
    classes: Vec<Class>,
    generics: Vec<GenericFunction>,
    pub linearization: Linearization,
    pub builtin: BuiltinClasses,
}

impl MetaObjectProtocol {
    pub fn new(symbols: &mut SymbolTable, linearization: Linearization) -> Self {
        let mut mop = Self {
            classes: Vec::new(),
            generics: Vec::new(),
            linearization,
            builtin: BuiltinClasses::default(),
        };

        // Bootstrap the built-in hierarchy. Every built-in class has a single
        // superclass, so the CPL is the class followed by its super's CPL.
        let object = mop.bootstrap_class(symbols, "<object>", None, false);
        let type_class = mop.bootstrap_class(symbols, "<type>", Some(object), true);
        let class = mop.bootstrap_class(symbols, "<class>", Some(type_class), true);
        let singleton = mop.bootstrap_class(symbols, "<singleton>", Some(type_class), true);
        let subclass = mop.bootstrap_class(symbols, "<subclass>", Some(type_class), true);
        let limited_integer = mop.bootstrap_class(symbols, "<limited-integer>", Some(type_class), true);
        let union = mop.bootstrap_class(symbols, "<union>", Some(type_class), true);

        let number = mop.bootstrap_class(symbols, "<number>", Some(object), true);
        let real = mop.bootstrap_class(symbols, "<real>", Some(number), true);
        let integer = mop.bootstrap_class(symbols, "<integer>", Some(real), true);
        let float = mop.bootstrap_class(symbols, "<float>", Some(real), true);
        let character = mop.bootstrap_class(symbols, "<character>", Some(object), true);
        let boolean = mop.bootstrap_class(symbols, "<boolean>", Some(object), true);
        let symbol = mop.bootstrap_class(symbols, "<symbol>", Some(object), true);

        let collection = mop.bootstrap_class(symbols, "<collection>", Some(object), true);
        let sequence = mop.bootstrap_class(symbols, "<sequence>", Some(collection), true);
        let list = mop.bootstrap_class(symbols, "<list>", Some(sequence), true);
        let pair = mop.bootstrap_class(symbols, "<pair>", Some(list), true);
        let empty_list = mop.bootstrap_class(symbols, "<empty-list>", Some(list), true);
        let vector = mop.bootstrap_class(symbols, "<vector>", Some(sequence), true);
        let string = mop.bootstrap_class(symbols, "<string>", Some(sequence), true);
        let byte_vector = mop.bootstrap_class(symbols, "<byte-vector>", Some(vector), true);
        let table = mop.bootstrap_class(symbols, "<table>", Some(collection), true);

        let function = mop.bootstrap_class(symbols, "<function>", Some(object), true);
        let generic_function = mop.bootstrap_class(symbols, "<generic-function>", Some(function), true);
        let method = mop.bootstrap_class(symbols, "<method>", Some(function), true);
        let primitive = mop.bootstrap_class(symbols, "<primitive>", Some(function), true);

        let slot_descriptor = mop.bootstrap_class(symbols, "<slot-descriptor>", Some(object), true);
        let module = mop.bootstrap_class(symbols, "<module>", Some(object), true);
        let environment = mop.bootstrap_class(symbols, "<environment>", Some(object), true);
        let eof = mop.bootstrap_class(symbols, "<eof-object>", Some(object), true);
        let unspecified = mop.bootstrap_class(symbols, "<unspecified-object>", Some(object), true);

        // Conditions carry a `message` slot filled by the `message:` keyword
        let condition = mop.bootstrap_class(symbols, "<condition>", Some(object), false);
        let message = symbols.intern("message");
        let mut message_slot = SlotDescriptor::new(message);
        message_slot.init = SlotInit::Value(Value::string(""));
        message_slot.init_keyword = Some(message);
        message_slot.owner = condition;
        if let Some(c) = mop.classes.get_mut(condition.0 as usize) {
            c.direct_slots = vec![message_slot.clone()];
            c.slots = vec![message_slot];
            c.instance_size = 1;
        }
        let serious_condition = mop.bootstrap_class(symbols, "<serious-condition>", Some(condition), false);
        let error = mop.bootstrap_class(symbols, "<error>", Some(serious_condition), false);
        let simple_error = mop.bootstrap_class(symbols, "<simple-error>", Some(error), false);
        let type_error = mop.bootstrap_class(symbols, "<type-error>", Some(error), false);
        let warning = mop.bootstrap_class(symbols, "<warning>", Some(condition), false);
        let simple_warning = mop.bootstrap_class(symbols, "<simple-warning>", Some(warning), false);
        let restart = mop.bootstrap_class(symbols, "<restart>", Some(condition), false);
        let simple_restart = mop.bootstrap_class(symbols, "<simple-restart>", Some(restart), false);
        let abort = mop.bootstrap_class(symbols, "<abort>", Some(restart), false);

        mop.builtin = BuiltinClasses {
            object,
            type_class,
            class,
            singleton,
            subclass,
            limited_integer,
            union,
            number,
            real,
            integer,
            float,
            character,
            boolean,
            symbol,
            collection,
            sequence,
            list,
            pair,
            empty_list,
            vector,
            string,
            byte_vector,
            table,
            function,
            generic_function,
            method,
            primitive,
            slot_descriptor,
            module,
            environment,
            eof,
            unspecified,
            condition,
            serious_condition,
            error,
            simple_error,
            type_error,
            warning,
            simple_warning,
            restart,
            simple_restart,
            abort,
        };
        mop
    }

    fn bootstrap_class(
        &mut self,
        symbols: &mut SymbolTable,
        name: &str,
        superclass: Option<ClassId>,
        uninstantiable: bool,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        let name_sym = symbols.intern(name);
        let mut cpl = vec![id];
        let mut supers = Vec::new();
        let mut slots = Vec::new();
        let mut instance_size = 0;
        if let Some(sup) = superclass.and_then(|s| self.classes.get_mut(s.0 as usize)) {
            supers.push(sup.id);
            cpl.extend(sup.cpl.iter().copied());
            slots = sup.slots.clone();
            instance_size = sup.instance_size;
            sup.direct_subclasses.push(id);
        }
        self.classes.push(Class {
            id,
            name: name_sym,
            display_name: name.to_string(),
            supers,
            cpl,
            direct_slots: Vec::new(),
            slots,
            instance_size,
            class_values: RefCell::new(Vec::new()),
            flags: ClassFlags {
                uninstantiable,
                ..ClassFlags::default()
            },
            direct_subclasses: Vec::new(),
            generics: Vec::new(),
        });
        id
    }

    /// Define a new class. Each call allocates a fresh index, so redefining a
    /// name leaves existing instances with their old class.
    pub fn define_class(
        &mut self,
        symbols: &SymbolTable,
        name: SymbolId,
        supers: Vec<ClassId>,
        direct_slots: Vec<SlotDescriptor>,
        flags: ClassFlags,
    ) -> Result<ClassId, RuntimeError> {
        let display_name = symbols.name_or_placeholder(name);
        if supers.is_empty() {
            return Err(RuntimeError::simple(format!(
                "class {} must have at least one superclass",
                display_name
            )));
        }
        for &sup in &supers {
            let class = self.get_class(sup).ok_or_else(|| {
                RuntimeError::simple(format!("unknown superclass of {}", display_name))
            })?;
            if class.flags.sealed {
                return Err(RuntimeError::SealedClass(class.display_name.clone()));
            }
        }

        let id = ClassId(self.classes.len() as u32);
        let cpl = self.compute_cpl(id, &display_name, &supers)?;

        // Own slots: instance slots are numbered later, class slots index
        // into this class's storage.
        let mut own_slots = direct_slots;
        let mut class_slot_count = 0;
        for slot in own_slots.iter_mut() {
            slot.owner = id;
            if slot.allocation == SlotAllocation::Class {
                slot.index = class_slot_count;
                class_slot_count += 1;
            }
        }

        let mut effective: Vec<SlotDescriptor> = Vec::new();
        for &cid in cpl.iter().skip(1).rev() {
            if let Some(class) = self.get_class(cid) {
                for slot in &class.direct_slots {
                    Self::merge_slot(&mut effective, slot.clone());
                }
            }
        }
        for slot in &own_slots {
            Self::merge_slot(&mut effective, slot.clone());
        }
        let mut instance_size = 0;
        for slot in effective.iter_mut() {
            if slot.allocation == SlotAllocation::Instance {
                slot.index = instance_size;
                instance_size += 1;
            }
        }
        // Own descriptors carry their instance positions too
        for slot in own_slots.iter_mut() {
            if let Some(eff) = effective
                .iter()
                .find(|s| s.owner == id && s.name == slot.name)
            {
                slot.index = eff.index;
            }
        }

        self.classes.push(Class {
            id,
            name,
            display_name: display_name.clone(),
            supers: supers.clone(),
            cpl: cpl.clone(),
            direct_slots: own_slots,
            slots: effective,
            instance_size,
            class_values: RefCell::new(vec![Value::Uninitialized; class_slot_count]),
            flags,
            direct_subclasses: Vec::new(),
            generics: Vec::new(),
        });
        for sup in &supers {
            if let Some(class) = self.classes.get_mut(sup.0 as usize) {
                class.direct_subclasses.push(id);
            }
        }

        // Generics specialized on any ancestor may now see a new argument class
        let mut stale: Vec<GenericId> = Vec::new();
        for cid in cpl.iter().skip(1) {
            if let Some(class) = self.get_class(*cid) {
                for gid in &class.generics {
                    if !stale.contains(gid) {
                        stale.push(*gid);
                    }
                }
            }
        }
        for gid in stale {
            self.clear_method_cache(gid);
        }

        debug!("defined class {} as {:?} with cpl {:?}", display_name, id, cpl);
        Ok(id)
    }

    /// A slot redeclared by a more specific class replaces the inherited one in place
    fn merge_slot(effective: &mut Vec<SlotDescriptor>, slot: SlotDescriptor) {
        match effective.iter().position(|s| s.name == slot.name) {
            Some(pos) => effective[pos] = slot,
            None => effective.push(slot),
        }
    }

    fn compute_cpl(
        &self,
        id: ClassId,
        display_name: &str,
        supers: &[ClassId],
    ) -> Result<Vec<ClassId>, RuntimeError> {
        let cpl = match self.linearization {
            Linearization::Clos => self.clos_linearization(id, supers),
            Linearization::LocalPrecedence => self.local_precedence_linearization(id, supers),
        };
        cpl.ok_or_else(|| RuntimeError::InconsistentPrecedence(display_name.to_string()))
    }

    /// Direct supers of `cid`, treating `id` as the class being defined
    fn direct_supers<'a>(&'a self, cid: ClassId, id: ClassId, supers: &'a [ClassId]) -> &'a [ClassId] {
        if cid == id {
            supers
        } else {
            self.get_class(cid).map(|c| c.supers.as_slice()).unwrap_or(&[])
        }
    }

    fn clos_linearization(&self, id: ClassId, supers: &[ClassId]) -> Option<Vec<ClassId>> {
        // Every class involved, in discovery order
        let mut remaining = vec![id];
        for sup in supers {
            for &c in self.cpl(*sup) {
                if !remaining.contains(&c) {
                    remaining.push(c);
                }
            }
        }

        // Local precedence orders: each class precedes its first direct
        // super, and each direct super precedes the next one.
        let mut constraints: Vec<(ClassId, ClassId)> = Vec::new();
        for &c in &remaining {
            let mut prev = c;
            for &s in self.direct_supers(c, id, supers) {
                constraints.push((prev, s));
                prev = s;
            }
        }

        let mut result: Vec<ClassId> = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let candidates: Vec<ClassId> = remaining
                .iter()
                .copied()
                .filter(|&c| {
                    !constraints
                        .iter()
                        .any(|&(before, after)| after == c && remaining.contains(&before))
                })
                .collect();
            let chosen = match candidates.len() {
                0 => return None,
                1 => candidates[0],
                _ => {
                    // Prefer the candidate that is a direct super of the
                    // rightmost class already placed.
                    result
                        .iter()
                        .rev()
                        .find_map(|&placed| {
                            let direct = self.direct_supers(placed, id, supers);
                            candidates.iter().copied().find(|c| direct.contains(c))
                        })
                        .unwrap_or(candidates[0])
                }
            };
            remaining.retain(|&c| c != chosen);
            constraints.retain(|&(before, _)| before != chosen);
            result.push(chosen);
        }
        Some(result)
    }

    fn local_precedence_linearization(&self, id: ClassId, supers: &[ClassId]) -> Option<Vec<ClassId>> {
        let mut walk = vec![id];
        for sup in supers {
            walk.extend(self.cpl(*sup).iter().copied());
        }
        let mut result = Vec::with_capacity(walk.len());
        for (i, c) in walk.iter().enumerate() {
            if !walk[i + 1..].contains(c) {
                result.push(*c);
            }
        }
        // The class's own direct-superclass order must survive
        let positions: Vec<usize> = supers
            .iter()
            .filter_map(|s| result.iter().position(|c| c == s))
            .collect();
        if positions.windows(2).all(|w| w[0] < w[1]) {
            Some(result)
        } else {
            None
        }
    }

    /// Find class by ID
    pub fn get_class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.0 as usize)
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter()
    }

    pub fn cpl(&self, id: ClassId) -> &[ClassId] {
        self.get_class(id).map(|c| c.cpl.as_slice()).unwrap_or(&[])
    }

    pub fn class_name(&self, id: ClassId) -> &str {
        self.get_class(id)
            .map(|c| c.display_name.as_str())
            .unwrap_or("<unknown>")
    }

    /// Forbid further subclassing
    pub fn seal(&mut self, id: ClassId) -> Result<(), RuntimeError> {
        let class = self
            .classes
            .get_mut(id.0 as usize)
            .ok_or_else(|| RuntimeError::simple("seal: unknown class"))?;
        class.flags.sealed = true;
        Ok(())
    }

    pub fn is_subclass(&self, sub: ClassId, sup: ClassId) -> bool {
        self.cpl(sub).contains(&sup)
    }

    /// Class of any value
    pub fn class_of(&self, value: &Value) -> ClassId {
        let b = &self.builtin;
        match value {
            Value::Boolean(_) => b.boolean,
            Value::EmptyList => b.empty_list,
            Value::Eof => b.eof,
            Value::Unspecified | Value::Uninitialized => b.unspecified,
            Value::Character(_) => b.character,
            Value::Integer(_) => b.integer,
            Value::Float(_) => b.float,
            Value::Name(_) | Value::Symbol(_) => b.symbol,
            Value::Pair(_) => b.pair,
            Value::Vector(_) => b.vector,
            Value::Table(_) => b.table,
            Value::ByteVector(_) => b.byte_vector,
            Value::String(_) => b.string,
            Value::Class(_) => b.class,
            Value::Singleton(_) => b.singleton,
            Value::Subclass(_) => b.subclass,
            Value::LimitedInteger(_) => b.limited_integer,
            Value::Union(_) => b.union,
            Value::SlotDescriptor(..) => b.slot_descriptor,
            Value::Primitive(_) => b.primitive,
            Value::Generic(_) => b.generic_function,
            Value::Method(_) => b.method,
            Value::NextMethod(_) | Value::Exit(_) => b.function,
            Value::Values(_) => b.object,
            Value::Instance(inst) => inst.class,
            Value::Module(_) => b.module,
            Value::Environment(_) => b.environment,
            Value::Condition(c) => self.condition_class(c),
        }
    }

    pub fn condition_class(&self, condition: &Condition) -> ClassId {
        if let Some(Value::Instance(inst)) = &condition.payload {
            return inst.class;
        }
        let b = &self.builtin;
        match condition.kind {
            ConditionKind::SimpleError => b.simple_error,
            ConditionKind::TypeError => b.type_error,
            ConditionKind::SimpleWarning => b.simple_warning,
            ConditionKind::SimpleRestart => b.simple_restart,
            ConditionKind::Abort => b.abort,
        }
    }

    /// Condition kind implied by a condition class
    pub fn kind_for_class(&self, class: ClassId) -> ConditionKind {
        let b = &self.builtin;
        if self.is_subclass(class, b.type_error) {
            ConditionKind::TypeError
        } else if self.is_subclass(class, b.serious_condition) {
            ConditionKind::SimpleError
        } else if self.is_subclass(class, b.abort) {
            ConditionKind::Abort
        } else if self.is_subclass(class, b.restart) {
            ConditionKind::SimpleRestart
        } else {
            ConditionKind::SimpleWarning
        }
    }

    /// `instance?(value, type)`
    pub fn instance_of(&self, value: &Value, ty: &Value) -> bool {
        match ty {
            Value::Class(c) => self.is_subclass(self.class_of(value), *c),
            Value::Singleton(x) => value.id_eq(x),
            Value::Subclass(c) => match value {
                Value::Class(k) => self.is_subclass(*k, *c),
                _ => false,
            },
            Value::LimitedInteger(l) => match value {
                Value::Integer(n) => l.contains(*n) && self.is_subclass(self.builtin.integer, l.base),
                _ => false,
            },
            Value::Union(members) => members.iter().any(|m| self.instance_of(value, m)),
            _ => false,
        }
    }

    /// `subtype?(a, b)`
    pub fn subtype_of(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Union(members), _) => members.iter().all(|m| self.subtype_of(m, b)),
            (_, Value::Union(members)) => members.iter().any(|m| self.subtype_of(a, m)),
            (Value::Singleton(x), _) => self.instance_of(x, b),
            (Value::Class(c), Value::Class(d)) => self.is_subclass(*c, *d),
            (Value::Subclass(c), Value::Subclass(d)) => self.is_subclass(*c, *d),
            (Value::Subclass(_), Value::Class(d)) => self.is_subclass(self.builtin.class, *d),
            (Value::LimitedInteger(l), Value::Class(d)) => self.is_subclass(l.base, *d),
            (Value::LimitedInteger(l1), Value::LimitedInteger(l2)) => {
                self.is_subclass(l1.base, l2.base) && l1.within(l2)
            }
            _ => false,
        }
    }

    /// Printed form of a type
    pub fn type_name(&self, ty: &Value) -> String {
        match ty {
            Value::Class(c) => self.class_name(*c).to_string(),
            Value::Singleton(v) => format!("singleton({})", self.describe_value(v)),
            Value::Subclass(c) => format!("subclass({})", self.class_name(*c)),
            Value::LimitedInteger(l) => {
                let mut s = format!("limited({}", self.class_name(l.base));
                if let Some(min) = l.min {
                    s.push_str(&format!(", min: {}", min));
                }
                if let Some(max) = l.max {
                    s.push_str(&format!(", max: {}", max));
                }
                s.push(')');
                s
            }
            Value::Union(members) => {
                let names: Vec<String> = members.iter().map(|m| self.type_name(m)).collect();
                format!("type-union({})", names.join(", "))
            }
            other => self.describe_value(other),
        }
    }

    /// Short description of a value for error messages
    pub fn describe_value(&self, value: &Value) -> String {
        match value {
            Value::Boolean(_)
            | Value::EmptyList
            | Value::Character(_)
            | Value::Integer(_)
            | Value::Float(_)
            | Value::String(_) => format!("{:?}", value),
            Value::Class(c) => self.class_name(*c).to_string(),
            Value::Generic(g) => self
                .get_generic(*g)
                .map(|g| g.display_name.clone())
                .unwrap_or_else(|| "#<generic>".to_string()),
            other => format!("{{instance of {}}}", self.class_name(self.class_of(other))),
        }
    }

    pub fn check_type(&self, value: &Value, ty: &Value) -> Result<(), RuntimeError> {
        if self.instance_of(value, ty) {
            Ok(())
        } else {
            Err(RuntimeError::TypeCheck {
                value: self.describe_value(value),
                expected: self.type_name(ty),
            })
        }
    }

    // Generic functions

    pub fn define_generic(
        &mut self,
        symbols: &SymbolTable,
        name: SymbolId,
        required: usize,
        rest: bool,
        keys: bool,
    ) -> GenericId {
        let id = GenericId(self.generics.len() as u32);
        let display_name = symbols.name_or_placeholder(name);
        debug!("defined generic {} as {:?} ({} required)", display_name, id, required);
        self.generics.push(GenericFunction {
            id,
            name,
            display_name,
            required,
            rest,
            keys,
            methods: Vec::new(),
            method_cache: HashMap::new(),
            value_dispatch: false,
        });
        id
    }

    pub fn get_generic(&self, id: GenericId) -> Option<&GenericFunction> {
        self.generics.get(id.0 as usize)
    }

    pub(crate) fn generic(&self, id: GenericId) -> Result<&GenericFunction, RuntimeError> {
        self.get_generic(id)
            .ok_or_else(|| RuntimeError::simple(format!("no generic function with id {}", id.0)))
    }

    pub(crate) fn generic_mut(&mut self, id: GenericId) -> Result<&mut GenericFunction, RuntimeError> {
        self.generics
            .get_mut(id.0 as usize)
            .ok_or_else(|| RuntimeError::simple(format!("no generic function with id {}", id.0)))
    }

    /// Redeclare a generic's parameter shape. The required count can only
    /// change while the generic has no methods.
    pub fn set_generic_signature(
        &mut self,
        id: GenericId,
        required: usize,
        rest: bool,
        keys: bool,
    ) -> Result<(), RuntimeError> {
        let generic = self.generic_mut(id)?;
        if generic.required != required && !generic.methods.is_empty() {
            return Err(RuntimeError::Arity {
                callee: generic.display_name.clone(),
                expected: format!("{} required parameters", generic.required),
                got: required,
            });
        }
        generic.required = required;
        generic.rest = rest;
        generic.keys = keys;
        generic.method_cache.clear();
        Ok(())
    }

    pub fn generic_methods(&self, id: GenericId) -> &[Rc<Method>] {
        self.get_generic(id).map(|g| g.methods.as_slice()).unwrap_or(&[])
    }

    pub fn clear_method_cache(&mut self, id: GenericId) {
        if let Some(g) = self.generics.get_mut(id.0 as usize) {
            g.method_cache.clear();
        }
    }

    /// Add a method, replacing one with identical specializers. Clears the cache.
    pub fn add_method(&mut self, id: GenericId, method: Rc<Method>) -> Result<(), RuntimeError> {
        let generic = self.generic(id)?;
        let got = method.specializers.len();
        if got != generic.required {
            return Err(RuntimeError::Arity {
                callee: generic.display_name.clone(),
                expected: format!("a method with {} required parameters", generic.required),
                got,
            });
        }

        let mut classes = Vec::new();
        for spec in &method.specializers {
            self.specializer_classes(spec, &mut classes);
        }

        let generic = self.generic_mut(id)?;
        let existing = generic.methods.iter().position(|m| {
            m.specializers.len() == method.specializers.len()
                && m.specializers
                    .iter()
                    .zip(method.specializers.iter())
                    .all(|(a, b)| a.equal(b))
        });
        match existing {
            Some(pos) => generic.methods[pos] = method,
            None => generic.methods.push(method),
        }
        generic.method_cache.clear();
        generic.value_dispatch = generic
            .methods
            .iter()
            .any(|m| m.specializers.iter().any(Value::is_value_dependent_type));
        debug!(
            "added method to {} ({} methods)",
            generic.display_name,
            generic.methods.len()
        );

        for cid in classes {
            if let Some(class) = self.classes.get_mut(cid.0 as usize) {
                if !class.generics.contains(&id) {
                    class.generics.push(id);
                }
            }
        }
        Ok(())
    }

    fn specializer_classes(&self, spec: &Value, out: &mut Vec<ClassId>) {
        match spec {
            Value::Class(c) | Value::Subclass(c) => out.push(*c),
            Value::LimitedInteger(l) => out.push(l.base),
            Value::Singleton(v) => out.push(self.class_of(v)),
            Value::Union(members) => {
                for m in members.iter() {
                    self.specializer_classes(m, out);
                }
            }
            _ => {}
        }
    }
}
