// Marlais Slot Protocol
//
// Slot descriptors, instance allocation and typed slot storage. Getters and
// setters are ordinary methods whose bodies read and write through here.

use crate::clos::{ClassId, MetaObjectProtocol};
use crate::conditions::RuntimeError;
use crate::eval::{EvalResult, Interpreter};
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::{Instance, Value};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAllocation {
    Instance,
    Class,
}

/// How a slot gets its value when no init keyword supplies one
#[derive(Debug, Clone)]
pub enum SlotInit {
    None,
    /// Evaluated once when the class is defined
    Value(Value),
    /// Thunk called once per instantiation
    Function(Value),
}

#[derive(Debug, Clone)]
pub struct SlotDescriptor {
    pub name: SymbolId,
    /// Getter generic name, None for no getter
    pub getter: Option<SymbolId>,
    /// Setter generic name, None for no setter
    pub setter: Option<SymbolId>,
    pub type_constraint: Option<Value>,
    pub allocation: SlotAllocation,
    pub init: SlotInit,
    pub init_keyword: Option<SymbolId>,
    pub required_init_keyword: bool,
    /// Class that declared the slot
    pub owner: ClassId,
    /// Position in the instance slot vector, or in the owner's class storage
    pub index: usize,
}

impl SlotDescriptor {
    pub fn new(name: SymbolId) -> Self {
        Self {
            name,
            getter: None,
            setter: None,
            type_constraint: None,
            allocation: SlotAllocation::Instance,
            init: SlotInit::None,
            init_keyword: None,
            required_init_keyword: false,
            owner: ClassId::default(),
            index: 0,
        }
    }

    /// Default accessors: `name` and `name-setter`
    pub fn with_default_accessors(mut self, symbols: &mut SymbolTable) -> Self {
        let name = symbols.name_or_placeholder(self.name);
        self.getter = Some(self.name);
        self.setter = Some(symbols.intern(&format!("{}-setter", name)));
        self
    }
}

impl MetaObjectProtocol {
    /// A fresh instance whose slots are all uninitialized
    pub fn allocate_instance(&self, class: ClassId) -> Result<Rc<Instance>, RuntimeError> {
        let c = self
            .get_class(class)
            .ok_or_else(|| RuntimeError::simple("make: unknown class"))?;
        if c.flags.is_abstract || c.flags.uninstantiable {
            return Err(RuntimeError::AbstractInstantiation(c.display_name.clone()));
        }
        Ok(Rc::new(Instance {
            class,
            slots: RefCell::new(vec![Value::Uninitialized; c.instance_size]),
        }))
    }

    /// The effective slot of `class` declared by `owner` as `name`. A
    /// redeclaration in a subclass is found by name alone.
    pub fn effective_slot(&self, class: ClassId, owner: ClassId, name: SymbolId) -> Option<&SlotDescriptor> {
        let slots = &self.get_class(class)?.slots;
        slots
            .iter()
            .find(|s| s.owner == owner && s.name == name)
            .or_else(|| slots.iter().find(|s| s.name == name))
    }

    fn slot_for(&self, symbols: &SymbolTable, object: &Value, owner: ClassId, name: SymbolId) -> Result<SlotDescriptor, RuntimeError> {
        let class = self.class_of(object);
        self.effective_slot(class, owner, name).cloned().ok_or_else(|| {
            RuntimeError::simple(format!(
                "{} has no slot {}",
                self.describe_value(object),
                symbols.name_or_placeholder(name)
            ))
        })
    }

    pub fn slot_value(&self, symbols: &SymbolTable, object: &Value, owner: ClassId, name: SymbolId) -> Result<Value, RuntimeError> {
        let slot = self.slot_for(symbols, object, owner, name)?;
        let value = match slot.allocation {
            SlotAllocation::Class => self
                .get_class(slot.owner)
                .and_then(|c| c.class_values.borrow().get(slot.index).cloned()),
            SlotAllocation::Instance => match object {
                Value::Instance(inst) => inst.slots.borrow().get(slot.index).cloned(),
                _ => None,
            },
        };
        match value {
            Some(Value::Uninitialized) | None => Err(RuntimeError::SlotNotInitialized {
                slot: symbols.name_or_placeholder(name),
                class: self.class_name(self.class_of(object)).to_string(),
            }),
            Some(v) => Ok(v),
        }
    }

    pub fn set_slot_value(
        &self,
        symbols: &SymbolTable,
        object: &Value,
        owner: ClassId,
        name: SymbolId,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let slot = self.slot_for(symbols, object, owner, name)?;
        self.store_slot(object, &slot, value)
    }

    /// Type-checked store; the old value stays on failure
    pub fn store_slot(&self, object: &Value, slot: &SlotDescriptor, value: Value) -> Result<(), RuntimeError> {
        if let Some(ty) = &slot.type_constraint {
            self.check_type(&value, ty)?;
        }
        match slot.allocation {
            SlotAllocation::Class => {
                if let Some(class) = self.get_class(slot.owner) {
                    if let Some(cell) = class.class_values.borrow_mut().get_mut(slot.index) {
                        *cell = value;
                    }
                }
            }
            SlotAllocation::Instance => {
                if let Value::Instance(inst) = object {
                    if let Some(cell) = inst.slots.borrow_mut().get_mut(slot.index) {
                        *cell = value;
                    }
                }
            }
        }
        Ok(())
    }

    /// Value of `name` in an instance, looked up by name only
    pub fn slot_by_name(&self, object: &Value, name: SymbolId) -> Option<Value> {
        let class = self.get_class(self.class_of(object))?;
        let slot = class.slots.iter().find(|s| s.name == name)?;
        match (slot.allocation, object) {
            (SlotAllocation::Instance, Value::Instance(inst)) => inst.slots.borrow().get(slot.index).cloned(),
            (SlotAllocation::Class, _) => self
                .get_class(slot.owner)
                .and_then(|c| c.class_values.borrow().get(slot.index).cloned()),
            _ => None,
        }
    }
}

fn keyword_arg(initargs: &[Value], key: SymbolId) -> Option<Value> {
    initargs
        .chunks(2)
        .find(|pair| pair[0].as_symbol() == Some(key))
        .and_then(|pair| pair.get(1).cloned())
}

impl Interpreter<'_> {
    /// `make(class, key: value, ...)`: allocate, fill slots, call `initialize`
    pub fn make_instance(&mut self, class: ClassId, initargs: &[Value]) -> EvalResult {
        let instance = self.globals.mop.allocate_instance(class)?;
        if initargs.len() % 2 != 0 || initargs.chunks(2).any(|p| p[0].as_symbol().is_none()) {
            return Err(self.error_with(
                RuntimeError::simple("make: initialization arguments must be keyword/value pairs"),
                initargs.to_vec(),
            ));
        }
        let slots = self
            .globals
            .mop
            .get_class(class)
            .map(|c| c.slots.clone())
            .unwrap_or_default();
        let object = Value::Instance(instance);

        for slot in &slots {
            let supplied = slot.init_keyword.and_then(|k| keyword_arg(initargs, k));
            let value = match supplied {
                Some(v) => v,
                None if slot.required_init_keyword => {
                    let keyword = slot
                        .init_keyword
                        .map(|k| format!("{}:", self.globals.symbols.name_or_placeholder(k)))
                        .unwrap_or_default();
                    return Err(RuntimeError::MissingInitKeyword {
                        keyword,
                        class: self.globals.mop.class_name(class).to_string(),
                    }
                    .into());
                }
                // Class storage was initialised with the class
                None if slot.allocation == SlotAllocation::Class => continue,
                None => match &slot.init {
                    SlotInit::Value(v) => v.clone(),
                    SlotInit::Function(thunk) => {
                        let thunk = thunk.clone();
                        self.apply(&thunk, Vec::new())?
                    }
                    SlotInit::None => continue,
                },
            };
            self.globals.mop.store_slot(&object, slot, value)?;
        }

        let initialize = self
            .globals
            .modules
            .lookup(self.globals.dylan_module, self.globals.initialize_sym)
            .map(|b| b.get())
            .filter(Value::is_callable);
        if let Some(initialize) = initialize {
            let mut args = Vec::with_capacity(initargs.len() + 1);
            args.push(object.clone());
            args.extend_from_slice(initargs);
            self.apply(&initialize, args)?;
        }
        Ok(object)
    }
}
