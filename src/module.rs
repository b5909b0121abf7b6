// Marlais Module System
//
// Modules are named top-level namespaces. Each module owns its definitions,
// an export set, and the bindings it imported from other modules. Imported
// bindings are the exporter's cells, so assignments are visible on both sides.

use crate::conditions::RuntimeError;
use crate::environment::Binding;
use crate::symbol::{SymbolId, SymbolTable};
use crate::types::Value;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Unique identifier for a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// A binding visible through `use`
#[derive(Debug, Clone)]
pub struct Import {
    pub binding: Rc<Binding>,
    pub source: ModuleId,
    /// Name of the binding in the source module
    pub original: SymbolId,
}

#[derive(Debug)]
pub struct Module {
    pub name: SymbolId,
    definitions: HashMap<SymbolId, Rc<Binding>>,
    imports: HashMap<SymbolId, Import>,
    /// Local names (defined or imported) other modules may import
    exports: HashSet<SymbolId>,
    /// Modules used so far, in order
    used: Vec<ModuleId>,
}

impl Module {
    fn new(name: SymbolId) -> Self {
        Self {
            name,
            definitions: HashMap::new(),
            imports: HashMap::new(),
            exports: HashSet::new(),
            used: Vec::new(),
        }
    }

    pub fn is_exported(&self, name: SymbolId) -> bool {
        self.exports.contains(&name)
    }

    pub fn used_modules(&self) -> &[ModuleId] {
        &self.used
    }

    pub fn definition(&self, name: SymbolId) -> Option<&Rc<Binding>> {
        self.definitions.get(&name)
    }

    pub fn import(&self, name: SymbolId) -> Option<&Import> {
        self.imports.get(&name)
    }
}

/// Which names a `use` clause selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameSet {
    All,
    Only(Vec<SymbolId>),
}

/// Options of one `use` clause
#[derive(Debug, Clone)]
pub struct UseOptions {
    pub imports: NameSet,
    pub exclusions: Vec<SymbolId>,
    pub prefix: Option<String>,
    /// (source name, local name)
    pub renames: Vec<(SymbolId, SymbolId)>,
    /// Resulting local names to re-export
    pub exports: NameSet,
}

impl Default for UseOptions {
    fn default() -> Self {
        Self {
            imports: NameSet::All,
            exclusions: Vec::new(),
            prefix: None,
            renames: Vec::new(),
            exports: NameSet::Only(Vec::new()),
        }
    }
}

/// All modules of a runtime, keyed by name. Modules are never removed.
#[derive(Debug, Default)]
pub struct ModuleTable {
    modules: Vec<Module>,
    names: HashMap<SymbolId, ModuleId>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            names: HashMap::new(),
        }
    }

    /// Find a module by name, creating it on first mention
    pub fn get_or_create(&mut self, name: SymbolId) -> ModuleId {
        if let Some(&id) = self.names.get(&name) {
            return id;
        }
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(Module::new(name));
        self.names.insert(name, id);
        debug!("created module {:?} as {:?}", name, id);
        id
    }

    pub fn find(&self, name: SymbolId) -> Option<ModuleId> {
        self.names.get(&name).copied()
    }

    pub fn get(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.0 as usize)
    }

    fn get_mut(&mut self, id: ModuleId) -> Result<&mut Module, RuntimeError> {
        self.modules
            .get_mut(id.0 as usize)
            .ok_or_else(|| RuntimeError::simple(format!("no module with id {}", id.0)))
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// True when `module` itself holds a bound constant definition of `name`
    pub fn is_constant_definition(&self, module: ModuleId, name: SymbolId) -> bool {
        self.get(module)
            .and_then(|m| m.definitions.get(&name))
            .map_or(false, |b| b.is_constant() && b.is_bound())
    }

    /// Create or update a top-level definition. Callers that must not replace
    /// a constant check `is_constant_definition` first; `define-class` does not.
    pub fn define(
        &mut self,
        module: ModuleId,
        name: SymbolId,
        value: Value,
        constant: bool,
    ) -> Result<Rc<Binding>, RuntimeError> {
        let module = self.get_mut(module)?;
        if let Some(binding) = module.definitions.get(&name) {
            binding.set(value);
            binding.set_constant(constant);
            return Ok(binding.clone());
        }
        let binding = Rc::new(Binding::new(name, value, constant));
        binding.set_exported(module.exports.contains(&name));
        module.definitions.insert(name, binding.clone());
        Ok(binding)
    }

    /// Create or update a typed top-level variable. An existing binding is
    /// updated in place so importers keep sharing it.
    pub fn define_typed(
        &mut self,
        module: ModuleId,
        name: SymbolId,
        value: Value,
        type_constraint: Option<Value>,
        constant: bool,
    ) -> Result<Rc<Binding>, RuntimeError> {
        let binding = self.define(module, name, value, constant)?;
        binding.set_type_constraint(type_constraint);
        Ok(binding)
    }

    /// Add `name` to the export set. An exported name that is not defined
    /// yet gets an unbound placeholder, so importers share the later value.
    pub fn export(&mut self, module: ModuleId, name: SymbolId) -> Result<(), RuntimeError> {
        let module = self.get_mut(module)?;
        if !module.imports.contains_key(&name) {
            let binding = module
                .definitions
                .entry(name)
                .or_insert_with(|| Rc::new(Binding::unbound(name)));
            binding.set_exported(true);
        }
        module.exports.insert(name);
        Ok(())
    }

    /// Resolve a name at module level: definitions first, then imports
    pub fn lookup(&self, module: ModuleId, name: SymbolId) -> Option<Rc<Binding>> {
        let module = self.get(module)?;
        module
            .definitions
            .get(&name)
            .or_else(|| module.imports.get(&name).map(|i| &i.binding))
            .cloned()
    }

    fn exported_binding(&self, module: ModuleId, name: SymbolId) -> Option<Rc<Binding>> {
        let m = self.get(module)?;
        if m.exports.contains(&name) {
            self.lookup(module, name)
        } else {
            None
        }
    }

    pub fn exported_names(&self, module: ModuleId) -> Vec<SymbolId> {
        let mut names: Vec<SymbolId> = self
            .get(module)
            .map(|m| m.exports.iter().copied().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Import `source`'s exported bindings into `target`.
    ///
    /// Exclusions are applied before renames, and renames before the prefix.
    /// A name that is both imported and excluded is not visible. Using the
    /// same source again replaces everything previously imported from it.
    /// Returns the local names that became visible.
    pub fn use_module(
        &mut self,
        symbols: &mut SymbolTable,
        target: ModuleId,
        source: ModuleId,
        options: &UseOptions,
    ) -> Result<Vec<SymbolId>, RuntimeError> {
        let source_name = self
            .get(source)
            .map(|m| symbols.name_or_placeholder(m.name))
            .ok_or_else(|| RuntimeError::simple(format!("no module with id {}", source.0)))?;

        let candidates = match &options.imports {
            NameSet::All => self.exported_names(source),
            NameSet::Only(names) => {
                for &name in names {
                    if self.exported_binding(source, name).is_none() {
                        return Err(RuntimeError::simple(format!(
                            "{} is not exported by module {}",
                            symbols.name_or_placeholder(name),
                            source_name
                        )));
                    }
                }
                names.clone()
            }
        };

        let mut visible = Vec::new();
        for name in candidates {
            if options.exclusions.contains(&name) {
                continue;
            }
            let Some(binding) = self.exported_binding(source, name) else {
                continue;
            };
            let renamed = options
                .renames
                .iter()
                .find(|(from, _)| *from == name)
                .map(|(_, to)| *to)
                .unwrap_or(name);
            let local = match &options.prefix {
                Some(prefix) => {
                    let full = format!("{}{}", prefix, symbols.name_or_placeholder(renamed));
                    symbols.intern(&full)
                }
                None => renamed,
            };
            visible.push((
                local,
                Import {
                    binding,
                    source,
                    original: name,
                },
            ));
        }

        let module = self.get_mut(target)?;
        module.imports.retain(|_, import| import.source != source);
        let locals: Vec<SymbolId> = visible.iter().map(|(local, _)| *local).collect();
        for (local, import) in visible {
            module.imports.insert(local, import);
        }
        match &options.exports {
            NameSet::All => module.exports.extend(locals.iter().copied()),
            NameSet::Only(names) => {
                for name in names {
                    if locals.contains(name) {
                        module.exports.insert(*name);
                    }
                }
            }
        }
        if !module.used.contains(&source) {
            module.used.push(source);
        }
        debug!(
            "module {} uses {}: {} bindings visible",
            symbols.name_or_placeholder(module.name),
            source_name,
            locals.len()
        );
        Ok(locals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        symbols: SymbolTable,
        modules: ModuleTable,
        lib: ModuleId,
        app: ModuleId,
    }

    fn fixture() -> Fixture {
        let mut symbols = SymbolTable::new();
        let mut modules = ModuleTable::new();
        let lib = modules.get_or_create(symbols.intern("lib"));
        let app = modules.get_or_create(symbols.intern("app"));
        for (name, value) in [("x", 1), ("y", 2), ("z", 3)] {
            let sym = symbols.intern(name);
            modules.define(lib, sym, Value::Integer(value), false).unwrap();
            modules.export(lib, sym).unwrap();
        }
        modules
            .define(lib, symbols.intern("hidden"), Value::Integer(0), false)
            .unwrap();
        Fixture {
            symbols,
            modules,
            lib,
            app,
        }
    }

    #[test]
    fn test_lazy_creation_is_idempotent() {
        let mut f = fixture();
        let name = f.symbols.intern("lib");
        assert_eq!(f.modules.get_or_create(name), f.lib);
        assert_eq!(f.modules.module_count(), 2);
    }

    #[test]
    fn test_excluded_import_is_invisible() {
        let mut f = fixture();
        let x = f.symbols.intern("x");
        let options = UseOptions {
            imports: NameSet::Only(vec![x]),
            exclusions: vec![x],
            ..UseOptions::default()
        };
        let visible = f
            .modules
            .use_module(&mut f.symbols, f.app, f.lib, &options)
            .unwrap();
        assert!(visible.is_empty());
        assert!(f.modules.lookup(f.app, x).is_none());
    }

    #[test]
    fn test_rename_then_prefix() {
        let mut f = fixture();
        let x = f.symbols.intern("x");
        let y = f.symbols.intern("y");
        let ex = f.symbols.intern("ex");
        let options = UseOptions {
            imports: NameSet::Only(vec![x, y]),
            prefix: Some("lib/".into()),
            renames: vec![(x, ex)],
            ..UseOptions::default()
        };
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &options)
            .unwrap();
        let renamed = f.symbols.find("lib/ex").unwrap();
        let prefixed = f.symbols.find("lib/y").unwrap();
        assert_eq!(f.modules.lookup(f.app, renamed).unwrap().get(), Value::Integer(1));
        assert_eq!(f.modules.lookup(f.app, prefixed).unwrap().get(), Value::Integer(2));
        assert!(f.modules.lookup(f.app, x).is_none());
        let import = f.modules.get(f.app).unwrap().import(renamed).unwrap();
        assert_eq!(import.original, x);
        assert_eq!(import.source, f.lib);
    }

    #[test]
    fn test_imported_binding_is_shared() {
        let mut f = fixture();
        let z = f.symbols.intern("z");
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &UseOptions::default())
            .unwrap();
        f.modules.lookup(f.lib, z).unwrap().set(Value::Integer(30));
        assert_eq!(f.modules.lookup(f.app, z).unwrap().get(), Value::Integer(30));
    }

    #[test]
    fn test_only_exported_names_are_importable() {
        let mut f = fixture();
        let hidden = f.symbols.intern("hidden");
        let options = UseOptions {
            imports: NameSet::Only(vec![hidden]),
            ..UseOptions::default()
        };
        assert!(f
            .modules
            .use_module(&mut f.symbols, f.app, f.lib, &options)
            .is_err());
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &UseOptions::default())
            .unwrap();
        assert!(f.modules.lookup(f.app, hidden).is_none());
    }

    #[test]
    fn test_reuse_replaces_previous_imports() {
        let mut f = fixture();
        let x = f.symbols.intern("x");
        let y = f.symbols.intern("y");
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &UseOptions::default())
            .unwrap();
        assert!(f.modules.lookup(f.app, x).is_some());

        let options = UseOptions {
            imports: NameSet::Only(vec![y]),
            ..UseOptions::default()
        };
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &options)
            .unwrap();
        assert!(f.modules.lookup(f.app, x).is_none());
        assert!(f.modules.lookup(f.app, y).is_some());
        assert_eq!(f.modules.get(f.app).unwrap().used_modules(), &[f.lib]);
    }

    #[test]
    fn test_reexport_through_intermediate_module() {
        let mut f = fixture();
        let y = f.symbols.intern("y");
        let outer = f.modules.get_or_create(f.symbols.intern("outer"));
        let options = UseOptions {
            exports: NameSet::Only(vec![y]),
            ..UseOptions::default()
        };
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &options)
            .unwrap();
        f.modules
            .use_module(&mut f.symbols, outer, f.app, &UseOptions::default())
            .unwrap();
        assert_eq!(f.modules.lookup(outer, y).unwrap().get(), Value::Integer(2));
        assert!(f.modules.lookup(outer, f.symbols.find("x").unwrap()).is_none());
    }

    #[test]
    fn test_exported_placeholder_is_shared_after_definition() {
        let mut f = fixture();
        let later = f.symbols.intern("later");
        f.modules.export(f.lib, later).unwrap();
        f.modules
            .use_module(&mut f.symbols, f.app, f.lib, &UseOptions::default())
            .unwrap();
        assert!(!f.modules.lookup(f.app, later).unwrap().is_bound());
        f.modules.define(f.lib, later, Value::Integer(9), true).unwrap();
        assert_eq!(f.modules.lookup(f.app, later).unwrap().get(), Value::Integer(9));
    }
}
