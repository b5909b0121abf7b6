// Marlais Symbol Table
//
// Interns identifiers and symbols with O(1) comparison. Dylan names are
// case-insensitive, so every name is folded to lower case on the way in.

use std::collections::HashMap;

/// Unique identifier for a symbol (index into symbol table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

/// The symbol table owned by one runtime
#[derive(Debug, Default)]
pub struct SymbolTable {
    /// Folded names indexed by SymbolId
    names: Vec<String>,
    /// Folded name -> SymbolId lookup
    ids: HashMap<String, SymbolId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a name, returning the existing id if it was seen before
    pub fn intern(&mut self, name: &str) -> SymbolId {
        let folded = name.to_lowercase();
        if let Some(&id) = self.ids.get(&folded) {
            return id;
        }
        let id = SymbolId(self.names.len() as u32);
        self.names.push(folded.clone());
        self.ids.insert(folded, id);
        id
    }

    /// Look a name up without interning it
    pub fn find(&self, name: &str) -> Option<SymbolId> {
        self.ids.get(&name.to_lowercase()).copied()
    }

    /// Get the name of a symbol
    pub fn symbol_name(&self, id: SymbolId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    /// Name of a symbol, or a placeholder for ids from another table
    pub fn name_or_placeholder(&self, id: SymbolId) -> String {
        self.symbol_name(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("#<symbol {}>", id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_symbol() {
        let mut table = SymbolTable::new();
        let sym1 = table.intern("foo");
        let sym2 = table.intern("foo");
        assert_eq!(sym1, sym2); // Same symbol

        let sym3 = table.intern("bar");
        assert_ne!(sym1, sym3); // Different symbols
    }

    #[test]
    fn test_case_folding() {
        let mut table = SymbolTable::new();
        let a = table.intern("<Integer>");
        let b = table.intern("<INTEGER>");
        assert_eq!(a, b);
        assert_eq!(table.symbol_name(a), Some("<integer>"));
    }

    #[test]
    fn test_find_does_not_intern() {
        let mut table = SymbolTable::new();
        assert_eq!(table.find("missing"), None);
        let id = table.intern("Present");
        assert_eq!(table.find("PRESENT"), Some(id));
        assert_eq!(table.find("missing"), None);
        assert_eq!(table.name_or_placeholder(SymbolId(99)), "#<symbol 99>");
    }
}
