//! Interned symbol names
//!
//! Attribute names are interned into a global pool so attribute tables key
//! on a small integer instead of a string, and name equality is a single
//! integer comparison. The pool lives for the whole VM run, alongside the
//! permanent space.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// An interned attribute or global name
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Symbol(u32);

impl Symbol {
    /// The numeric identifier of this symbol
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// The global symbol pool
pub struct SymbolTable {
    inner: Mutex<SymbolTableInner>,
}

struct SymbolTableInner {
    mapping: FxHashMap<String, Symbol>,
    names: Vec<String>,
}

impl SymbolTable {
    /// Create an empty symbol table
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SymbolTableInner {
                mapping: FxHashMap::default(),
                names: Vec::new(),
            }),
        }
    }

    /// Intern a name, returning the existing symbol when already present
    pub fn intern(&self, name: &str) -> Symbol {
        let mut inner = self.inner.lock();

        if let Some(&symbol) = inner.mapping.get(name) {
            return symbol;
        }

        let symbol = Symbol(inner.names.len() as u32);

        inner.names.push(name.to_string());
        inner.mapping.insert(name.to_string(), symbol);
        symbol
    }

    /// The name a symbol was interned from
    pub fn name(&self, symbol: Symbol) -> String {
        self.inner.lock().names[symbol.0 as usize].clone()
    }

    /// The number of interned symbols
    pub fn len(&self) -> usize {
        self.inner.lock().names.len()
    }

    /// Whether no symbols have been interned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_reuses_symbols() {
        let table = SymbolTable::new();

        let a = table.intern("name");
        let b = table.intern("name");
        let c = table.intern("other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_symbol_name() {
        let table = SymbolTable::new();
        let symbol = table.intern("greeting");

        assert_eq!(table.name(symbol), "greeting");
    }
}
