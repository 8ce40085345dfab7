// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/symtab.rs

// A fixed bucket table interning symbols by name. Symbols are ordinary
// heap cells; each bucket heads a chain linked through the symbols'
// own next fields.

// <>

use super::types::{Cell, DeclKind, Symbol, Value};
use super::{Runtime, YkErr};

pub struct SymbolTable {
    buckets: Vec<Value>,
    count: usize,
}

impl SymbolTable {
    pub fn new(buckets: usize) -> Self {
        SymbolTable {
            buckets: vec![Value::NIL; buckets.max(1)],
            count: 0,
        }
    }

    pub fn buckets(&self) -> &[Value] {
        &self.buckets
    }

    /// Number of interned symbols
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn hash_name(name: &[u8]) -> u32 {
        let mut acc: u32 = 1;
        for b in name {
            acc = acc.wrapping_add(acc << 5).wrapping_add(*b as _)
        }
        acc
    }

    fn slot(&self, hash: u32) -> usize {
        hash as usize % self.buckets.len()
    }
}

impl Runtime {
    /// Returns the symbol named `name`, creating it on first use
    pub fn intern(&mut self, name: &str) -> Value {
        if let Some(sym) = self.find_symbol(name) {
            return sym;
        }

        let hash = SymbolTable::hash_name(name.as_bytes());
        let slot = self.symtab.slot(hash);
        let next = self.symtab.buckets[slot];
        let sym = self.new_symbol(name, hash, next);

        self.symtab.buckets[slot] = sym;
        self.symtab.count += 1;
        sym
    }

    /// Looks up an interned symbol without creating it
    pub fn find_symbol(&self, name: &str) -> Option<Value> {
        let hash = SymbolTable::hash_name(name.as_bytes());
        let mut cur = self.symtab.buckets[self.symtab.slot(hash)];

        while cur.is_symbol() {
            let sym = self.symbol(cur);
            if sym.hash == hash && self.string_bytes(sym.name) == name.as_bytes() {
                return Some(cur);
            }
            cur = sym.next;
        }

        None
    }

    /// Creates a symbol that is not entered in the table
    pub fn make_symbol(&mut self, name: &str) -> Value {
        let hash = SymbolTable::hash_name(name.as_bytes());
        self.new_symbol(name, hash, Value::NIL)
    }

    fn new_symbol(&mut self, name: &str, hash: u32, next: Value) -> Value {
        let name = self.make_string(name);
        self.alloc_cell(Cell::Symbol(Symbol {
            name,
            hash,
            kind: DeclKind::Variable,
            arity: None,
            declared: false,
            value: None,
            next,
        }))
    }

    /// Record of a symbol value; panics on any other kind
    pub(crate) fn symbol(&self, sym: Value) -> &Symbol {
        match sym.cell_index().map(|i| self.heap.get(i)) {
            Some(Cell::Symbol(s)) => s,
            _ => panic!("expected a symbol, found {:?}", sym),
        }
    }

    pub(crate) fn symbol_mut(&mut self, sym: Value) -> &mut Symbol {
        match sym.cell_index().map(|i| self.heap.get_mut(i)) {
            Some(Cell::Symbol(s)) => s,
            _ => panic!("expected a symbol, found {:?}", sym),
        }
    }

    pub fn symbol_name(&self, sym: Value) -> &str {
        std::str::from_utf8(self.string_bytes(self.symbol(sym).name)).unwrap_or("")
    }

    /// Global value of a symbol, if bound
    pub fn global(&self, sym: Value) -> Option<Value> {
        self.symbol(sym).value
    }

    pub fn set_global(&mut self, sym: Value, v: Value) {
        self.symbol_mut(sym).value = Some(v);
    }

    /// Records a declaration for `sym`
    pub fn declare(&mut self, sym: Value, kind: DeclKind, arity: Option<i16>) -> Result<(), YkErr> {
        if !sym.is_symbol() {
            return Err(self.type_err("symbol", sym));
        }
        let rec = self.symbol_mut(sym);
        rec.kind = kind;
        rec.arity = arity;
        rec.declared = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuki::Config;

    fn tiny_table() -> Runtime {
        Runtime::bare(Config {
            symbol_buckets: 4,
            ..Config::default()
        })
    }

    #[test]
    fn interning() {
        let mut rt = Runtime::bare(Config::default());
        let a = rt.intern("testsym");
        let b = rt.intern("testsym");
        let c = rt.intern("othersym");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(rt.symbol_name(a), "testsym");
        assert!(rt.find_symbol("nothere").is_none());
        assert_eq!(rt.find_symbol("othersym"), Some(c));
    }

    #[test]
    fn manysym() {
        let mut rt = tiny_table();
        let before = rt.symtab.len();

        // generates symbols a00 - z99, chaining heavily in four buckets
        let mut syms = vec![];
        for i in 0..2600 {
            let name = format!("{}{:02}", (b'a' + (i / 100) as u8) as char, i % 100);
            syms.push(rt.intern(&name));
        }

        assert_eq!(rt.symtab.len(), before + 2600);
        assert_eq!(rt.symbol_name(syms[1213]), "m13");
        assert_eq!(rt.find_symbol("g92"), Some(syms[692]));

        // interned symbols survive collection through the table alone
        rt.collect();
        assert_eq!(rt.intern("z99"), syms[2599]);
    }

    #[test]
    fn uninterned() {
        let mut rt = Runtime::bare(Config::default());
        let a = rt.make_symbol("loose");
        let b = rt.intern("loose");
        assert_ne!(a, b);
        assert_eq!(rt.symbol_name(a), "loose");
    }

    #[test]
    fn declarations() {
        let mut rt = Runtime::bare(Config::default());
        let s = rt.intern("f");
        assert!(!rt.symbol(s).declared);
        rt.declare(s, DeclKind::Function, Some(2)).unwrap();
        let rec = rt.symbol(s);
        assert!(rec.declared);
        assert_eq!(rec.kind, DeclKind::Function);
        assert_eq!(rec.arity, Some(2));
        assert!(rt.declare(Value::int(1), DeclKind::Variable, None).is_err());
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(SymbolTable::hash_name(b""), 1);
        assert_eq!(
            SymbolTable::hash_name(b"abc"),
            SymbolTable::hash_name(b"abc")
        );
        assert_ne!(SymbolTable::hash_name(b"ab"), SymbolTable::hash_name(b"ba"));
    }
}
