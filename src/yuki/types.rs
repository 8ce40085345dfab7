// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/types.rs

// Value encoding and the fixed-shape records that live in heap
// cells. A value is one word: the low four bits hold an immediate tag,
// the rest hold either the immediate payload or a cell index.

// <>

use super::{Runtime, YkErr};

use std::fmt;
use std::fs::File;

/// Defines a fieldless enum along with a `TryFrom<u8>` conversion
macro_rules! enum_and_tryfrom {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::TryFrom<u8> for $name {
            type Error = ();

            #[inline(always)]
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $(x if x == $name::$vname as u8 => Ok($name::$vname),)*
                    _ => Err(()),
                }
            }
        }
    }
}

enum_and_tryfrom! {
    /// Immediate tag stored in the low bits of every value
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Tag {
        /// Heap cell whose real type is its record kind
        Object = 0,
        /// Empty list, or a cons pair
        List = 1,
        Int = 2,
        Float = 3,
        Symbol = 4,
        Native = 5,
        Closure = 6,
        Bytecode = 7,
    }
}

const TAG_BITS: u32 = 4;
const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

/// Largest integer representable without loss
pub const INT_MAX: i64 = (1 << 59) - 1;
/// Smallest integer representable without loss
pub const INT_MIN: i64 = -(1 << 59);

/// A single tagged word
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const NIL: Value = Value(Tag::List as u64);

    /// Integers keep their low 60 bits; larger magnitudes wrap
    #[inline(always)]
    pub fn int(i: i64) -> Value {
        Value(((i as u64) << TAG_BITS) | Tag::Int as u64)
    }

    #[inline(always)]
    pub fn float(f: f32) -> Value {
        Value(((f.to_bits() as u64) << 32) | Tag::Float as u64)
    }

    #[inline(always)]
    pub(crate) fn from_cell(tag: Tag, index: usize) -> Value {
        Value(((index as u64) << TAG_BITS) | tag as u64)
    }

    #[inline(always)]
    pub(crate) fn bits(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub(crate) fn from_bits(bits: u64) -> Value {
        Value(bits)
    }

    #[inline(always)]
    pub fn tag(self) -> Tag {
        match Tag::try_from((self.0 & TAG_MASK) as u8) {
            Ok(t) => t,
            Err(_) => unreachable!("value with invalid tag bits {:#x}", self.0),
        }
    }

    #[inline(always)]
    pub fn is_nil(self) -> bool {
        self == Value::NIL
    }

    /// True for a cons pair, false for the empty list
    #[inline(always)]
    pub fn is_pair(self) -> bool {
        self.tag() == Tag::List && !self.is_nil()
    }

    #[inline(always)]
    pub fn is_symbol(self) -> bool {
        self.tag() == Tag::Symbol
    }

    pub fn as_int(self) -> Option<i64> {
        (self.tag() == Tag::Int).then(|| (self.0 as i64) >> TAG_BITS)
    }

    pub fn as_float(self) -> Option<f32> {
        (self.tag() == Tag::Float).then(|| f32::from_bits((self.0 >> 32) as u32))
    }

    /// Integer payload without checking the tag; used for frame words
    #[inline(always)]
    pub(crate) fn raw_int(self) -> usize {
        ((self.0 as i64) >> TAG_BITS) as usize
    }

    /// Index of the referenced cell, if this value lives in the pool
    #[inline(always)]
    pub(crate) fn cell_index(self) -> Option<usize> {
        match self.tag() {
            Tag::Int | Tag::Float => None,
            _ => match (self.0 >> TAG_BITS) as usize {
                0 => None,
                i => Some(i),
            },
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NIL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Tag::Int => write!(f, "Int({})", self.raw_int() as i64),
            Tag::Float => write!(f, "Float({:?})", self.as_float().unwrap_or(0.0)),
            Tag::List if self.is_nil() => write!(f, "Nil"),
            t => write!(f, "{:?}#{}", t, self.0 >> TAG_BITS),
        }
    }
}

/// Signature shared by every native procedure
pub type NativeFn = fn(&mut Runtime, &[Value]) -> Result<Value, YkErr>;

/// Offset of a block header within the payload arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(pub(crate) u32);

/// What a symbol has been declared as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Variable,
    Constant,
    Function,
    Macro,
}

#[derive(Debug, Clone, Copy)]
pub struct Symbol {
    /// Print name, a string value
    pub name: Value,
    pub hash: u32,
    pub kind: DeclKind,
    /// Expected arity, for functions
    pub arity: Option<i16>,
    pub declared: bool,
    /// Global value; `None` when unbound
    pub value: Option<Value>,
    /// Next symbol in the same bucket
    pub next: Value,
}

#[derive(Clone, Copy)]
pub struct Native {
    pub name: Value,
    pub arity: i16,
    pub fun: NativeFn,
}

#[derive(Debug, Clone, Copy)]
pub struct Bytecode {
    pub name: Value,
    /// Documentation string, or nil
    pub doc: Value,
    pub arity: i16,
    /// Instruction array
    pub code: Block,
    /// Instructions emitted so far
    pub len: u32,
}

/// Saved machine state for an escape continuation
#[derive(Debug, Clone, Copy)]
pub struct Cont {
    pub sp: u32,
    pub fp: u32,
    pub dyn_sp: u32,
    /// Position of this continuation in the continuation stack
    pub depth: u32,
    pub code: Value,
    pub pc: u32,
    pub exited: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StrStream {
    pub data: Block,
    pub len: u32,
    /// Read position
    pub pos: u32,
    pub open: bool,
}

/// Backing endpoint of a file stream
#[derive(Debug)]
pub enum Port {
    Stdin,
    Stdout,
    Stderr,
    File(File),
    Closed,
}

/// Contents of one pool cell
pub enum Cell {
    /// Link to the next free cell, zero at the end of the list
    Free(u32),
    Cons(Value, Value),
    Symbol(Symbol),
    Native(Native),
    Closure { code: Value, env: Value },
    Bytecode(Bytecode),
    Cont(Cont),
    Array { data: Block, len: u32 },
    Str { data: Block, len: u32 },
    StrStream(StrStream),
    FileStream(Port),
}

/// References held by a cell, as seen by the marker
#[derive(Clone, Copy)]
pub(crate) enum Trace {
    Leaf,
    One(Value),
    Two(Value, Value),
    Symbol { name: Value, value: Option<Value>, next: Value },
    Code { name: Value, doc: Value, code: Block, len: u32 },
    Array(Block, u32),
    Block(Block),
}

impl Cell {
    /// Immediate tag for values referring to this cell
    pub(crate) fn tag(&self) -> Tag {
        match self {
            Cell::Cons(..) => Tag::List,
            Cell::Symbol(_) => Tag::Symbol,
            Cell::Native(_) => Tag::Native,
            Cell::Closure { .. } => Tag::Closure,
            Cell::Bytecode(_) => Tag::Bytecode,
            _ => Tag::Object,
        }
    }

    pub(crate) fn trace(&self) -> Trace {
        match self {
            Cell::Free(_) | Cell::FileStream(_) => Trace::Leaf,
            Cell::Cons(car, cdr) => Trace::Two(*car, *cdr),
            Cell::Symbol(s) => Trace::Symbol {
                name: s.name,
                value: s.value,
                next: s.next,
            },
            Cell::Native(n) => Trace::One(n.name),
            Cell::Closure { code, env } => Trace::Two(*env, *code),
            Cell::Bytecode(b) => Trace::Code {
                name: b.name,
                doc: b.doc,
                code: b.code,
                len: b.len,
            },
            Cell::Cont(c) => Trace::One(c.code),
            Cell::Array { data, len } => Trace::Array(*data, *len),
            Cell::Str { data, .. } => Trace::Block(*data),
            Cell::StrStream(s) => Trace::Block(s.data),
        }
    }

    /// Short type name used in descriptors and error messages
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Cell::Free(_) => "free",
            Cell::Cons(..) => "cons",
            Cell::Symbol(_) => "symbol",
            Cell::Native(_) => "native",
            Cell::Closure { .. } => "closure",
            Cell::Bytecode(_) => "bytecode",
            Cell::Cont(_) => "continuation",
            Cell::Array { .. } => "array",
            Cell::Str { .. } => "string",
            Cell::StrStream(_) => "string-stream",
            Cell::FileStream(_) => "file-stream",
        }
    }
}

/// Arity code for a variadic procedure with `min` required arguments
pub fn variadic(min: usize) -> i16 {
    -(min as i16) - 1
}

/// Number of required arguments
pub fn arity_min(arity: i16) -> usize {
    if arity >= 0 {
        arity as usize
    } else {
        (-(arity + 1)) as usize
    }
}

pub fn arity_accepts(arity: i16, argc: usize) -> bool {
    if arity >= 0 {
        argc == arity as usize
    } else {
        argc >= arity_min(arity)
    }
}

/// Argument slots a frame holds once variadic arguments are collected
pub fn frame_slots(arity: i16) -> usize {
    if arity >= 0 {
        arity as usize
    } else {
        arity_min(arity) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediates() {
        assert_eq!(Value::int(42).as_int(), Some(42));
        assert_eq!(Value::int(-7).as_int(), Some(-7));
        assert_eq!(Value::int(INT_MAX).as_int(), Some(INT_MAX));
        assert_eq!(Value::int(INT_MIN).as_int(), Some(INT_MIN));
        assert_eq!(Value::float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::int(3).as_float(), None);
        assert_eq!(Value::NIL.tag(), Tag::List);
        assert!(!Value::NIL.is_pair());
        assert_eq!(Value::NIL.cell_index(), None);
        assert_eq!(Value::int(5).cell_index(), None);
    }

    #[test]
    fn cell_refs() {
        let v = Value::from_cell(Tag::Symbol, 17);
        assert_eq!(v.tag(), Tag::Symbol);
        assert_eq!(v.cell_index(), Some(17));
        assert!(Value::from_cell(Tag::List, 3).is_pair());
        assert_eq!(Value::from_bits(v.bits()), v);
    }

    #[test]
    fn arities() {
        assert_eq!(variadic(0), -1);
        assert_eq!(variadic(2), -3);
        assert_eq!(arity_min(-3), 2);
        assert!(arity_accepts(2, 2));
        assert!(!arity_accepts(2, 3));
        assert!(arity_accepts(-3, 2));
        assert!(arity_accepts(-3, 5));
        assert!(!arity_accepts(-3, 1));
        assert_eq!(frame_slots(-3), 3);
        assert_eq!(frame_slots(1), 1);
    }
}
