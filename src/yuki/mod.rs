// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/mod.rs

// The Yuki runtime. Ties the heaps, symbol table and virtual machine
// together into one owned state and exposes the host interface: read,
// compile, run and print.

// <>

use std::fmt;
use std::fs;
use std::io::{self, BufRead, Write};

#[macro_use]
pub mod types;
pub mod compiler;
pub mod debugger;
pub mod eval;
pub mod memmgt;
pub mod parser;
pub mod printer;
pub mod stdenv;
pub mod stream;
pub mod symtab;

pub use compiler::{WarnKind, Warning};
pub use debugger::{DebugMode, Failure};
pub use types::{DeclKind, Tag, Value};

use eval::{Machine, Opcode};
use memmgt::Heap;
use symtab::SymbolTable;
use types::{Cell, Native, NativeFn, Port};

/// Core library source, evaluated by `Runtime::init`
const CORE_LIBRARY: &str = include_str!("../../lisp/core.yk");

/// Sizes and behavior chosen when a runtime starts
#[derive(Debug, Clone)]
pub struct Config {
    /// Cells in the pool, including the reserved cell zero
    pub cells: usize,
    /// Size of the payload arena
    pub payload_bytes: usize,
    /// Operand stack limit, in values
    pub stack_size: usize,
    /// Root stack limit
    pub root_capacity: usize,
    /// Free cell count at which allocation collects first
    pub low_water: usize,
    pub symbol_buckets: usize,
    pub debugger: DebugMode,
    /// Evaluate the bundled core library at startup
    pub core_library: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cells: 1 << 16,
            payload_bytes: 4 << 20,
            stack_size: 1 << 16,
            root_capacity: 4096,
            low_water: 64,
            symbol_buckets: 1024,
            debugger: DebugMode::Abort,
            core_library: true,
        }
    }
}

pub enum YkErr {
    /// Malformed source text
    Read(String),
    /// Malformed special form
    Syntax(String),
    /// Exit to a continuation name not in scope
    UnknownCont(String),
    Unbound(String),
    Type {
        expected: &'static str,
        found: String,
    },
    Arity {
        name: String,
        expected: i16,
        given: usize,
    },
    NotProcedure(String),
    StackExhausted,
    /// Continuation already exited
    ExitedCont,
    /// Continuation no longer on the continuation stack
    StaleCont,
    /// Raised by the `error` procedure
    Signal(String),
    Io(String),
    ClosedStream,
    /// Virtual machine entered while already running
    Reentrant,
    /// Violation handled by unwinding to the top level
    Aborted(Box<YkErr>),
}

impl fmt::Display for YkErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            YkErr::Read(msg) => write!(f, "read error: {}", msg),
            YkErr::Syntax(msg) => write!(f, "syntax error: {}", msg),
            YkErr::UnknownCont(name) => write!(f, "no continuation named {} in scope", name),
            YkErr::Unbound(name) => write!(f, "unbound variable {}", name),
            YkErr::Type { expected, found } => write!(f, "expected {}, found {}", expected, found),
            YkErr::Arity {
                name,
                expected,
                given,
            } => {
                if *expected >= 0 {
                    write!(f, "{} takes {} arguments, given {}", name, expected, given)
                } else {
                    write!(
                        f,
                        "{} takes at least {} arguments, given {}",
                        name,
                        types::arity_min(*expected),
                        given
                    )
                }
            }
            YkErr::NotProcedure(found) => write!(f, "cannot call {}", found),
            YkErr::StackExhausted => write!(f, "operand stack exhausted"),
            YkErr::ExitedCont => write!(f, "continuation has already exited"),
            YkErr::StaleCont => write!(f, "continuation is not on the active stack"),
            YkErr::Signal(msg) => write!(f, "{}", msg),
            YkErr::Io(msg) => write!(f, "io error: {}", msg),
            YkErr::ClosedStream => write!(f, "stream is closed"),
            YkErr::Reentrant => write!(f, "virtual machine is already running"),
            YkErr::Aborted(cause) => write!(f, "aborted: {}", cause),
        }
    }
}

impl fmt::Debug for YkErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for YkErr {}

impl From<io::Error> for YkErr {
    fn from(e: io::Error) -> Self {
        YkErr::Io(e.to_string())
    }
}

/// Symbols and objects the runtime refers to directly
#[derive(Default)]
pub(crate) struct Builtins {
    pub quote: Value,
    pub let_: Value,
    pub dynamic_let: Value,
    pub set: Value,
    pub comptime: Value,
    pub named_lambda: Value,
    pub do_: Value,
    pub if_: Value,
    pub with_cont: Value,
    pub exit: Value,
    pub loop_: Value,

    pub t: Value,
    pub standard_output: Value,
    pub standard_input: Value,
    pub toplevel: Value,

    pub variable: Value,
    pub constant: Value,
    pub function: Value,
    pub macro_: Value,

    /// Single instruction procedure that every run returns into
    pub halt: Value,
    pub make_closure: Value,
}

/// Complete state of one runtime instance
pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) symtab: SymbolTable,
    pub(crate) vm: Machine,
    pub(crate) roots: Vec<Value>,
    pub(crate) sym: Builtins,
    pub(crate) config: Config,
    pub(crate) gensyms: usize,
    /// Report of the most recent violation that reached the top level
    pub last_failure: Option<Failure>,
}

impl Runtime {
    /// Creates a runtime and evaluates the core library into it
    pub fn init(config: Config) -> Result<Runtime, YkErr> {
        let load = config.core_library;
        let mut rt = Runtime::bare(config);
        if load {
            rt.eval_str(CORE_LIBRARY)?;
            log::debug!(
                "core library loaded, {} symbols, {} cells live",
                rt.symtab.len(),
                rt.heap.live_cells()
            );
        }
        Ok(rt)
    }

    /// Creates a runtime holding only the native procedures
    pub fn bare(config: Config) -> Runtime {
        let mut rt = Runtime {
            heap: Heap::new(config.cells, config.payload_bytes, config.low_water),
            symtab: SymbolTable::new(config.symbol_buckets),
            vm: Machine::new(config.stack_size),
            roots: Vec::with_capacity(config.root_capacity),
            sym: Builtins::default(),
            gensyms: 0,
            last_failure: None,
            config,
        };

        rt.intern_builtins();

        for &(name, fun, arity) in stdenv::NATIVES {
            rt.register_native(name, fun, arity);
        }
        let mc = rt.intern("make-closure");
        rt.sym.make_closure = rt.global(mc).unwrap_or(Value::NIL);

        let halt = rt.intern("%halt");
        rt.sym.halt = rt.make_bytecode(halt, Value::NIL, 0);
        rt.emit(rt.sym.halt, Opcode::Halt, 0, Value::NIL);

        let nil = rt.intern("nil");
        rt.define_builtin(nil, DeclKind::Constant, Value::NIL);
        let t = rt.sym.t;
        rt.define_builtin(t, DeclKind::Constant, t);

        let stdout = rt.make_file_stream(Port::Stdout);
        rt.define_builtin(rt.sym.standard_output, DeclKind::Variable, stdout);
        let stdin = rt.make_file_stream(Port::Stdin);
        rt.define_builtin(rt.sym.standard_input, DeclKind::Variable, stdin);

        log::debug!(
            "runtime ready: {} natives, {} cells live",
            stdenv::NATIVES.len(),
            rt.heap.live_cells()
        );
        rt
    }

    fn intern_builtins(&mut self) {
        let b = Builtins {
            quote: self.intern("quote"),
            let_: self.intern("let"),
            dynamic_let: self.intern("dynamic-let"),
            set: self.intern("set!"),
            comptime: self.intern("comptime"),
            named_lambda: self.intern("named-lambda"),
            do_: self.intern("do"),
            if_: self.intern("if"),
            with_cont: self.intern("with-cont"),
            exit: self.intern("exit"),
            loop_: self.intern("loop"),

            t: self.intern("t"),
            standard_output: self.intern("*standard-output*"),
            standard_input: self.intern("*standard-input*"),
            toplevel: self.intern("toplevel"),

            variable: self.intern("variable"),
            constant: self.intern("constant"),
            function: self.intern("function"),
            macro_: self.intern("macro"),

            halt: Value::NIL,
            make_closure: Value::NIL,
        };
        self.sym = b;
    }

    fn define_builtin(&mut self, sym: Value, kind: DeclKind, value: Value) {
        let rec = self.symbol_mut(sym);
        rec.kind = kind;
        rec.declared = true;
        rec.value = Some(value);
    }

    /// Binds `name` globally to a native procedure and declares it as
    /// a function of the given arity
    pub fn register_native(&mut self, name: &str, fun: NativeFn, arity: i16) {
        let sym = self.intern(name);
        let native = self.alloc_cell(Cell::Native(Native {
            name: sym,
            arity,
            fun,
        }));

        let rec = self.symbol_mut(sym);
        rec.value = Some(native);
        rec.kind = DeclKind::Function;
        rec.arity = Some(arity);
        rec.declared = true;
    }

    /// Creates an empty compilation target
    pub fn make_bytecode_unit(&mut self, name: Value, arity: i16) -> Result<Value, YkErr> {
        if !name.is_symbol() {
            return Err(self.type_err("symbol", name));
        }
        Ok(self.make_bytecode(name, Value::NIL, arity))
    }

    /// Reads every form in `code` and evaluates them in order, each in
    /// its own unit, returning the last result
    pub fn eval_str(&mut self, code: &str) -> Result<Value, YkErr> {
        self.with_roots(|rt| {
            let forms = rt.read_all(code)?;
            rt.protect(forms);

            let mut result = Value::NIL;
            let mut cur = forms;
            while let Some((form, rest)) = rt.pair(cur) {
                result = rt.with_roots(|rt| {
                    let one = rt.cons(form, Value::NIL);
                    rt.protect(one);
                    let unit = rt.make_bytecode(rt.sym.toplevel, Value::NIL, 0);
                    rt.protect(unit);
                    rt.compile(one, unit)?;
                    rt.run(unit)
                })?;
                cur = rest;
            }
            Ok(result)
        })
    }

    // object access

    /// Fields of a cons pair
    pub fn pair(&self, v: Value) -> Option<(Value, Value)> {
        if !v.is_pair() {
            return None;
        }
        match v.cell_index().map(|i| self.heap.get(i)) {
            Some(Cell::Cons(car, cdr)) => Some((*car, *cdr)),
            _ => None,
        }
    }

    /// Head of a list; the empty list is its own head
    pub fn car(&self, v: Value) -> Result<Value, YkErr> {
        match self.pair(v) {
            Some((car, _)) => Ok(car),
            None if v.is_nil() => Ok(Value::NIL),
            None => Err(self.type_err("list", v)),
        }
    }

    pub fn cdr(&self, v: Value) -> Result<Value, YkErr> {
        match self.pair(v) {
            Some((_, cdr)) => Ok(cdr),
            None if v.is_nil() => Ok(Value::NIL),
            None => Err(self.type_err("list", v)),
        }
    }

    pub fn set_car(&mut self, v: Value, x: Value) -> Result<(), YkErr> {
        match v.cell_index().filter(|_| v.is_pair()).map(|i| self.heap.get_mut(i)) {
            Some(Cell::Cons(car, _)) => {
                *car = x;
                Ok(())
            }
            _ => Err(self.type_err("cons", v)),
        }
    }

    pub fn set_cdr(&mut self, v: Value, x: Value) -> Result<(), YkErr> {
        match v.cell_index().filter(|_| v.is_pair()).map(|i| self.heap.get_mut(i)) {
            Some(Cell::Cons(_, cdr)) => {
                *cdr = x;
                Ok(())
            }
            _ => Err(self.type_err("cons", v)),
        }
    }

    /// Elements of a proper list
    pub fn list_vec(&self, list: Value) -> Result<Vec<Value>, YkErr> {
        let mut out = Vec::new();
        let mut cur = list;
        while let Some((car, cdr)) = self.pair(cur) {
            out.push(car);
            cur = cdr;
        }
        if cur.is_nil() {
            Ok(out)
        } else {
            Err(self.type_err("proper list", list))
        }
    }

    /// Conses the values held in the root stack above `base` onto `tail`
    pub(crate) fn list_from_roots(&mut self, base: usize, tail: Value) -> Value {
        let mut list = tail;
        for i in (base..self.roots.len()).rev() {
            let car = self.roots[i];
            list = self.cons(car, list);
        }
        list
    }

    pub fn make_string(&mut self, s: &str) -> Value {
        let data = self.alloc_block(s.len());
        self.heap.bytes_mut(data)[..s.len()].copy_from_slice(s.as_bytes());
        self.alloc_cell(Cell::Str {
            data,
            len: s.len() as u32,
        })
    }

    pub fn is_string(&self, v: Value) -> bool {
        matches!(
            v.cell_index().filter(|_| v.tag() == Tag::Object).map(|i| self.heap.get(i)),
            Some(Cell::Str { .. })
        )
    }

    /// Bytes of a string; empty for anything else
    pub(crate) fn string_bytes(&self, v: Value) -> &[u8] {
        if v.tag() != Tag::Object {
            return &[];
        }
        match v.cell_index().map(|i| self.heap.get(i)) {
            Some(Cell::Str { data, len }) => &self.heap.bytes(*data)[..*len as usize],
            _ => &[],
        }
    }

    pub fn string_value(&self, v: Value) -> Result<String, YkErr> {
        if !self.is_string(v) {
            return Err(self.type_err("string", v));
        }
        Ok(String::from_utf8_lossy(self.string_bytes(v)).into_owned())
    }

    /// Structural equality over lists and strings
    pub fn equal(&self, a: Value, b: Value) -> bool {
        let (mut a, mut b) = (a, b);
        loop {
            if a == b {
                return true;
            }
            if let (Some((ah, at)), Some((bh, bt))) = (self.pair(a), self.pair(b)) {
                if !self.equal(ah, bh) {
                    return false;
                }
                a = at;
                b = bt;
                continue;
            }
            return self.is_string(a) && self.is_string(b) && self.string_bytes(a) == self.string_bytes(b);
        }
    }

    pub(crate) fn type_err(&self, expected: &'static str, found: Value) -> YkErr {
        YkErr::Type {
            expected,
            found: self.print_string(found),
        }
    }

    /// Name of a procedure, for messages and backtraces
    pub(crate) fn proc_name(&self, p: Value) -> String {
        let name = match p.cell_index().map(|i| self.heap.get(i)) {
            Some(Cell::Native(n)) => n.name,
            Some(Cell::Bytecode(b)) => b.name,
            Some(Cell::Closure { code, .. }) => return self.proc_name(*code),
            _ => return self.print_string(p),
        };
        if name.is_symbol() {
            self.symbol_name(name).to_string()
        } else {
            "anonymous".to_string()
        }
    }
}

/// Whether `text` holds only complete forms, judged by balance
fn form_complete(text: &str) -> bool {
    let mut depth = 0i32;
    let mut in_str = false;
    let mut in_comment = false;
    for c in text.chars() {
        if in_comment {
            in_comment = c != '\n';
        } else if in_str {
            in_str = c != '"';
        } else {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                '"' => in_str = true,
                ';' => in_comment = true,
                _ => {}
            }
        }
    }
    depth <= 0 && !in_str
}

/// Reads, evaluates and prints forms from standard input until it ends
pub fn repl(stream_in: io::Stdin) {
    let config = Config {
        debugger: DebugMode::Interactive,
        ..Config::default()
    };
    let mut rt = match Runtime::init(config) {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("runtime failed to start: {}", e);
            return;
        }
    };

    let mut input = String::new();
    loop {
        print!("{}", if input.is_empty() { "> " } else { ". " });
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stream_in.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => input.push_str(&line),
        }
        if !form_complete(&input) {
            continue;
        }

        match rt.eval_str(&input) {
            Ok(v) => println!("{}", rt.print_string(v)),
            Err(YkErr::Aborted(_)) => println!("; returned to top level"),
            Err(e) => println!("; {}", e),
        }
        input.clear();
    }
}

/// Evaluates a source file, returning the printed final value
pub fn run_file(filename: &str) -> Result<String, YkErr> {
    let code = fs::read_to_string(filename)?;
    let config = Config {
        debugger: DebugMode::Interactive,
        ..Config::default()
    };
    let mut rt = Runtime::init(config)?;
    let result = rt.eval_str(&code)?;
    Ok(rt.print_string(result))
}
