// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/eval.rs

// The Yuki virtual machine: a stack machine running bytecode built by
// the compiler, with escape continuations, dynamic bindings and proper
// tail calls.

// <>

use super::types::{arity_accepts, frame_slots, Block, Bytecode, Cell, Cont, Tag, Value};
use super::{Runtime, YkErr};

/// Instructions a fresh bytecode object has room for
const INITIAL_CODE: usize = 8;
/// Bytes in one instruction record
const INSTR_BYTES: usize = 16;

enum_and_tryfrom! {
    /// Operation codes; each instruction is an opcode, a small modifier
    /// and one operand value
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(u8)]
    pub enum Opcode {
        /// Stop the machine
        Halt,
        /// val <- operand
        Const,
        Push,
        /// Pop `modifier` values
        Drop,
        /// val <- the value `modifier` places below the top
        StackRef,
        StackSet,
        /// val <- element `operand` of the environment `modifier` below the top
        EnvRef,
        EnvSet,
        /// val <- global value of symbol `operand`
        GlobalRef,
        GlobalSet,
        /// Continue at instruction `operand`
        Jump,
        JumpIfFalse,
        /// Call val with `modifier` arguments from the stack
        Call,
        TailCall,
        Ret,
        /// Collect arguments past the first `modifier` into a list
        Varargs,
        /// val <- array of the top `modifier` values, which are popped
        MakeArray,
        /// Establish a continuation resuming at instruction `operand`
        WithCont,
        PopCont,
        /// val <- the continuation `modifier` below the newest
        ContRef,
        /// Exit to continuation `modifier` below the newest with val
        Exit,
        /// Exit to continuation `operand` of environment `modifier`
        EnvExit,
        /// Bind symbol `operand` to val for a dynamic extent
        DynBind,
        /// Undo the newest `modifier` dynamic bindings
        DynUnbind,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Instr {
    pub op: Opcode,
    pub modifier: u16,
    pub operand: Value,
}

/// A dynamic binding and the global value it displaced
#[derive(Debug, Clone, Copy)]
pub(crate) struct DynBinding {
    pub sym: Value,
    pub old: Option<Value>,
}

/// Registers and stacks of the machine
pub struct Machine {
    pub(crate) val: Value,
    /// Bytecode being executed
    pub(crate) code: Value,
    pub(crate) pc: usize,
    /// Stack index just past the current frame's saved words
    pub(crate) fp: usize,
    /// Argument count of the latest call
    pub(crate) argc: usize,
    pub(crate) stack: Vec<Value>,
    limit: usize,
    pub(crate) dyns: Vec<DynBinding>,
    pub(crate) conts: Vec<Value>,
    pub(crate) active: bool,
    /// Native procedure currently running, if any
    pub(crate) native: Option<Value>,
}

/// Machine state to restore when a run ends
struct Checkpoint {
    sp: usize,
    dyn_sp: usize,
    conts: usize,
    code: Value,
    pc: usize,
    fp: usize,
}

/// Where a call returns to: code, instruction and frame
type Return = (Value, usize, usize);

impl Machine {
    pub fn new(limit: usize) -> Self {
        Machine {
            val: Value::NIL,
            code: Value::NIL,
            pc: 0,
            fp: 0,
            argc: 0,
            stack: Vec::with_capacity(limit.min(1 << 12)),
            limit,
            dyns: Vec::new(),
            conts: Vec::new(),
            active: false,
            native: None,
        }
    }

    #[inline(always)]
    fn push(&mut self, v: Value) -> Result<(), YkErr> {
        if self.stack.len() >= self.limit {
            return Err(YkErr::StackExhausted);
        }
        self.stack.push(v);
        Ok(())
    }

    #[inline(always)]
    fn top(&self, off: usize) -> Value {
        self.stack[self.stack.len() - 1 - off]
    }

    #[inline(always)]
    fn top_mut(&mut self, off: usize) -> &mut Value {
        let at = self.stack.len() - 1 - off;
        &mut self.stack[at]
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

impl Runtime {
    // bytecode objects

    pub(crate) fn bytecode(&self, code: Value) -> &Bytecode {
        match code.cell_index().map(|i| self.heap.get(i)) {
            Some(Cell::Bytecode(b)) => b,
            _ => panic!("expected bytecode, found {:?}", code),
        }
    }

    fn bytecode_mut(&mut self, code: Value) -> &mut Bytecode {
        match code.cell_index().map(|i| self.heap.get_mut(i)) {
            Some(Cell::Bytecode(b)) => b,
            _ => panic!("expected bytecode, found {:?}", code),
        }
    }

    pub(crate) fn make_bytecode(&mut self, name: Value, doc: Value, arity: i16) -> Value {
        let code = self.alloc_block(INITIAL_CODE * INSTR_BYTES);
        self.alloc_cell(Cell::Bytecode(Bytecode {
            name,
            doc,
            arity,
            code,
            len: 0,
        }))
    }

    /// Appends an instruction, returning its position
    ///
    /// `code` must be reachable from a root.
    pub(crate) fn emit(&mut self, code: Value, op: Opcode, modifier: u16, operand: Value) -> usize {
        let (mut block, len) = {
            let b = self.bytecode(code);
            (b.code, b.len as usize)
        };

        if (len + 1) * INSTR_BYTES > self.heap.capacity(block) {
            self.protect(operand);
            let grown = self.alloc_block(len * 2 * INSTR_BYTES);
            self.unprotect(1);
            self.heap.copy_block(block, grown, len * INSTR_BYTES);
            self.bytecode_mut(code).code = grown;
            block = grown;
        }

        self.heap
            .write_word(block, len * 2, op as u64 | (modifier as u64) << 16);
        self.heap.write_word(block, len * 2 + 1, operand.bits());
        self.bytecode_mut(code).len += 1;
        len
    }

    /// Points the jump at `at` to instruction `target`
    pub(crate) fn patch(&mut self, code: Value, at: usize, target: usize) {
        let block = self.bytecode(code).code;
        self.heap
            .write_word(block, at * 2 + 1, Value::int(target as i64).bits());
    }

    pub(crate) fn code_len(&self, code: Value) -> usize {
        self.bytecode(code).len as usize
    }

    pub fn instr(&self, code: Value, index: usize) -> Instr {
        let block = self.bytecode(code).code;
        let word = self.heap.read_word(block, index * 2);
        let op = match Opcode::try_from(word as u8) {
            Ok(op) => op,
            Err(_) => unreachable!("invalid opcode {:#x} at {}", word as u8, index),
        };
        Instr {
            op,
            modifier: (word >> 16) as u16,
            operand: Value::from_bits(self.heap.read_word(block, index * 2 + 1)),
        }
    }

    /// Human readable listing of a bytecode object
    pub fn disassemble(&self, code: Value) -> String {
        let b = self.bytecode(code);
        let mut out = format!(
            "{} (arity {}, {} instructions)\n",
            self.proc_name(code),
            b.arity,
            b.len
        );

        for i in 0..b.len as usize {
            let ins = self.instr(code, i);
            let line = match ins.op {
                Opcode::Halt | Opcode::Push | Opcode::Ret | Opcode::PopCont => {
                    format!("{:?}", ins.op)
                }
                Opcode::Const | Opcode::GlobalRef | Opcode::GlobalSet | Opcode::DynBind => {
                    format!("{:?} {}", ins.op, self.print_string(ins.operand))
                }
                Opcode::Jump | Opcode::JumpIfFalse | Opcode::WithCont => {
                    format!("{:?} -> {}", ins.op, ins.operand.raw_int())
                }
                Opcode::EnvRef | Opcode::EnvSet | Opcode::EnvExit => {
                    format!("{:?} {} [{}]", ins.op, ins.modifier, ins.operand.raw_int())
                }
                _ => format!("{:?} {}", ins.op, ins.modifier),
            };
            out.push_str(&format!("{:5}  {}\n", i, line));
        }
        out
    }

    pub(crate) fn code_arity(&self, code: Value) -> i16 {
        self.bytecode(code).arity
    }

    // running

    /// Runs a compiled unit that takes no arguments
    pub fn run(&mut self, target: Value) -> Result<Value, YkErr> {
        self.start(target, &[])
    }

    /// Calls any procedure with the given arguments
    pub fn invoke(&mut self, proc: Value, args: &[Value]) -> Result<Value, YkErr> {
        self.start(proc, args)
    }

    fn start(&mut self, proc: Value, args: &[Value]) -> Result<Value, YkErr> {
        if self.vm.active {
            return Err(YkErr::Reentrant);
        }

        let entry = Checkpoint {
            sp: self.vm.stack.len(),
            dyn_sp: self.vm.dyns.len(),
            conts: self.vm.conts.len(),
            code: self.vm.code,
            pc: self.vm.pc,
            fp: self.vm.fp,
        };

        self.vm.active = true;
        let result = self.enter_and_execute(proc, args);
        self.vm.active = false;

        match result {
            Ok(()) => {
                let v = self.vm.val;
                self.vm.stack.truncate(entry.sp);
                self.vm.code = entry.code;
                self.vm.pc = entry.pc;
                self.vm.fp = entry.fp;
                Ok(v)
            }
            Err(e) => {
                self.handle_violation(&e);
                self.abort_to(&entry);
                Err(YkErr::Aborted(Box::new(e)))
            }
        }
    }

    fn enter_and_execute(&mut self, proc: Value, args: &[Value]) -> Result<(), YkErr> {
        for &a in args {
            self.vm.push(a)?;
        }
        let ret = (self.sym.halt, 0, self.vm.fp);
        self.enter(proc, args.len(), ret)?;
        self.execute()
    }

    /// Unwinds everything a failed run left behind
    fn abort_to(&mut self, entry: &Checkpoint) {
        self.unwind_dyns(entry.dyn_sp);
        let from = entry.conts.min(self.vm.conts.len());
        for k in self.vm.conts.drain(from..) {
            if let Some(Cell::Cont(c)) = k.cell_index().map(|i| self.heap.get_mut(i)) {
                c.exited = true;
            }
        }
        self.vm.stack.truncate(entry.sp);
        self.vm.native = None;
        self.vm.val = Value::NIL;
        self.vm.code = entry.code;
        self.vm.pc = entry.pc;
        self.vm.fp = entry.fp;
        log::debug!("aborted to depth {}", entry.sp);
    }

    fn unwind_dyns(&mut self, to: usize) {
        while self.vm.dyns.len() > to {
            if let Some(b) = self.vm.dyns.pop() {
                self.symbol_mut(b.sym).value = b.old;
            }
        }
    }

    /// Starts executing `proc` with `argc` arguments on the stack
    fn enter(&mut self, proc: Value, argc: usize, ret: Return) -> Result<(), YkErr> {
        let (code, env) = match proc.tag() {
            Tag::Bytecode => (proc, None),
            Tag::Closure => match proc.cell_index().map(|i| self.heap.get(i)) {
                Some(Cell::Closure { code, env }) => (*code, Some(*env)),
                _ => return Err(YkErr::NotProcedure(self.print_string(proc))),
            },
            Tag::Native => return self.call_native(proc, argc, ret),
            _ => return Err(YkErr::NotProcedure(self.print_string(proc))),
        };

        let arity = self.code_arity(code);
        if !arity_accepts(arity, argc) {
            return Err(YkErr::Arity {
                name: self.proc_name(proc),
                expected: arity,
                given: argc,
            });
        }

        self.vm.push(ret.0)?;
        self.vm.push(Value::int(ret.1 as i64))?;
        self.vm.push(Value::int(ret.2 as i64))?;
        self.vm.fp = self.vm.stack.len();
        if let Some(env) = env {
            self.vm.push(env)?;
        }

        self.vm.code = code;
        self.vm.pc = 0;
        self.vm.argc = argc;
        Ok(())
    }

    fn call_native(&mut self, proc: Value, argc: usize, ret: Return) -> Result<(), YkErr> {
        // a tail call has already discarded the caller's frame
        self.vm.code = ret.0;
        self.vm.pc = ret.1;
        self.vm.fp = ret.2;

        let native = match proc.cell_index().map(|i| self.heap.get(i)) {
            Some(Cell::Native(n)) => *n,
            _ => return Err(YkErr::NotProcedure(self.print_string(proc))),
        };
        if !arity_accepts(native.arity, argc) {
            return Err(YkErr::Arity {
                name: self.symbol_name(native.name).to_string(),
                expected: native.arity,
                given: argc,
            });
        }

        // arguments stay on the stack, and so rooted, during the call
        let base = self.vm.stack.len() - argc;
        self.vm.native = Some(proc);
        let result = if argc <= 8 {
            let mut buf = [Value::NIL; 8];
            buf[..argc].copy_from_slice(&self.vm.stack[base..]);
            (native.fun)(self, &buf[..argc])
        } else {
            let args = self.vm.stack[base..].to_vec();
            (native.fun)(self, &args)
        }?;
        self.vm.native = None;

        self.vm.stack.truncate(base);
        self.vm.val = result;
        Ok(())
    }

    /// Saved words and base index of the current frame
    fn frame(&self) -> (Return, usize) {
        let fp = self.vm.fp;
        let stack = &self.vm.stack;
        let ret = (stack[fp - 3], stack[fp - 2].raw_int(), stack[fp - 1].raw_int());
        let base = fp - 3 - frame_slots(self.code_arity(self.vm.code));
        (ret, base)
    }

    fn exit_to(&mut self, k: Value, v: Value) -> Result<(), YkErr> {
        let cont = match k.cell_index().filter(|_| k.tag() == Tag::Object).map(|i| self.heap.get(i)) {
            Some(Cell::Cont(c)) => *c,
            _ => return Err(self.type_err("continuation", k)),
        };
        if cont.exited {
            return Err(YkErr::ExitedCont);
        }
        let depth = cont.depth as usize;
        if self.vm.conts.get(depth) != Some(&k) || cont.sp as usize > self.vm.stack.len() {
            return Err(YkErr::StaleCont);
        }

        for c in self.vm.conts.drain(depth..) {
            if let Some(Cell::Cont(c)) = c.cell_index().map(|i| self.heap.get_mut(i)) {
                c.exited = true;
            }
        }
        self.unwind_dyns(cont.dyn_sp as usize);

        self.vm.stack.truncate(cont.sp as usize);
        self.vm.fp = cont.fp as usize;
        self.vm.code = cont.code;
        self.vm.pc = cont.pc as usize;
        self.vm.val = v;
        Ok(())
    }

    fn env_slot(&self, env: Value, index: usize) -> Result<(Block, usize), YkErr> {
        match env.cell_index().filter(|_| env.tag() == Tag::Object).map(|i| self.heap.get(i)) {
            Some(Cell::Array { data, len }) if index < *len as usize => Ok((*data, index)),
            _ => Err(self.type_err("environment", env)),
        }
    }

    fn execute(&mut self) -> Result<(), YkErr> {
        loop {
            let ins = self.instr(self.vm.code, self.vm.pc);
            if cfg!(feature = "stkdbg") {
                log::debug!(
                    "{:5} {:?} {} {:?} | depth {} val {:?}",
                    self.vm.pc,
                    ins.op,
                    ins.modifier,
                    ins.operand,
                    self.vm.stack.len(),
                    self.vm.val
                );
            }
            self.vm.pc += 1;

            let m = ins.modifier as usize;
            match ins.op {
                Opcode::Halt => return Ok(()),
                Opcode::Const => self.vm.val = ins.operand,
                Opcode::Push => self.vm.push(self.vm.val)?,
                Opcode::Drop => {
                    let depth = self.vm.stack.len() - m;
                    self.vm.stack.truncate(depth);
                }
                Opcode::StackRef => self.vm.val = self.vm.top(m),
                Opcode::StackSet => *self.vm.top_mut(m) = self.vm.val,
                Opcode::EnvRef => {
                    let (data, i) = self.env_slot(self.vm.top(m), ins.operand.raw_int())?;
                    self.vm.val = Value::from_bits(self.heap.read_word(data, i));
                }
                Opcode::EnvSet => {
                    let (data, i) = self.env_slot(self.vm.top(m), ins.operand.raw_int())?;
                    self.heap.write_word(data, i, self.vm.val.bits());
                }
                Opcode::GlobalRef => match self.global(ins.operand) {
                    Some(v) => self.vm.val = v,
                    None => {
                        return Err(YkErr::Unbound(self.symbol_name(ins.operand).to_string()))
                    }
                },
                Opcode::GlobalSet => self.set_global(ins.operand, self.vm.val),
                Opcode::Jump => self.vm.pc = ins.operand.raw_int(),
                Opcode::JumpIfFalse => {
                    if self.vm.val.is_nil() {
                        self.vm.pc = ins.operand.raw_int();
                    }
                }
                Opcode::Call => {
                    let ret = (self.vm.code, self.vm.pc, self.vm.fp);
                    self.enter(self.vm.val, m, ret)?;
                }
                Opcode::TailCall => {
                    let (ret, base) = self.frame();
                    let top = self.vm.stack.len();
                    self.vm.stack.copy_within(top - m..top, base);
                    self.vm.stack.truncate(base + m);
                    self.enter(self.vm.val, m, ret)?;
                }
                Opcode::Ret => {
                    let ((code, pc, fp), base) = self.frame();
                    self.vm.stack.truncate(base);
                    self.vm.code = code;
                    self.vm.pc = pc;
                    self.vm.fp = fp;
                }
                Opcode::Varargs => self.collect_rest(m)?,
                Opcode::MakeArray => {
                    let data = self.alloc_block(m * 8);
                    let base = self.vm.stack.len() - m;
                    for i in 0..m {
                        let elt = self.vm.stack[base + i];
                        self.heap.write_word(data, i, elt.bits());
                    }
                    self.vm.val = self.alloc_cell(Cell::Array {
                        data,
                        len: m as u32,
                    });
                    self.vm.stack.truncate(base);
                }
                Opcode::WithCont => {
                    let k = self.alloc_cell(Cell::Cont(Cont {
                        sp: self.vm.stack.len() as u32,
                        fp: self.vm.fp as u32,
                        dyn_sp: self.vm.dyns.len() as u32,
                        depth: self.vm.conts.len() as u32,
                        code: self.vm.code,
                        pc: ins.operand.raw_int() as u32,
                        exited: false,
                    }));
                    self.vm.conts.push(k);
                }
                Opcode::PopCont => {
                    if let Some(k) = self.vm.conts.pop() {
                        if let Some(Cell::Cont(c)) = k.cell_index().map(|i| self.heap.get_mut(i)) {
                            c.exited = true;
                        }
                    }
                }
                Opcode::ContRef => {
                    let at = self.vm.conts.len() - 1 - m;
                    self.vm.val = self.vm.conts[at];
                }
                Opcode::Exit => {
                    let at = self.vm.conts.len() - 1 - m;
                    let k = self.vm.conts[at];
                    self.exit_to(k, self.vm.val)?;
                }
                Opcode::EnvExit => {
                    let (data, i) = self.env_slot(self.vm.top(m), ins.operand.raw_int())?;
                    let k = Value::from_bits(self.heap.read_word(data, i));
                    self.exit_to(k, self.vm.val)?;
                }
                Opcode::DynBind => {
                    let sym = ins.operand;
                    let old = self.global(sym);
                    self.vm.dyns.push(DynBinding { sym, old });
                    self.set_global(sym, self.vm.val);
                }
                Opcode::DynUnbind => {
                    let to = self.vm.dyns.len() - m;
                    self.unwind_dyns(to);
                }
            }
        }
    }

    /// Replaces the arguments past the first `min` with a list of them
    fn collect_rest(&mut self, min: usize) -> Result<(), YkErr> {
        let fp = self.vm.fp;
        let extra = self.vm.argc - min;
        let first = fp - 3 - extra;

        // the list under construction lives in val until it is placed
        self.vm.val = Value::NIL;
        for i in (first..fp - 3).rev() {
            let v = self.vm.stack[i];
            let tail = self.vm.val;
            self.vm.val = self.cons(v, tail);
        }

        if extra == 0 && self.vm.stack.len() >= self.vm.limit {
            return Err(YkErr::StackExhausted);
        }
        let rest = self.vm.val;
        self.vm.stack.drain(first..fp - 3);
        self.vm.stack.insert(first, rest);
        self.vm.fp = fp + 1 - extra;
        Ok(())
    }

    /// Names of the procedures with active frames, innermost first
    pub fn backtrace(&self) -> Vec<String> {
        let mut frames = Vec::new();
        if let Some(n) = self.vm.native {
            frames.push(self.proc_name(n));
        }

        let mut code = self.vm.code;
        let mut fp = self.vm.fp;
        while code.tag() == Tag::Bytecode && code != self.sym.halt {
            frames.push(self.proc_name(code));
            if fp < 3 || fp > self.vm.stack.len() {
                break;
            }
            code = self.vm.stack[fp - 3];
            fp = self.vm.stack[fp - 1].raw_int();
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuki::Config;

    fn rt() -> Runtime {
        Runtime::bare(Config::default())
    }

    fn unit(rt: &mut Runtime, arity: i16) -> Value {
        let name = rt.intern("unit");
        let code = rt.make_bytecode(name, Value::NIL, arity);
        rt.protect(code);
        code
    }

    #[test]
    fn encoding() {
        let mut rt = rt();
        let code = unit(&mut rt, 0);
        let sym = rt.intern("g");
        assert_eq!(rt.emit(code, Opcode::Const, 0, Value::int(5)), 0);
        assert_eq!(rt.emit(code, Opcode::StackRef, 300, Value::NIL), 1);
        assert_eq!(rt.emit(code, Opcode::GlobalRef, 0, sym), 2);

        let ins = rt.instr(code, 1);
        assert_eq!(ins.op, Opcode::StackRef);
        assert_eq!(ins.modifier, 300);
        assert_eq!(rt.instr(code, 0).operand, Value::int(5));
        assert_eq!(rt.instr(code, 2).operand, sym);
    }

    #[test]
    fn growth_keeps_instructions() {
        let mut rt = rt();
        let code = unit(&mut rt, 0);
        for i in 0..100 {
            rt.emit(code, Opcode::Const, i as u16, Value::int(i));
        }
        assert_eq!(rt.code_len(code), 100);
        for i in 0..100 {
            let ins = rt.instr(code, i);
            assert_eq!(ins.modifier, i as u16);
            assert_eq!(ins.operand, Value::int(i as i64));
        }
    }

    #[test]
    fn constant_unit() {
        let mut rt = rt();
        let code = unit(&mut rt, 0);
        rt.emit(code, Opcode::Const, 0, Value::int(42));
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        assert_eq!(rt.run(code).unwrap(), Value::int(42));
        assert_eq!(rt.vm.depth(), 0);
    }

    #[test]
    fn native_call() {
        let mut rt = rt();
        let plus = rt.intern("+");
        let code = unit(&mut rt, 0);
        rt.emit(code, Opcode::Const, 0, Value::int(2));
        rt.emit(code, Opcode::Push, 0, Value::NIL);
        rt.emit(code, Opcode::Const, 0, Value::int(3));
        rt.emit(code, Opcode::Push, 0, Value::NIL);
        rt.emit(code, Opcode::GlobalRef, 0, plus);
        rt.emit(code, Opcode::Call, 2, Value::NIL);
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        assert_eq!(rt.run(code).unwrap(), Value::int(5));
    }

    #[test]
    fn conditional_jump() {
        let mut rt = rt();
        let code = unit(&mut rt, 0);
        rt.emit(code, Opcode::Const, 0, Value::NIL);
        let jf = rt.emit(code, Opcode::JumpIfFalse, 0, Value::NIL);
        rt.emit(code, Opcode::Const, 0, Value::int(1));
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        let target = rt.code_len(code);
        rt.emit(code, Opcode::Const, 0, Value::int(2));
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        rt.patch(code, jf, target);
        assert_eq!(rt.run(code).unwrap(), Value::int(2));
    }

    #[test]
    fn invoke_with_arguments() {
        let mut rt = rt();
        // (named-lambda second (a b) b)
        let code = unit(&mut rt, 2);
        rt.emit(code, Opcode::StackRef, 3, Value::NIL);
        rt.emit(code, Opcode::Ret, 0, Value::NIL);

        let out = rt.invoke(code, &[Value::int(1), Value::int(2)]).unwrap();
        assert_eq!(out, Value::int(2));

        match rt.invoke(code, &[Value::int(1)]) {
            Err(YkErr::Aborted(e)) => assert!(matches!(*e, YkErr::Arity { expected: 2, given: 1, .. })),
            _ => panic!("arity mismatch accepted"),
        }
        assert_eq!(rt.vm.depth(), 0);
    }

    #[test]
    fn rest_arguments() {
        let mut rt = rt();
        // (named-lambda f (a . rest) rest)
        let code = unit(&mut rt, crate::yuki::types::variadic(1));
        rt.emit(code, Opcode::Varargs, 1, Value::NIL);
        rt.emit(code, Opcode::StackRef, 3, Value::NIL);
        rt.emit(code, Opcode::Ret, 0, Value::NIL);

        let out = rt
            .invoke(code, &[Value::int(1), Value::int(2), Value::int(3)])
            .unwrap();
        assert_eq!(rt.print_string(out), "(2 3)");
        let out = rt.invoke(code, &[Value::int(1)]).unwrap();
        assert!(out.is_nil());
        assert_eq!(rt.vm.depth(), 0);
    }

    #[test]
    fn unbound_global() {
        let mut rt = rt();
        let sym = rt.intern("nowhere");
        let code = unit(&mut rt, 0);
        rt.emit(code, Opcode::GlobalRef, 0, sym);
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        match rt.run(code) {
            Err(YkErr::Aborted(e)) => assert!(matches!(*e, YkErr::Unbound(ref n) if n == "nowhere")),
            _ => panic!("unbound reference succeeded"),
        }
        assert!(!rt.vm.active);
    }

    #[test]
    fn escape_unwinds() {
        let mut rt = rt();
        let sym = rt.intern("*v*");
        rt.set_global(sym, Value::int(1));

        let code = unit(&mut rt, 0);
        let wc = rt.emit(code, Opcode::WithCont, 0, Value::NIL);
        rt.emit(code, Opcode::Const, 0, Value::int(2));
        rt.emit(code, Opcode::DynBind, 0, sym);
        rt.emit(code, Opcode::Push, 0, Value::NIL);
        rt.emit(code, Opcode::Push, 0, Value::NIL);
        rt.emit(code, Opcode::Const, 0, Value::int(7));
        rt.emit(code, Opcode::Exit, 0, Value::NIL);
        rt.emit(code, Opcode::PopCont, 0, Value::NIL);
        let after = rt.code_len(code);
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        rt.patch(code, wc, after);

        assert_eq!(rt.run(code).unwrap(), Value::int(7));
        assert_eq!(rt.global(sym), Some(Value::int(1)));
        assert!(rt.vm.dyns.is_empty());
        assert!(rt.vm.conts.is_empty());
    }

    #[test]
    fn reentry_refused() {
        let mut rt = rt();
        let code = unit(&mut rt, 0);
        rt.emit(code, Opcode::Ret, 0, Value::NIL);
        rt.vm.active = true;
        assert!(matches!(rt.run(code), Err(YkErr::Reentrant)));
        rt.vm.active = false;
        assert!(rt.run(code).is_ok());
    }

    #[test]
    fn listing() {
        let mut rt = rt();
        let code = unit(&mut rt, 0);
        rt.emit(code, Opcode::Const, 0, Value::int(9));
        rt.emit(code, Opcode::Jump, 0, Value::int(0));
        let text = rt.disassemble(code);
        assert!(text.starts_with("unit (arity 0, 2 instructions)"));
        assert!(text.contains("Const 9"));
        assert!(text.contains("Jump -> 0"));
    }
}
