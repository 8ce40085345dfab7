// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/compiler.rs

// Compiler from value trees to bytecode. Tracks the operand stack
// layout at every point so variables resolve to fixed stack offsets;
// procedures that refer to enclosing variables or continuations become
// closures holding flat copies of them.

// <>

use std::fmt;

use super::eval::Opcode;
use super::types::{arity_accepts, variadic, DeclKind, Tag, Value};
use super::{Runtime, YkErr};

/// Kind of problem noticed while compiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnKind {
    /// Global neither bound nor declared
    Undeclared,
    /// Call to a declared function with the wrong argument count
    Arity { expected: i16, given: usize },
    /// Declared function assigned something other than a procedure form
    AssignFunction,
    AssignConstant,
    /// Declared function bound dynamically
    DynamicFunction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarnKind,
    /// Name of the symbol concerned
    pub name: String,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WarnKind::Undeclared => write!(f, "undeclared variable {}", self.name),
            WarnKind::Arity { expected, given } => write!(
                f,
                "{} called with {} arguments, declared arity {}",
                self.name, given, expected
            ),
            WarnKind::AssignFunction => {
                write!(f, "function {} assigned a non-procedure form", self.name)
            }
            WarnKind::AssignConstant => write!(f, "assignment to constant {}", self.name),
            WarnKind::DynamicFunction => write!(f, "dynamic binding of function {}", self.name),
        }
    }
}

/// One entry of the modeled operand stack
#[derive(Debug, Clone, Copy, PartialEq)]
enum Lex {
    Var(Value),
    /// The closure environment of the current procedure
    EnvPtr,
    /// Saved return words of the current frame
    RetFrame,
    /// Temporary, such as a pushed argument
    Unused,
    /// Dynamic binding; occupies no slot but hides lexical bindings
    Dynamic(Value),
}

impl Lex {
    fn slots(self) -> usize {
        match self {
            Lex::RetFrame => 3,
            Lex::Dynamic(_) => 0,
            _ => 1,
        }
    }
}

/// Compilation state of one procedure body
struct Scope {
    code: Value,
    lex: Vec<Lex>,
    /// Continuations established in this body, oldest first
    conts: Vec<Value>,
    /// Captured variables, stored after the captured continuations
    closed_vars: Vec<Value>,
    closed_conts: Vec<Value>,
}

impl Scope {
    fn new(code: Value, lex: Vec<Lex>) -> Self {
        Scope {
            code,
            lex,
            conts: Vec::new(),
            closed_vars: Vec::new(),
            closed_conts: Vec::new(),
        }
    }
}

struct CompState {
    scope: Scope,
    outer: Vec<Scope>,
    warnings: Vec<Warning>,
    /// Macro expansions already performed, by form identity
    expansions: Vec<(Value, Value)>,
    /// Root slot holding every expansion until compilation ends
    expansion_root: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarLoc {
    Stack(usize),
    Env { env: usize, index: usize },
    Global,
}

/// Where a continuation is found
enum ContLoc {
    Stack(usize),
    Env { env: usize, index: usize },
}

/// Free references of a procedure body
#[derive(Default)]
struct Captures {
    vars: Vec<Value>,
    conts: Vec<Value>,
}

fn modifier(n: usize) -> Result<u16, YkErr> {
    u16::try_from(n).map_err(|_| YkErr::Syntax(format!("operand {} out of range", n)))
}

impl Runtime {
    /// Compiles `forms`, a list, into the empty bytecode `target` so
    /// that running it evaluates the forms in order
    pub fn compile(&mut self, forms: Value, target: Value) -> Result<Vec<Warning>, YkErr> {
        self.with_roots(|rt| {
            rt.protect(forms);
            rt.protect(target);
            let expansion_root = rt.protect(Value::NIL);

            let mut st = CompState {
                scope: Scope::new(target, vec![Lex::RetFrame]),
                outer: Vec::new(),
                warnings: Vec::new(),
                expansions: Vec::new(),
                expansion_root,
            };

            let items = rt
                .list_vec(forms)
                .map_err(|_| YkErr::Syntax("forms must be a proper list".to_string()))?;
            rt.compile_body(&mut st, &items, false)?;
            rt.op(&mut st, Opcode::Ret, 0, Value::NIL)?;

            Ok(rt.finish_warnings(st.warnings))
        })
    }

    /// Drops warnings made obsolete by later declarations and logs the
    /// rest
    fn finish_warnings(&self, warnings: Vec<Warning>) -> Vec<Warning> {
        let mut out: Vec<Warning> = Vec::new();
        for w in warnings {
            if w.kind == WarnKind::Undeclared {
                let settled = self
                    .find_symbol(&w.name)
                    .map(|s| self.symbol(s).declared || self.global(s).is_some())
                    .unwrap_or(false);
                if settled {
                    continue;
                }
            }
            if !out.contains(&w) {
                log::warn!("{}", w);
                out.push(w);
            }
        }
        out
    }

    fn warn(&self, st: &mut CompState, kind: WarnKind, sym: Value) {
        st.warnings.push(Warning {
            kind,
            name: self.symbol_name(sym).to_string(),
        });
    }

    fn op(&mut self, st: &mut CompState, op: Opcode, m: usize, operand: Value) -> Result<usize, YkErr> {
        let m = modifier(m)?;
        Ok(self.emit(st.scope.code, op, m, operand))
    }

    fn here(&self, st: &CompState) -> usize {
        self.code_len(st.scope.code)
    }

    fn push_temp(&mut self, st: &mut CompState) -> Result<(), YkErr> {
        self.op(st, Opcode::Push, 0, Value::NIL)?;
        st.scope.lex.push(Lex::Unused);
        Ok(())
    }

    fn drop_entries(st: &mut CompState, n: usize) {
        let len = st.scope.lex.len();
        st.scope.lex.truncate(len - n);
    }

    // resolution

    fn resolve(&self, st: &CompState, sym: Value) -> VarLoc {
        let mut off = 0;
        let mut env = None;
        for entry in st.scope.lex.iter().rev() {
            match *entry {
                Lex::Var(s) if s == sym => return VarLoc::Stack(off),
                Lex::Dynamic(s) if s == sym => return VarLoc::Global,
                Lex::EnvPtr if env.is_none() => env = Some(off),
                _ => {}
            }
            off += entry.slots();
        }

        if let Some(env) = env {
            if let Some(i) = st.scope.closed_vars.iter().position(|&v| v == sym) {
                return VarLoc::Env {
                    env,
                    index: st.scope.closed_conts.len() + i,
                };
            }
        }
        VarLoc::Global
    }

    fn env_offset(&self, st: &CompState) -> Option<usize> {
        let mut off = 0;
        for entry in st.scope.lex.iter().rev() {
            if *entry == Lex::EnvPtr {
                return Some(off);
            }
            off += entry.slots();
        }
        None
    }

    fn resolve_cont(&self, st: &CompState, name: Value) -> Option<ContLoc> {
        if let Some(p) = st.scope.conts.iter().rposition(|&k| k == name) {
            return Some(ContLoc::Stack(st.scope.conts.len() - 1 - p));
        }
        let i = st.scope.closed_conts.iter().position(|&k| k == name)?;
        let env = self.env_offset(st)?;
        Some(ContLoc::Env { env, index: i })
    }

    fn lexically_bound(&self, st: &CompState, sym: Value) -> bool {
        self.resolve(st, sym) != VarLoc::Global
    }

    /// The macro procedure named by `head`, if it names one here
    fn macro_for(&self, st: &CompState, head: Value) -> Option<Value> {
        if !head.is_symbol() || self.lexically_bound(st, head) {
            return None;
        }
        let rec = self.symbol(head);
        if rec.kind != DeclKind::Macro {
            return None;
        }
        rec.value
            .filter(|v| matches!(v.tag(), Tag::Bytecode | Tag::Closure | Tag::Native))
    }

    fn expand(&mut self, st: &mut CompState, mac: Value, form: Value) -> Result<Value, YkErr> {
        if let Some(&(_, exp)) = st.expansions.iter().find(|(f, _)| *f == form) {
            return Ok(exp);
        }
        let args = self.list_vec(self.cdr(form)?)?;
        let exp = self.invoke(mac, &args)?;

        let slot = st.expansion_root;
        self.with_roots(|rt| {
            rt.protect(exp);
            let kept = rt.roots[slot];
            let kept = rt.cons(exp, kept);
            rt.root_set(slot, kept);
        });
        st.expansions.push((form, exp));
        Ok(exp)
    }

    fn is_special(&self, head: Value) -> bool {
        let s = &self.sym;
        [
            s.quote,
            s.if_,
            s.do_,
            s.set,
            s.let_,
            s.dynamic_let,
            s.comptime,
            s.named_lambda,
            s.with_cont,
            s.exit,
            s.loop_,
        ]
        .contains(&head)
    }

    // compilation

    fn compile_body(&mut self, st: &mut CompState, forms: &[Value], tail: bool) -> Result<(), YkErr> {
        match forms.split_last() {
            None => {
                self.op(st, Opcode::Const, 0, Value::NIL)?;
            }
            Some((last, init)) => {
                for &f in init {
                    self.compile_form(st, f, false)?;
                }
                self.compile_form(st, *last, tail)?;
            }
        }
        Ok(())
    }

    fn compile_form(&mut self, st: &mut CompState, form: Value, tail: bool) -> Result<(), YkErr> {
        if form.is_symbol() {
            return self.compile_ref(st, form);
        }
        let (head, args) = match self.pair(form) {
            Some(p) => p,
            None => {
                self.op(st, Opcode::Const, 0, form)?;
                return Ok(());
            }
        };

        if self.is_special(head) {
            return self.compile_special(st, head, args, form, tail);
        }
        if let Some(mac) = self.macro_for(st, head) {
            let exp = self.expand(st, mac, form)?;
            return self.compile_form(st, exp, tail);
        }
        self.compile_call(st, head, args, tail)
    }

    fn compile_ref(&mut self, st: &mut CompState, sym: Value) -> Result<(), YkErr> {
        match self.resolve(st, sym) {
            VarLoc::Stack(off) => self.op(st, Opcode::StackRef, off, Value::NIL)?,
            VarLoc::Env { env, index } => {
                self.op(st, Opcode::EnvRef, env, Value::int(index as i64))?
            }
            VarLoc::Global => {
                let rec = self.symbol(sym);
                match (rec.kind, rec.value) {
                    (DeclKind::Constant, Some(v)) => self.op(st, Opcode::Const, 0, v)?,
                    (_, value) => {
                        if !rec.declared && value.is_none() {
                            self.warn(st, WarnKind::Undeclared, sym);
                        }
                        self.op(st, Opcode::GlobalRef, 0, sym)?
                    }
                }
            }
        };
        Ok(())
    }

    fn syntax_parts(&self, what: Value, args: Value) -> Result<Vec<Value>, YkErr> {
        self.list_vec(args)
            .map_err(|_| YkErr::Syntax(format!("malformed {} form", self.symbol_name(what))))
    }

    fn compile_special(
        &mut self,
        st: &mut CompState,
        head: Value,
        args: Value,
        form: Value,
        tail: bool,
    ) -> Result<(), YkErr> {
        let parts = self.syntax_parts(head, args)?;
        let bad = |rt: &Runtime| {
            Err(YkErr::Syntax(format!(
                "malformed {} form: {}",
                rt.symbol_name(head),
                rt.print_string(form)
            )))
        };

        if head == self.sym.quote {
            if parts.len() != 1 {
                return bad(self);
            }
            self.op(st, Opcode::Const, 0, parts[0])?;
        } else if head == self.sym.if_ {
            if parts.len() < 2 || parts.len() > 3 {
                return bad(self);
            }
            self.compile_form(st, parts[0], false)?;
            let jf = self.op(st, Opcode::JumpIfFalse, 0, Value::NIL)?;
            self.compile_form(st, parts[1], tail)?;
            let j = self.op(st, Opcode::Jump, 0, Value::NIL)?;
            let alt = self.here(st);
            self.patch(st.scope.code, jf, alt);
            match parts.get(2) {
                Some(&e) => self.compile_form(st, e, tail)?,
                None => {
                    self.op(st, Opcode::Const, 0, Value::NIL)?;
                }
            }
            let end = self.here(st);
            self.patch(st.scope.code, j, end);
        } else if head == self.sym.do_ {
            self.compile_body(st, &parts, tail)?;
        } else if head == self.sym.set {
            if parts.len() != 2 || !parts[0].is_symbol() {
                return bad(self);
            }
            self.compile_set(st, parts[0], parts[1])?;
        } else if head == self.sym.let_ {
            if parts.is_empty() {
                return bad(self);
            }
            self.compile_let(st, parts[0], &parts[1..], tail)?;
        } else if head == self.sym.dynamic_let {
            if parts.is_empty() {
                return bad(self);
            }
            self.compile_dynamic_let(st, parts[0], &parts[1..])?;
        } else if head == self.sym.comptime {
            self.compile_comptime(st, args)?;
        } else if head == self.sym.named_lambda {
            if parts.len() < 2 || !(parts[0].is_symbol() || parts[0].is_nil()) {
                return bad(self);
            }
            self.compile_lambda(st, parts[0], parts[1], &parts[2..])?;
        } else if head == self.sym.with_cont {
            if parts.is_empty() || !parts[0].is_symbol() {
                return bad(self);
            }
            let at = self.op(st, Opcode::WithCont, 0, Value::NIL)?;
            st.scope.conts.push(parts[0]);
            let body = self.compile_body(st, &parts[1..], false);
            st.scope.conts.pop();
            body?;
            self.op(st, Opcode::PopCont, 0, Value::NIL)?;
            let resume = self.here(st);
            self.patch(st.scope.code, at, resume);
        } else if head == self.sym.exit {
            if parts.is_empty() || parts.len() > 2 || !parts[0].is_symbol() {
                return bad(self);
            }
            let loc = self.resolve_cont(st, parts[0]).ok_or_else(|| {
                YkErr::UnknownCont(self.symbol_name(parts[0]).to_string())
            })?;
            match parts.get(1) {
                Some(&v) => self.compile_form(st, v, false)?,
                None => {
                    self.op(st, Opcode::Const, 0, Value::NIL)?;
                }
            }
            match loc {
                ContLoc::Stack(k) => self.op(st, Opcode::Exit, k, Value::NIL)?,
                ContLoc::Env { env, index } => {
                    self.op(st, Opcode::EnvExit, env, Value::int(index as i64))?
                }
            };
        } else {
            // loop
            let start = self.here(st);
            for &f in &parts {
                self.compile_form(st, f, false)?;
            }
            self.op(st, Opcode::Jump, 0, Value::int(start as i64))?;
        }
        Ok(())
    }

    fn compile_set(&mut self, st: &mut CompState, sym: Value, value: Value) -> Result<(), YkErr> {
        let loc = self.resolve(st, sym);
        if loc == VarLoc::Global {
            let rec = self.symbol(sym);
            let lambda_form = self
                .pair(value)
                .map(|(h, _)| h == self.sym.named_lambda)
                .unwrap_or(false);
            if rec.kind == DeclKind::Function && rec.declared && !lambda_form {
                self.warn(st, WarnKind::AssignFunction, sym);
            } else if rec.kind == DeclKind::Constant && rec.declared {
                self.warn(st, WarnKind::AssignConstant, sym);
            }
        }

        self.compile_form(st, value, false)?;
        match loc {
            VarLoc::Stack(off) => self.op(st, Opcode::StackSet, off, Value::NIL)?,
            VarLoc::Env { env, index } => {
                self.op(st, Opcode::EnvSet, env, Value::int(index as i64))?
            }
            VarLoc::Global => self.op(st, Opcode::GlobalSet, 0, sym)?,
        };
        Ok(())
    }

    /// Splits a binding list into names and initial value forms
    fn bindings(&self, what: Value, list: Value) -> Result<Vec<(Value, Value)>, YkErr> {
        let malformed = || YkErr::Syntax(format!("malformed {} bindings", self.symbol_name(what)));
        let mut out = Vec::new();
        for b in self.list_vec(list).map_err(|_| malformed())? {
            if b.is_symbol() {
                out.push((b, Value::NIL));
                continue;
            }
            let parts = self.list_vec(b).map_err(|_| malformed())?;
            match parts.as_slice() {
                [name] if name.is_symbol() => out.push((*name, Value::NIL)),
                [name, init] if name.is_symbol() => out.push((*name, *init)),
                _ => return Err(malformed()),
            }
        }
        Ok(out)
    }

    fn compile_let(&mut self, st: &mut CompState, list: Value, body: &[Value], tail: bool) -> Result<(), YkErr> {
        let binds = self.bindings(self.sym.let_, list)?;
        let n = binds.len();

        for &(_, init) in &binds {
            self.compile_form(st, init, false)?;
            self.push_temp(st)?;
        }
        let first = st.scope.lex.len() - n;
        for (i, &(name, _)) in binds.iter().enumerate() {
            st.scope.lex[first + i] = Lex::Var(name);
        }

        self.compile_body(st, body, tail)?;
        if n > 0 {
            self.op(st, Opcode::Drop, n, Value::NIL)?;
        }
        Self::drop_entries(st, n);
        Ok(())
    }

    fn compile_dynamic_let(&mut self, st: &mut CompState, list: Value, body: &[Value]) -> Result<(), YkErr> {
        let binds = self.bindings(self.sym.dynamic_let, list)?;
        let n = binds.len();

        for &(name, init) in &binds {
            if self.symbol(name).kind == DeclKind::Function {
                self.warn(st, WarnKind::DynamicFunction, name);
            }
            self.compile_form(st, init, false)?;
            self.op(st, Opcode::DynBind, 0, name)?;
            st.scope.lex.push(Lex::Dynamic(name));
        }

        self.compile_body(st, body, false)?;
        if n > 0 {
            self.op(st, Opcode::DynUnbind, n, Value::NIL)?;
        }
        Self::drop_entries(st, n);
        Ok(())
    }

    /// Evaluates the body now and embeds its value as a constant
    fn compile_comptime(&mut self, st: &mut CompState, body: Value) -> Result<(), YkErr> {
        let v = self.with_roots(|rt| {
            let unit = rt.make_bytecode(rt.sym.comptime, Value::NIL, 0);
            rt.protect(unit);
            let form = rt.cons(rt.sym.do_, body);
            rt.protect(form);
            let forms = rt.cons(form, Value::NIL);

            rt.compile(forms, unit)?;
            rt.run(unit)
        })?;
        self.op(st, Opcode::Const, 0, v)?;
        Ok(())
    }

    fn compile_lambda(
        &mut self,
        st: &mut CompState,
        name: Value,
        params: Value,
        body: &[Value],
    ) -> Result<(), YkErr> {
        let mut fixed = Vec::new();
        let mut cur = params;
        while let Some((p, rest)) = self.pair(cur) {
            if !p.is_symbol() {
                return Err(YkErr::Syntax(format!("bad parameter {}", self.print_string(p))));
            }
            fixed.push(p);
            cur = rest;
        }
        let rest = match cur {
            v if v.is_nil() => None,
            v if v.is_symbol() => Some(v),
            v => return Err(YkErr::Syntax(format!("bad parameter list {}", self.print_string(v)))),
        };
        let arity = match rest {
            Some(_) => variadic(fixed.len()),
            None => fixed.len() as i16,
        };

        let (doc, body) = match body {
            [d, rest @ ..] if !rest.is_empty() && self.is_string(*d) => (*d, rest),
            _ => (Value::NIL, body),
        };

        let mut bound: Vec<Value> = fixed.iter().copied().chain(rest).collect();
        let mut caps = Captures::default();
        for &f in body {
            self.free_refs(st, f, &mut bound, &mut Vec::new(), &mut caps)?;
        }

        let captures = caps.vars.len() + caps.conts.len();
        self.with_roots(|rt| {
            let code = rt.make_bytecode(name, doc, arity);
            rt.protect(code);

            let mut lex: Vec<Lex> = fixed.iter().chain(rest.iter()).map(|&p| Lex::Var(p)).collect();
            lex.push(Lex::RetFrame);
            if captures > 0 {
                lex.push(Lex::EnvPtr);
            }
            let mut inner = Scope::new(code, lex);
            inner.closed_vars = caps.vars.clone();
            inner.closed_conts = caps.conts.clone();

            let enclosing = std::mem::replace(&mut st.scope, inner);
            st.outer.push(enclosing);
            let built = rt.compile_procedure_body(st, rest.is_some(), fixed.len(), body);
            if let Some(enclosing) = st.outer.pop() {
                st.scope = enclosing;
            }
            built?;

            rt.op(st, Opcode::Const, 0, code)?;
            if captures == 0 {
                return Ok(());
            }

            rt.push_temp(st)?;
            for &k in &caps.conts {
                match rt.resolve_cont(st, k) {
                    Some(ContLoc::Stack(i)) => rt.op(st, Opcode::ContRef, i, Value::NIL)?,
                    Some(ContLoc::Env { env, index }) => {
                        rt.op(st, Opcode::EnvRef, env, Value::int(index as i64))?
                    }
                    None => return Err(YkErr::UnknownCont(rt.symbol_name(k).to_string())),
                };
                rt.push_temp(st)?;
            }
            for &v in &caps.vars {
                rt.compile_ref(st, v)?;
                rt.push_temp(st)?;
            }
            rt.op(st, Opcode::MakeArray, captures, Value::NIL)?;
            Self::drop_entries(st, captures);
            rt.push_temp(st)?;
            let mc = rt.sym.make_closure;
            rt.op(st, Opcode::Const, 0, mc)?;
            rt.op(st, Opcode::Call, 2, Value::NIL)?;
            Self::drop_entries(st, 2);
            Ok(())
        })
    }

    fn compile_procedure_body(
        &mut self,
        st: &mut CompState,
        variadic: bool,
        min: usize,
        body: &[Value],
    ) -> Result<(), YkErr> {
        if variadic {
            self.op(st, Opcode::Varargs, min, Value::NIL)?;
        }
        self.compile_body(st, body, true)?;
        self.op(st, Opcode::Ret, 0, Value::NIL)?;
        Ok(())
    }

    /// Collects the variables and continuations `form` refers to that
    /// are bound in the scope enclosing the procedure being compiled
    fn free_refs(
        &mut self,
        st: &mut CompState,
        form: Value,
        bound: &mut Vec<Value>,
        conts_bound: &mut Vec<Value>,
        caps: &mut Captures,
    ) -> Result<(), YkErr> {
        if form.is_symbol() {
            if !bound.contains(&form) && !caps.vars.contains(&form) && self.lexically_bound(st, form) {
                caps.vars.push(form);
            }
            return Ok(());
        }
        let (head, args) = match self.pair(form) {
            Some(p) => p,
            None => return Ok(()),
        };

        if head == self.sym.quote || head == self.sym.comptime {
            return Ok(());
        }

        if head == self.sym.let_ || head == self.sym.dynamic_let {
            let (list, body) = self.pair(args).unwrap_or((Value::NIL, Value::NIL));
            let binds = self.bindings(head, list)?;
            let depth = bound.len();
            for &(_, init) in &binds {
                self.free_refs(st, init, bound, conts_bound, caps)?;
            }
            // dynamic bindings are global, so only let shadows
            if head == self.sym.let_ {
                bound.extend(binds.iter().map(|&(name, _)| name));
            }
            let walked = self.free_refs_all(st, body, bound, conts_bound, caps);
            bound.truncate(depth);
            return walked;
        }

        if head == self.sym.named_lambda {
            let parts = self.syntax_parts(head, args)?;
            if parts.len() < 2 {
                return Err(YkErr::Syntax("malformed named-lambda form".to_string()));
            }
            let depth = bound.len();
            let mut cur = parts[1];
            while let Some((p, rest)) = self.pair(cur) {
                bound.push(p);
                cur = rest;
            }
            if cur.is_symbol() {
                bound.push(cur);
            }
            let mut walked = Ok(());
            for &f in &parts[2..] {
                walked = self.free_refs(st, f, bound, conts_bound, caps);
                if walked.is_err() {
                    break;
                }
            }
            bound.truncate(depth);
            return walked;
        }

        if head == self.sym.with_cont {
            let (name, body) = self.pair(args).unwrap_or((Value::NIL, Value::NIL));
            conts_bound.push(name);
            let walked = self.free_refs_all(st, body, bound, conts_bound, caps);
            conts_bound.pop();
            return walked;
        }

        if head == self.sym.exit {
            let (name, rest) = self.pair(args).unwrap_or((Value::NIL, Value::NIL));
            if !conts_bound.contains(&name)
                && !caps.conts.contains(&name)
                && self.resolve_cont(st, name).is_some()
            {
                caps.conts.push(name);
            }
            return self.free_refs_all(st, rest, bound, conts_bound, caps);
        }

        if !bound.contains(&head) {
            if let Some(mac) = self.macro_for(st, head) {
                let exp = self.expand(st, mac, form)?;
                return self.free_refs(st, exp, bound, conts_bound, caps);
            }
        }

        // set!, if, do, loop and calls: every element is a reference
        let start = if self.is_special(head) { args } else { form };
        self.free_refs_all(st, start, bound, conts_bound, caps)
    }

    fn free_refs_all(
        &mut self,
        st: &mut CompState,
        list: Value,
        bound: &mut Vec<Value>,
        conts_bound: &mut Vec<Value>,
        caps: &mut Captures,
    ) -> Result<(), YkErr> {
        let mut cur = list;
        while let Some((f, rest)) = self.pair(cur) {
            self.free_refs(st, f, bound, conts_bound, caps)?;
            cur = rest;
        }
        Ok(())
    }

    fn compile_call(&mut self, st: &mut CompState, head: Value, args: Value, tail: bool) -> Result<(), YkErr> {
        let argv = self.list_vec(args).map_err(|_| {
            YkErr::Syntax(format!("improper argument list in call to {}", self.print_string(head)))
        })?;
        let argc = argv.len();

        if head.is_symbol() && !self.lexically_bound(st, head) {
            let rec = self.symbol(head);
            if let (DeclKind::Function, Some(arity)) = (rec.kind, rec.arity) {
                if !arity_accepts(arity, argc) {
                    self.warn(
                        st,
                        WarnKind::Arity {
                            expected: arity,
                            given: argc,
                        },
                        head,
                    );
                }
            }
        }

        for &a in &argv {
            self.compile_form(st, a, false)?;
            self.push_temp(st)?;
        }
        self.compile_form(st, head, false)?;
        let op = if tail { Opcode::TailCall } else { Opcode::Call };
        self.op(st, op, argc, Value::NIL)?;
        Self::drop_entries(st, argc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuki::Config;

    fn compile_str(rt: &mut Runtime, code: &str) -> (Value, Vec<Warning>) {
        let forms = rt.read_all(code).unwrap();
        rt.protect(forms);
        let name = rt.intern("test");
        let unit = rt.make_bytecode_unit(name, 0).unwrap();
        rt.protect(unit);
        let warnings = rt.compile(forms, unit).unwrap();
        (unit, warnings)
    }

    fn ops(rt: &Runtime, code: Value) -> Vec<Opcode> {
        (0..rt.code_len(code)).map(|i| rt.instr(code, i).op).collect()
    }

    #[test]
    fn constant_form() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, warnings) = compile_str(&mut rt, "5");
        assert!(warnings.is_empty());
        assert_eq!(ops(&rt, unit), vec![Opcode::Const, Opcode::Ret]);
        assert_eq!(rt.run(unit).unwrap(), Value::int(5));
    }

    #[test]
    fn empty_unit() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, _) = compile_str(&mut rt, "");
        assert!(rt.run(unit).unwrap().is_nil());
    }

    #[test]
    fn let_slots() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, _) = compile_str(&mut rt, "(let ((a 1) (b 2)) (cons a b))");
        assert_eq!(
            ops(&rt, unit),
            vec![
                Opcode::Const,
                Opcode::Push,
                Opcode::Const,
                Opcode::Push,
                // argument a, then b, then the procedure
                Opcode::StackRef,
                Opcode::Push,
                Opcode::StackRef,
                Opcode::Push,
                Opcode::GlobalRef,
                Opcode::Call,
                Opcode::Drop,
                Opcode::Ret,
            ]
        );
        assert_eq!(rt.instr(unit, 4).modifier, 1);
        assert_eq!(rt.instr(unit, 6).modifier, 1);
        let v = rt.run(unit).unwrap();
        assert_eq!(rt.print_string(v), "(1 . 2)");
    }

    #[test]
    fn tail_position() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, _) = compile_str(&mut rt, "(named-lambda f (x) (if x (f x) (cons (f x) x)))");
        let code = rt.instr(unit, 0).operand;
        let body = ops(&rt, code);
        assert!(body.contains(&Opcode::TailCall));
        assert!(body.contains(&Opcode::Call));
        assert_eq!(body.last(), Some(&Opcode::Ret));
    }

    #[test]
    fn closure_capture() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, _) = compile_str(&mut rt, "(let ((x 1)) (named-lambda f () x))");
        let listing = ops(&rt, unit);
        assert!(listing.contains(&Opcode::MakeArray));
        let v = rt.run(unit).unwrap();
        assert_eq!(v.tag(), Tag::Closure);
        let out = rt.invoke(v, &[]).unwrap();
        assert_eq!(out, Value::int(1));
    }

    #[test]
    fn no_capture_no_closure() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, _) = compile_str(&mut rt, "(let ((x 1)) (named-lambda f (x) x))");
        assert!(!ops(&rt, unit).contains(&Opcode::MakeArray));
        let v = rt.run(unit).unwrap();
        assert_eq!(v.tag(), Tag::Bytecode);
    }

    #[test]
    fn unknown_continuation() {
        let mut rt = Runtime::bare(Config::default());
        let forms = rt.read_all("(exit nowhere 1)").unwrap();
        rt.protect(forms);
        let name = rt.intern("test");
        let unit = rt.make_bytecode_unit(name, 0).unwrap();
        assert!(matches!(rt.compile(forms, unit), Err(YkErr::UnknownCont(_))));
    }

    #[test]
    fn malformed_forms() {
        let mut rt = Runtime::bare(Config::default());
        for code in ["(if)", "(quote 1 2)", "(let ((1 2)) 3)", "(set! 5 1)", "(named-lambda f (1) 1)", "(f . 1)"] {
            let forms = rt.read_all(code).unwrap();
            rt.protect(forms);
            let name = rt.intern("test");
            let unit = rt.make_bytecode_unit(name, 0).unwrap();
            assert!(
                matches!(rt.compile(forms, unit), Err(YkErr::Syntax(_))),
                "compiled {}",
                code
            );
        }
    }

    #[test]
    fn assignment_warnings() {
        let mut rt = Runtime::bare(Config::default());
        let (_, warnings) = compile_str(
            &mut rt,
            "(set! car 5)
             (set! nil 1)
             (dynamic-let ((cons 1)) 2)",
        );
        let kinds: Vec<WarnKind> = warnings.iter().map(|w| w.kind).collect();
        assert!(kinds.contains(&WarnKind::AssignFunction));
        assert!(kinds.contains(&WarnKind::AssignConstant));
        assert!(kinds.contains(&WarnKind::DynamicFunction));
    }

    #[test]
    fn undeclared_once() {
        let mut rt = Runtime::bare(Config::default());
        let (_, warnings) = compile_str(&mut rt, "(do mystery mystery)");
        assert_eq!(
            warnings,
            vec![Warning {
                kind: WarnKind::Undeclared,
                name: "mystery".to_string()
            }]
        );
    }

    #[test]
    fn constants_fold() {
        let mut rt = Runtime::bare(Config::default());
        let (unit, _) = compile_str(&mut rt, "nil");
        assert_eq!(ops(&rt, unit), vec![Opcode::Const, Opcode::Ret]);
    }
}
