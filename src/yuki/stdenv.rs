// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/stdenv.rs

// Native procedures bound in every runtime.

// <>

use std::cmp::Ordering;

use super::parser::parse_number;
use super::types::{Block, Cell, DeclKind, NativeFn, Tag, Value, INT_MAX, INT_MIN};
use super::{Runtime, YkErr};

/// Declares a table of native procedures
///
/// Each entry gives a name, an arity code (negative `n` accepts at
/// least `-n - 1` arguments), the fixed argument names, optionally a
/// name for the remaining arguments, and a body.
macro_rules! yk_fn {
    ( const $array:ident; $rt:ident;
      $( $name:literal $argct:literal [ $($args:ident),* $(; $rest:ident)? ] $body:block )+
    ) => {
        pub const $array: &[(&str, NativeFn, i16)] =
            &[$(($name, |
                _rt: &mut Runtime,
                _args: &[Value],
              | -> Result<Value, YkErr> {
                    let $rt = _rt;
                    let _ = &$rt;

                    let mut _ind = 0;
                    $(
                        let $args = _args[_ind];
                        _ind += 1;
                    )*
                    $( let $rest = &_args[_ind..]; )?

                    $body
                },
                $argct)),+];
    };
}

#[derive(Clone, Copy)]
enum Num {
    I(i64),
    F(f32),
}

impl Num {
    fn float(self) -> f32 {
        match self {
            Num::I(i) => i as f32,
            Num::F(f) => f,
        }
    }
}

fn num(rt: &Runtime, v: Value) -> Result<Num, YkErr> {
    if let Some(i) = v.as_int() {
        Ok(Num::I(i))
    } else if let Some(f) = v.as_float() {
        Ok(Num::F(f))
    } else {
        Err(rt.type_err("number", v))
    }
}

fn int_arg(rt: &Runtime, v: Value) -> Result<i64, YkErr> {
    v.as_int().ok_or_else(|| rt.type_err("integer", v))
}

fn index_arg(rt: &Runtime, v: Value) -> Result<usize, YkErr> {
    match v.as_int() {
        Some(i) if i >= 0 => Ok(i as usize),
        _ => Err(rt.type_err("non-negative integer", v)),
    }
}

fn make_int(i: Option<i64>) -> Result<Value, YkErr> {
    match i {
        Some(i) if (INT_MIN..=INT_MAX).contains(&i) => Ok(Value::int(i)),
        _ => Err(YkErr::Signal("integer overflow".to_string())),
    }
}

fn bool_val(rt: &Runtime, b: bool) -> Value {
    if b {
        rt.sym.t
    } else {
        Value::NIL
    }
}

/// Folds arithmetic over numbers, switching to floats once any
/// argument is a float
fn arith(
    rt: &Runtime,
    init: Num,
    args: &[Value],
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f32, f32) -> f32,
) -> Result<Value, YkErr> {
    let mut acc = init;
    for &a in args {
        acc = match (acc, num(rt, a)?) {
            (Num::I(x), Num::I(y)) => match int_op(x, y) {
                Some(r) => Num::I(r),
                None if y == 0 => return Err(YkErr::Signal("division by zero".to_string())),
                None => return Err(YkErr::Signal("integer overflow".to_string())),
            },
            (x, y) => Num::F(float_op(x.float(), y.float())),
        };
    }
    match acc {
        Num::I(i) => make_int(Some(i)),
        Num::F(f) => Ok(Value::float(f)),
    }
}

/// Holds when `test` is true of every adjacent pair of arguments
fn compare(rt: &Runtime, args: &[Value], test: fn(Ordering) -> bool) -> Result<Value, YkErr> {
    let mut prev = num(rt, args[0])?;
    for &a in &args[1..] {
        let next = num(rt, a)?;
        // integer pairs compare exactly
        let order = match (prev, next) {
            (Num::I(x), Num::I(y)) => Some(x.cmp(&y)),
            (Num::I(x), Num::F(y)) => (x as f64).partial_cmp(&(y as f64)),
            (Num::F(x), Num::I(y)) => (x as f64).partial_cmp(&(y as f64)),
            (Num::F(x), Num::F(y)) => x.partial_cmp(&y),
        };
        let holds = order.map(test).unwrap_or(false);
        if !holds {
            return Ok(Value::NIL);
        }
        prev = next;
    }
    Ok(rt.sym.t)
}

fn cell_is(rt: &Runtime, v: Value, test: fn(&Cell) -> bool) -> bool {
    v.tag() == Tag::Object && v.cell_index().map(|i| test(rt.heap.get(i))).unwrap_or(false)
}

fn array_parts(rt: &Runtime, v: Value) -> Result<(Block, usize), YkErr> {
    match v.cell_index().filter(|_| v.tag() == Tag::Object).map(|i| rt.heap.get(i)) {
        Some(Cell::Array { data, len }) => Ok((*data, *len as usize)),
        _ => Err(rt.type_err("array", v)),
    }
}

/// Text of a string or symbol argument
fn text_arg(rt: &Runtime, v: Value) -> Result<String, YkErr> {
    if v.is_symbol() {
        Ok(rt.symbol_name(v).to_string())
    } else {
        rt.string_value(v)
    }
}

/// Stream given as an optional argument, or the standard one
fn out_stream(rt: &Runtime, rest: &[Value]) -> Result<Value, YkErr> {
    match rest.first() {
        Some(&s) => Ok(s),
        None => rt.standard_output(),
    }
}

fn in_stream(rt: &Runtime, rest: &[Value]) -> Result<Value, YkErr> {
    match rest.first() {
        Some(&s) => Ok(s),
        None => rt.standard_input(),
    }
}

yk_fn! {
    const NATIVES;
    rt;

    // arithmetic

    "+" -1 [; nums] {
        arith(rt, Num::I(0), nums, i64::checked_add, |x, y| x + y)
    }

    "*" -1 [; nums] {
        arith(rt, Num::I(1), nums, i64::checked_mul, |x, y| x * y)
    }

    "-" -2 [fst; rest] {
        if rest.is_empty() {
            match num(rt, fst)? {
                Num::I(i) => make_int(i.checked_neg()),
                Num::F(f) => Ok(Value::float(-f)),
            }
        } else {
            arith(rt, num(rt, fst)?, rest, i64::checked_sub, |x, y| x - y)
        }
    }

    "/" -2 [fst; rest] {
        if rest.is_empty() {
            arith(rt, Num::I(1), &[fst], i64::checked_div, |x, y| x / y)
        } else {
            arith(rt, num(rt, fst)?, rest, i64::checked_div, |x, y| x / y)
        }
    }

    "mod" 2 [fst, snd] {
        let (x, y) = (int_arg(rt, fst)?, int_arg(rt, snd)?);
        if y == 0 {
            return Err(YkErr::Signal("division by zero".to_string()));
        }
        make_int(x.checked_rem_euclid(y))
    }

    "=" -2 [; nums] {
        compare(rt, nums, |o| o.is_eq())
    }

    "<" -2 [; nums] {
        compare(rt, nums, |o| o.is_lt())
    }

    ">" -2 [; nums] {
        compare(rt, nums, |o| o.is_gt())
    }

    "<=" -2 [; nums] {
        compare(rt, nums, |o| o.is_le())
    }

    ">=" -2 [; nums] {
        compare(rt, nums, |o| o.is_ge())
    }

    // predicates

    "eq?" 2 [fst, snd] {
        Ok(bool_val(rt, fst == snd))
    }

    "equal?" 2 [fst, snd] {
        Ok(bool_val(rt, rt.equal(fst, snd)))
    }

    "not" 1 [val] {
        Ok(bool_val(rt, val.is_nil()))
    }

    "nil?" 1 [val] {
        Ok(bool_val(rt, val.is_nil()))
    }

    "cons?" 1 [val] {
        Ok(bool_val(rt, val.is_pair()))
    }

    "symbol?" 1 [val] {
        Ok(bool_val(rt, val.is_symbol()))
    }

    "int?" 1 [val] {
        Ok(bool_val(rt, val.tag() == Tag::Int))
    }

    "float?" 1 [val] {
        Ok(bool_val(rt, val.tag() == Tag::Float))
    }

    "number?" 1 [val] {
        Ok(bool_val(rt, matches!(val.tag(), Tag::Int | Tag::Float)))
    }

    "string?" 1 [val] {
        Ok(bool_val(rt, rt.is_string(val)))
    }

    "procedure?" 1 [val] {
        Ok(bool_val(rt, matches!(val.tag(), Tag::Native | Tag::Closure | Tag::Bytecode)))
    }

    "array?" 1 [val] {
        Ok(bool_val(rt, cell_is(rt, val, |c| matches!(c, Cell::Array { .. }))))
    }

    "continuation?" 1 [val] {
        Ok(bool_val(rt, cell_is(rt, val, |c| matches!(c, Cell::Cont(_)))))
    }

    "stream?" 1 [val] {
        Ok(bool_val(rt, rt.is_stream(val)))
    }

    // lists

    "cons" 2 [car, cdr] {
        Ok(rt.cons(car, cdr))
    }

    "car" 1 [list] {
        rt.car(list)
    }

    "cdr" 1 [list] {
        rt.cdr(list)
    }

    "set-car!" 2 [pair, val] {
        rt.set_car(pair, val)?;
        Ok(val)
    }

    "set-cdr!" 2 [pair, val] {
        rt.set_cdr(pair, val)?;
        Ok(val)
    }

    "list" -1 [; items] {
        // each new pair holds the list built so far
        let mut list = Value::NIL;
        for &v in items.iter().rev() {
            list = rt.cons(v, list);
        }
        Ok(list)
    }

    // arrays

    "make-array" -2 [len; fill] {
        let n = index_arg(rt, len)?;
        let fill = fill.first().copied().unwrap_or(Value::NIL);
        let data = rt.alloc_block(n * 8);
        for i in 0..n {
            rt.heap.write_word(data, i, fill.bits());
        }
        Ok(rt.alloc_cell(Cell::Array { data, len: n as u32 }))
    }

    "array-ref" 2 [arr, index] {
        let (data, len) = array_parts(rt, arr)?;
        let i = index_arg(rt, index)?;
        if i >= len {
            return Err(YkErr::Signal(format!("index {} out of bounds for length {}", i, len)));
        }
        Ok(Value::from_bits(rt.heap.read_word(data, i)))
    }

    "array-set!" 3 [arr, index, val] {
        let (data, len) = array_parts(rt, arr)?;
        let i = index_arg(rt, index)?;
        if i >= len {
            return Err(YkErr::Signal(format!("index {} out of bounds for length {}", i, len)));
        }
        rt.heap.write_word(data, i, val.bits());
        Ok(val)
    }

    "array-length" 1 [arr] {
        let (_, len) = array_parts(rt, arr)?;
        Ok(Value::int(len as i64))
    }

    // strings and symbols

    "string-length" 1 [s] {
        let text = rt.string_value(s)?;
        Ok(Value::int(text.chars().count() as i64))
    }

    "string-append" -1 [; parts] {
        let mut text = String::new();
        for &p in parts {
            text.push_str(&rt.string_value(p)?);
        }
        Ok(rt.make_string(&text))
    }

    "symbol-name" 1 [sym] {
        if !sym.is_symbol() {
            return Err(rt.type_err("symbol", sym));
        }
        Ok(rt.symbol(sym).name)
    }

    "intern" 1 [name] {
        let text = rt.string_value(name)?;
        Ok(rt.intern(&text))
    }

    "gensym" 0 [] {
        rt.gensyms += 1;
        let name = format!("g{}", rt.gensyms);
        Ok(rt.make_symbol(&name))
    }

    "string->number" 1 [s] {
        let text = rt.string_value(s)?;
        Ok(parse_number(text.trim()).unwrap_or(Value::NIL))
    }

    "number->string" 1 [n] {
        num(rt, n)?;
        let text = rt.print_string(n);
        Ok(rt.make_string(&text))
    }

    "read-from-string" 1 [s] {
        let text = rt.string_value(s)?;
        rt.read(&text)
    }

    // declarations and procedures

    "declare!" -3 [sym, kind; arity] {
        let kind = match kind {
            k if k == rt.sym.variable => DeclKind::Variable,
            k if k == rt.sym.constant => DeclKind::Constant,
            k if k == rt.sym.function => DeclKind::Function,
            k if k == rt.sym.macro_ => DeclKind::Macro,
            k => return Err(rt.type_err("declaration kind", k)),
        };
        let arity = match arity.first() {
            Some(&a) => Some(i16::try_from(int_arg(rt, a)?).map_err(|_| rt.type_err("arity", a))?),
            None => None,
        };
        rt.declare(sym, kind, arity)?;
        Ok(sym)
    }

    "make-closure" 2 [code, env] {
        if code.tag() != Tag::Bytecode {
            return Err(rt.type_err("bytecode", code));
        }
        array_parts(rt, env)?;
        Ok(rt.alloc_cell(Cell::Closure { code, env }))
    }

    "documentation" 1 [proc] {
        let code = match proc.cell_index().map(|i| rt.heap.get(i)) {
            Some(Cell::Closure { code, .. }) => *code,
            _ if proc.tag() == Tag::Bytecode => proc,
            _ => return Ok(Value::NIL),
        };
        Ok(rt.bytecode(code).doc)
    }

    "disassemble" 1 [proc] {
        let code = match proc.cell_index().map(|i| rt.heap.get(i)) {
            Some(Cell::Closure { code, .. }) => *code,
            _ if proc.tag() == Tag::Bytecode => proc,
            _ => return Err(rt.type_err("compiled procedure", proc)),
        };
        let text = rt.disassemble(code);
        Ok(rt.make_string(&text))
    }

    "error" -2 [msg; irritants] {
        let mut text = rt.display_string(msg);
        for &i in irritants {
            text.push(' ');
            text.push_str(&rt.print_string(i));
        }
        Err(YkErr::Signal(text))
    }

    "gc" 0 [] {
        rt.collect();
        Ok(Value::int(rt.heap.free_cells() as i64))
    }

    // output

    "print" -2 [val; stream] {
        let out = out_stream(rt, stream)?;
        let text = rt.print_string(val);
        rt.stream_write_str(out, &text)?;
        Ok(val)
    }

    "princ" -2 [val; stream] {
        let out = out_stream(rt, stream)?;
        let text = rt.display_string(val);
        rt.stream_write_str(out, &text)?;
        Ok(val)
    }

    "newline" -1 [; stream] {
        let out = out_stream(rt, stream)?;
        rt.stream_write_byte(out, b'\n')?;
        Ok(Value::NIL)
    }

    // streams

    "make-string-stream" -1 [; init] {
        let s = rt.make_string_stream();
        if let Some(&text) = init.first() {
            let text = rt.string_value(text)?;
            rt.protect(s);
            let written = rt.stream_write_str(s, &text);
            rt.unprotect(1);
            written?;
        }
        Ok(s)
    }

    "stream-string" 1 [stream] {
        rt.stream_string(stream)
    }

    "open-file" 2 [path, mode] {
        let path = rt.string_value(path)?;
        let mode = text_arg(rt, mode)?;
        rt.open_file(&path, &mode)
    }

    "close-stream" 1 [stream] {
        rt.close_stream(stream)?;
        Ok(Value::NIL)
    }

    "read-byte" -1 [; stream] {
        let inp = in_stream(rt, stream)?;
        Ok(rt.read_byte(inp)?.map(|b| Value::int(b as i64)).unwrap_or(Value::NIL))
    }

    "write-byte" -2 [byte; stream] {
        let out = out_stream(rt, stream)?;
        let b = u8::try_from(int_arg(rt, byte)?).map_err(|_| rt.type_err("byte", byte))?;
        rt.stream_write_byte(out, b)?;
        Ok(byte)
    }

    "read-char" -1 [; stream] {
        let inp = in_stream(rt, stream)?;
        match rt.read_char(inp)? {
            Some(c) => Ok(rt.make_string(c.encode_utf8(&mut [0; 4]))),
            None => Ok(Value::NIL),
        }
    }

    "write-char" -2 [ch; stream] {
        let out = out_stream(rt, stream)?;
        let text = rt.string_value(ch)?;
        rt.stream_write_str(out, &text)?;
        Ok(ch)
    }
}

#[cfg(test)]
mod tests {
    use crate::yuki::{Config, Runtime, YkErr};

    fn eval(rt: &mut Runtime, code: &str) -> String {
        let v = rt.eval_str(code).unwrap();
        rt.print_string(v)
    }

    fn fails(rt: &mut Runtime, code: &str) -> YkErr {
        match rt.eval_str(code) {
            Err(YkErr::Aborted(cause)) => *cause,
            other => panic!("{} did not fail: {:?}", code, other.map(|v| rt.print_string(v))),
        }
    }

    #[test]
    fn arithmetic() {
        let mut rt = Runtime::bare(Config::default());
        let cases = [
            ("(- 10 4 1)", "5"),
            ("(- 3)", "-3"),
            ("(* 2 3 4)", "24"),
            ("(/ 7 2)", "3"),
            ("(/ 7.0 2)", "3.5"),
            ("(mod -7 3)", "2"),
            ("(+ 1 0.5)", "1.5"),
            ("(< 1 2 3)", "t"),
            ("(< 1 3 2)", "()"),
            ("(= 2 2.0)", "t"),
            ("(>= 3 3)", "t"),
        ];
        for (code, expect) in cases {
            assert_eq!(eval(&mut rt, code), expect, "evaluating {}", code);
        }
        assert!(matches!(fails(&mut rt, "(/ 1 0)"), YkErr::Signal(_)));
        assert!(matches!(fails(&mut rt, "(+ 1 'a)"), YkErr::Type { .. }));
        assert!(matches!(fails(&mut rt, "(* 576460752303423487 2)"), YkErr::Signal(_)));
    }

    #[test]
    fn large_integer_comparison() {
        let mut rt = Runtime::bare(Config::default());
        let cases = [
            ("(= 576460752303423487 576460752303423486)", "()"),
            ("(< 576460752303423486 576460752303423487)", "t"),
            ("(> 576460752303423487 576460752303423486)", "t"),
            ("(<= 576460752303423487 576460752303423486)", "()"),
            ("(>= -576460752303423488 -576460752303423487)", "()"),
            ("(= 9007199254740993 9007199254740992)", "()"),
            ("(= 9007199254740993 9007199254740993)", "t"),
        ];
        for (code, expect) in cases {
            assert_eq!(eval(&mut rt, code), expect, "evaluating {}", code);
        }
    }

    #[test]
    fn predicates() {
        let mut rt = Runtime::bare(Config::default());
        let cases = [
            ("(eq? 'a 'a)", "t"),
            ("(eq? \"a\" \"a\")", "()"),
            ("(equal? '(1 \"a\") '(1 \"a\"))", "t"),
            ("(not ())", "t"),
            ("(cons? '(1))", "t"),
            ("(cons? ())", "()"),
            ("(symbol? 'x)", "t"),
            ("(number? 1.5)", "t"),
            ("(string? \"s\")", "t"),
            ("(procedure? car)", "t"),
            ("(array? (make-array 2))", "t"),
        ];
        for (code, expect) in cases {
            assert_eq!(eval(&mut rt, code), expect, "evaluating {}", code);
        }
    }

    #[test]
    fn lists_and_arrays() {
        let mut rt = Runtime::bare(Config::default());
        assert_eq!(eval(&mut rt, "(list 1 2 3)"), "(1 2 3)");
        assert_eq!(eval(&mut rt, "(list)"), "()");
        assert_eq!(eval(&mut rt, "(let ((p (cons 1 2))) (set-cdr! p 3) p)"), "(1 . 3)");
        assert_eq!(eval(&mut rt, "(make-array 3 0)"), "[0 0 0]");
        assert_eq!(
            eval(&mut rt, "(let ((a (make-array 2))) (array-set! a 1 'x) (array-ref a 1))"),
            "x"
        );
        assert_eq!(eval(&mut rt, "(array-length (make-array 4))"), "4");
        assert!(matches!(fails(&mut rt, "(array-ref (make-array 1) 5)"), YkErr::Signal(_)));
    }

    #[test]
    fn strings_and_symbols() {
        let mut rt = Runtime::bare(Config::default());
        assert_eq!(eval(&mut rt, "(string-append \"ab\" \"cd\")"), "\"abcd\"");
        assert_eq!(eval(&mut rt, "(string-length \"héllo\")"), "5");
        assert_eq!(eval(&mut rt, "(symbol-name 'abc)"), "\"abc\"");
        assert_eq!(eval(&mut rt, "(eq? (intern \"abc\") 'abc)"), "t");
        assert_eq!(eval(&mut rt, "(eq? (gensym) (gensym))"), "()");
        assert_eq!(eval(&mut rt, "(string->number \"42\")"), "42");
        assert_eq!(eval(&mut rt, "(string->number \"x\")"), "()");
        assert_eq!(eval(&mut rt, "(number->string 2.5)"), "\"2.5\"");
        assert_eq!(eval(&mut rt, "(read-from-string \"(a . b)\")"), "(a . b)");
    }

    #[test]
    fn declarations() {
        let mut rt = Runtime::bare(Config::default());
        rt.eval_str("(declare! 'f 'function 2)").unwrap();
        let f = rt.find_symbol("f").unwrap();
        assert_eq!(rt.symbol(f).arity, Some(2));
        assert!(matches!(fails(&mut rt, "(declare! 'f 'sideways)"), YkErr::Type { .. }));
    }

    #[test]
    fn documentation_strings() {
        let mut rt = Runtime::bare(Config::default());
        rt.eval_str("(set! f (named-lambda f (x) \"Returns x.\" x))").unwrap();
        assert_eq!(eval(&mut rt, "(documentation f)"), "\"Returns x.\"");
        assert_eq!(eval(&mut rt, "(f 3)"), "3");
        assert_eq!(eval(&mut rt, "(documentation car)"), "()");
    }

    #[test]
    fn stream_procedures() {
        let mut rt = Runtime::bare(Config::default());
        let out = eval(
            &mut rt,
            "(let ((s (make-string-stream)))
               (write-char \"x\" s)
               (write-byte 65 s)
               (print 'y s)
               (newline s)
               (stream-string s))",
        );
        assert_eq!(out, "\"xAy\n\"");
        assert_eq!(
            eval(&mut rt, "(let ((s (make-string-stream \"hé\"))) (list (read-char s) (read-char s) (read-char s)))"),
            "(\"h\" \"é\" ())"
        );
        assert!(matches!(
            fails(&mut rt, "(let ((s (make-string-stream))) (close-stream s) (princ 1 s))"),
            YkErr::ClosedStream
        ));
    }

    #[test]
    fn gc_procedure() {
        let mut rt = Runtime::bare(Config::default());
        let before = rt.heap.free_cells();
        rt.eval_str("(list 1 2 3 4 5 6)").unwrap();
        assert_eq!(eval(&mut rt, "(int? (gc))"), "t");
        assert!(rt.heap.free_cells() + 16 >= before);
    }
}
