// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/printer.rs

// Conversion of values to text.

// <>

use super::types::{Cell, Tag, Value};
use super::{Runtime, YkErr};

impl Runtime {
    /// Text of a value that reads back as an equal value where possible
    pub fn print_string(&self, v: Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, v, true);
        out
    }

    /// Text of a value with strings shown bare
    pub fn display_string(&self, v: Value) -> String {
        let mut out = String::new();
        self.write_value(&mut out, v, false);
        out
    }

    /// Prints a value readably on the current standard output stream
    pub fn print(&mut self, v: Value) -> Result<(), YkErr> {
        let text = self.print_string(v);
        let out = self.standard_output()?;
        self.stream_write_str(out, &text)
    }

    fn write_value(&self, out: &mut String, v: Value, readably: bool) {
        match v.tag() {
            Tag::Int => out.push_str(&v.as_int().unwrap_or(0).to_string()),
            Tag::Float => out.push_str(&format!("{:?}", v.as_float().unwrap_or(0.0))),
            Tag::Symbol => out.push_str(self.symbol_name(v)),
            Tag::List => self.write_list(out, v, readably),
            Tag::Native => out.push_str(&format!("#<native {}>", self.proc_name(v))),
            Tag::Closure => out.push_str(&format!("#<closure {}>", self.proc_name(v))),
            Tag::Bytecode => out.push_str(&format!("#<bytecode {}>", self.proc_name(v))),
            Tag::Object => self.write_object(out, v, readably),
        }
    }

    fn write_list(&self, out: &mut String, v: Value, readably: bool) {
        out.push('(');
        let mut cur = v;
        let mut first = true;
        while let Some((car, cdr)) = self.pair(cur) {
            if !first {
                out.push(' ');
            }
            first = false;
            self.write_value(out, car, readably);
            cur = cdr;
        }
        if !cur.is_nil() {
            out.push_str(" . ");
            self.write_value(out, cur, readably);
        }
        out.push(')');
    }

    fn write_object(&self, out: &mut String, v: Value, readably: bool) {
        let index = match v.cell_index() {
            Some(i) => i,
            None => {
                out.push_str("#<invalid>");
                return;
            }
        };

        match self.heap.get(index) {
            Cell::Str { .. } => {
                let text = String::from_utf8_lossy(self.string_bytes(v));
                if readably {
                    out.push('"');
                    out.push_str(&text);
                    out.push('"');
                } else {
                    out.push_str(&text);
                }
            }
            Cell::Array { data, len } => {
                out.push('[');
                for i in 0..*len as usize {
                    if i > 0 {
                        out.push(' ');
                    }
                    let elt = Value::from_bits(self.heap.read_word(*data, i));
                    self.write_value(out, elt, readably);
                }
                out.push(']');
            }
            cell => out.push_str(&format!("#<{} {}>", cell.kind_name(), index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuki::Config;

    #[test]
    fn immediates() {
        let mut rt = Runtime::bare(Config::default());
        assert_eq!(rt.print_string(Value::int(-12)), "-12");
        assert_eq!(rt.print_string(Value::float(0.5)), "0.5");
        assert_eq!(rt.print_string(Value::float(3.0)), "3.0");
        assert_eq!(rt.print_string(Value::NIL), "()");
        let s = rt.intern("hello");
        assert_eq!(rt.print_string(s), "hello");
    }

    #[test]
    fn strings() {
        let mut rt = Runtime::bare(Config::default());
        let s = rt.make_string("two words");
        assert_eq!(rt.print_string(s), "\"two words\"");
        assert_eq!(rt.display_string(s), "two words");
    }

    #[test]
    fn nested_lists() {
        let mut rt = Runtime::bare(Config::default());
        let v = rt.read("(1 (2 . 3) \"s\" . end)").unwrap();
        assert_eq!(rt.print_string(v), "(1 (2 . 3) \"s\" . end)");
        assert_eq!(rt.display_string(v), "(1 (2 . 3) s . end)");
    }

    #[test]
    fn procedures() {
        let rt = Runtime::bare(Config::default());
        let car = rt.find_symbol("car").and_then(|s| rt.global(s)).unwrap();
        assert_eq!(rt.print_string(car), "#<native car>");
    }

    #[test]
    fn print_to_stream() {
        let mut rt = Runtime::bare(Config::default());
        let stream = rt.make_string_stream();
        rt.protect(stream);
        let out = rt.sym.standard_output;
        rt.set_global(out, stream);

        let v = rt.read("(a \"b\")").unwrap();
        rt.print(v).unwrap();
        let text = rt.stream_string(stream).unwrap();
        assert_eq!(rt.string_value(text).unwrap(), "(a \"b\")");
    }
}
