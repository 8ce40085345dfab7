// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/parser.rs

// Reader turning source text into value trees.

// <>

use super::types::{Value, INT_MAX, INT_MIN};
use super::{Runtime, YkErr};

use std::iter;
use std::str;

struct Reader<'a> {
    chars: iter::Peekable<str::Bytes<'a>>,
    acc: Vec<u8>,
}

enum Token {
    Open,
    Close,
    Dot,
    Quote,
    Str(String),
    Atom(String),
    End,
}

fn delimiter(c: u8) -> bool {
    c.is_ascii_whitespace() || matches!(c, b'(' | b')' | b'"' | b'\'' | b';' | 0)
}

impl<'a> Reader<'a> {
    fn new(code: &'a str) -> Self {
        Reader {
            chars: code.bytes().peekable(),
            acc: Vec::new(),
        }
    }

    /// Skips whitespace and line comments
    fn skip_blank(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_whitespace() {
                self.chars.next();
            } else if c == b';' {
                while let Some(c) = self.chars.next() {
                    if c == b'\n' {
                        break;
                    }
                }
            } else {
                return;
            }
        }
    }

    fn take_acc(&mut self) -> Result<String, YkErr> {
        String::from_utf8(std::mem::take(&mut self.acc))
            .map_err(|_| YkErr::Read("invalid UTF-8 in source".to_string()))
    }

    fn token(&mut self) -> Result<Token, YkErr> {
        self.skip_blank();

        // a NUL byte ends the input just like the end of the text
        let c = match self.chars.peek() {
            None | Some(0) => return Ok(Token::End),
            Some(&c) => c,
        };

        match c {
            b'(' | b')' | b'\'' => {
                self.chars.next();
                Ok(match c {
                    b'(' => Token::Open,
                    b')' => Token::Close,
                    _ => Token::Quote,
                })
            }
            b'"' => {
                self.chars.next();
                loop {
                    match self.chars.next() {
                        None | Some(0) => {
                            return Err(YkErr::Read("unterminated string".to_string()))
                        }
                        Some(b'"') => break,
                        Some(c) => self.acc.push(c),
                    }
                }
                Ok(Token::Str(self.take_acc()?))
            }
            _ => {
                while let Some(&c) = self.chars.peek() {
                    if delimiter(c) {
                        break;
                    }
                    self.acc.push(c);
                    self.chars.next();
                }
                let text = self.take_acc()?;
                Ok(if text == "." {
                    Token::Dot
                } else {
                    Token::Atom(text)
                })
            }
        }
    }
}

/// Decides whether a token is numeric and converts it
///
/// Tokens must start with a digit, optionally after a sign or a
/// decimal point, so names like `inf` or `-` stay symbols.
pub fn parse_number(tok: &str) -> Option<Value> {
    let b = tok.as_bytes();
    let unsigned = match b {
        [b'+' | b'-', rest @ ..] => rest,
        _ => b,
    };
    let lead = match unsigned {
        [b'.', d, ..] => *d,
        [d, ..] => *d,
        [] => return None,
    };
    if !lead.is_ascii_digit() {
        return None;
    }

    if let Ok(i) = tok.parse::<i64>() {
        if (INT_MIN..=INT_MAX).contains(&i) {
            return Some(Value::int(i));
        }
    }
    // an overflowing literal stays a symbol, since inf would not read back
    tok.parse::<f32>().ok().filter(|f| f.is_finite()).map(Value::float)
}

impl Runtime {
    /// Parses the first form of `code`
    pub fn read(&mut self, code: &str) -> Result<Value, YkErr> {
        let mut rd = Reader::new(code);
        match self.read_form(&mut rd)? {
            Some(v) => Ok(v),
            None => Err(YkErr::Read("no form in input".to_string())),
        }
    }

    /// Parses every form of `code` into a list
    pub fn read_all(&mut self, code: &str) -> Result<Value, YkErr> {
        self.with_roots(|rt| {
            let mut rd = Reader::new(code);
            let base = rt.roots.len();
            while let Some(v) = rt.read_form(&mut rd)? {
                rt.protect(v);
            }
            Ok(rt.list_from_roots(base, Value::NIL))
        })
    }

    fn read_form(&mut self, rd: &mut Reader) -> Result<Option<Value>, YkErr> {
        let tok = rd.token()?;
        self.read_token(rd, tok)
    }

    /// Returns a value starting with `tok`, or `None` at the end
    fn read_token(&mut self, rd: &mut Reader, tok: Token) -> Result<Option<Value>, YkErr> {
        match tok {
            Token::End => Ok(None),
            Token::Open => self.read_list(rd).map(Some),
            Token::Close => Err(YkErr::Read("unmatched )".to_string())),
            Token::Dot => Err(YkErr::Read("dot outside of a list".to_string())),
            Token::Quote => {
                let quoted = self
                    .read_form(rd)?
                    .ok_or_else(|| YkErr::Read("nothing follows quote".to_string()))?;
                let body = self.cons(quoted, Value::NIL);
                let quote = self.sym.quote;
                Ok(Some(self.cons(quote, body)))
            }
            Token::Str(s) => Ok(Some(self.make_string(&s))),
            Token::Atom(s) => Ok(Some(match parse_number(&s) {
                Some(n) => n,
                None => self.intern(&s),
            })),
        }
    }

    /// Reads list elements after an opening parenthesis
    fn read_list(&mut self, rd: &mut Reader) -> Result<Value, YkErr> {
        self.with_roots(|rt| {
            let base = rt.roots.len();
            let mut tail = Value::NIL;

            loop {
                match rd.token()? {
                    Token::Close => break,
                    Token::End => return Err(YkErr::Read("unmatched (".to_string())),
                    Token::Dot => {
                        if rt.roots.len() == base {
                            return Err(YkErr::Read("dot before first list element".to_string()));
                        }
                        tail = rt
                            .read_form(rd)?
                            .ok_or_else(|| YkErr::Read("unmatched (".to_string()))?;
                        match rd.token()? {
                            Token::Close => break,
                            _ => {
                                return Err(YkErr::Read(
                                    "more than one element after dot".to_string(),
                                ))
                            }
                        }
                    }
                    tok => {
                        if let Some(v) = rt.read_token(rd, tok)? {
                            rt.protect(v);
                        }
                    }
                }
            }

            Ok(rt.list_from_roots(base, tail))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuki::Config;

    fn rt() -> Runtime {
        Runtime::bare(Config::default())
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_number("42"), Some(Value::int(42)));
        assert_eq!(parse_number("-7"), Some(Value::int(-7)));
        assert_eq!(parse_number("+3"), Some(Value::int(3)));
        assert_eq!(parse_number("2.5"), Some(Value::float(2.5)));
        assert_eq!(parse_number("-.5"), Some(Value::float(-0.5)));
        assert_eq!(parse_number("1e3"), Some(Value::float(1000.0)));
        assert_eq!(parse_number("+"), None);
        assert_eq!(parse_number("1+"), None);
        assert_eq!(parse_number("inf"), None);
        assert_eq!(parse_number("1e39"), None);
        assert_eq!(parse_number("-1e39"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn parses() {
        let mut rt = rt();
        let cases = [
            ("(1 2 3)", "(1 2 3)"),
            ("(1 . 2)", "(1 . 2)"),
            ("(1 2 . 3)", "(1 2 . 3)"),
            ("(a (b c) () d)", "(a (b c) () d)"),
            ("(a ; comment here\n b)", "(a b)"),
            ("'x", "(quote x)"),
            ("('a . 'b)", "((quote a) quote b)"),
            ("\"hi there\"", "\"hi there\""),
            ("  sym-bol! ", "sym-bol!"),
            ("(2.5 -1)", "(2.5 -1)"),
        ];
        for (code, printed) in cases {
            let v = rt.read(code).unwrap();
            assert_eq!(rt.print_string(v), printed, "reading {}", code);
        }
    }

    #[test]
    fn read_sequence() {
        let mut rt = rt();
        let forms = rt.read_all("1 2 ; trailing\n (3)").unwrap();
        assert_eq!(rt.print_string(forms), "(1 2 (3))");

        let cut = rt.read_all("1\0 2").unwrap();
        assert_eq!(rt.print_string(cut), "(1)");

        let none = rt.read_all("  ; nothing\n").unwrap();
        assert!(none.is_nil());
    }

    #[test]
    fn malformed() {
        let mut rt = rt();
        for code in ["(1 2", ")", "\"abc", "( . 1)", "(1 . 2 3)", "'", "."] {
            assert!(
                matches!(rt.read(code), Err(YkErr::Read(_))),
                "accepted {:?}",
                code
            );
        }
        assert!(rt.read("").is_err());
    }

    #[test]
    fn round_trip() {
        let mut rt = rt();
        for code in [
            "12",
            "-40",
            "3.0",
            "0.125",
            "foo",
            "\"a string\"",
            "(1 (2.5 \"x\") . tail)",
            "((a . b) (c . d))",
            "(() ())",
            "1e39",
            "(1e39 -1e39 1e30)",
        ] {
            let v = rt.read(code).unwrap();
            rt.protect(v);
            let text = rt.print_string(v);
            let again = rt.read(&text).unwrap();
            assert!(rt.equal(v, again), "{} printed as {}", code, text);
        }
    }
}
