// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/stream.rs

// Byte streams. String streams accumulate output in a payload block
// and can be read back; file streams wrap the console or an open file.

// <>

use std::fs::OpenOptions;
use std::io::{self, Read, Write};

use super::types::{Cell, Port, StrStream, Tag, Value};
use super::{Runtime, YkErr};

const STREAM_START: usize = 32;

impl Runtime {
    /// Creates an empty string stream, open for reading and writing
    pub fn make_string_stream(&mut self) -> Value {
        let data = self.alloc_block(STREAM_START);
        self.alloc_cell(Cell::StrStream(StrStream {
            data,
            len: 0,
            pos: 0,
            open: true,
        }))
    }

    pub fn make_file_stream(&mut self, port: Port) -> Value {
        self.alloc_cell(Cell::FileStream(port))
    }

    /// Opens `path` in mode "read", "write" or "append"
    pub fn open_file(&mut self, path: &str, mode: &str) -> Result<Value, YkErr> {
        let mut opts = OpenOptions::new();
        match mode {
            "read" => opts.read(true),
            "write" => opts.write(true).create(true).truncate(true),
            "append" => opts.append(true).create(true),
            _ => return Err(YkErr::Io(format!("unknown file mode {}", mode))),
        };
        let file = opts
            .open(path)
            .map_err(|e| YkErr::Io(format!("{}: {}", path, e)))?;
        log::debug!("opened {} for {}", path, mode);
        Ok(self.make_file_stream(Port::File(file)))
    }

    fn stream_cell(&self, stream: Value) -> Result<usize, YkErr> {
        match stream.cell_index().filter(|_| stream.tag() == Tag::Object) {
            Some(i) if matches!(self.heap.get(i), Cell::StrStream(_) | Cell::FileStream(_)) => Ok(i),
            _ => Err(self.type_err("stream", stream)),
        }
    }

    pub fn is_stream(&self, v: Value) -> bool {
        self.stream_cell(v).is_ok()
    }

    /// Appends bytes to a stream
    ///
    /// `stream` must be reachable from a root, since a string stream
    /// may need a larger block.
    pub fn stream_write(&mut self, stream: Value, bytes: &[u8]) -> Result<(), YkErr> {
        let index = self.stream_cell(stream)?;

        let s = match self.heap.get_mut(index) {
            Cell::StrStream(s) => *s,
            Cell::FileStream(port) => {
                return match port {
                    Port::Stdout => io::stdout().write_all(bytes).map_err(YkErr::from),
                    Port::Stderr => io::stderr().write_all(bytes).map_err(YkErr::from),
                    Port::File(f) => f.write_all(bytes).map_err(YkErr::from),
                    Port::Stdin => Err(YkErr::Io("standard input is not writable".to_string())),
                    Port::Closed => Err(YkErr::ClosedStream),
                }
            }
            _ => unreachable!(),
        };

        if !s.open {
            return Err(YkErr::ClosedStream);
        }
        let len = s.len as usize;
        let mut data = s.data;
        if len + bytes.len() > self.heap.capacity(data) {
            let size = (self.heap.capacity(data) * 2).max(len + bytes.len());
            let grown = self.alloc_block(size);
            self.heap.copy_block(data, grown, len);
            data = grown;
        }
        self.heap.bytes_mut(data)[len..len + bytes.len()].copy_from_slice(bytes);

        if let Cell::StrStream(s) = self.heap.get_mut(index) {
            s.data = data;
            s.len = (len + bytes.len()) as u32;
        }
        Ok(())
    }

    pub fn stream_write_str(&mut self, stream: Value, text: &str) -> Result<(), YkErr> {
        self.stream_write(stream, text.as_bytes())
    }

    pub fn stream_write_byte(&mut self, stream: Value, b: u8) -> Result<(), YkErr> {
        self.stream_write(stream, &[b])
    }

    /// Reads one byte, or `None` at the end of the stream
    pub fn read_byte(&mut self, stream: Value) -> Result<Option<u8>, YkErr> {
        let index = self.stream_cell(stream)?;
        let data = match self.heap.get_mut(index) {
            Cell::StrStream(s) => {
                if !s.open {
                    return Err(YkErr::ClosedStream);
                }
                if s.pos >= s.len {
                    return Ok(None);
                }
                s.pos += 1;
                (s.data, s.pos as usize - 1)
            }
            Cell::FileStream(port) => {
                let mut buf = [0u8; 1];
                let n = match port {
                    Port::Stdin => io::stdin().read(&mut buf)?,
                    Port::File(f) => f.read(&mut buf)?,
                    Port::Closed => return Err(YkErr::ClosedStream),
                    _ => return Err(YkErr::Io("stream is not readable".to_string())),
                };
                return Ok((n == 1).then(|| buf[0]));
            }
            _ => unreachable!(),
        };
        Ok(Some(self.heap.bytes(data.0)[data.1]))
    }

    /// Reads one UTF-8 encoded character
    pub fn read_char(&mut self, stream: Value) -> Result<Option<char>, YkErr> {
        let first = match self.read_byte(stream)? {
            Some(b) => b,
            None => return Ok(None),
        };
        let width = match first.leading_ones() {
            0 => 1,
            n @ 2..=4 => n as usize,
            _ => return Err(YkErr::Io("invalid UTF-8 in stream".to_string())),
        };

        let mut buf = [first, 0, 0, 0];
        for slot in buf.iter_mut().take(width).skip(1) {
            *slot = self
                .read_byte(stream)?
                .ok_or_else(|| YkErr::Io("truncated UTF-8 in stream".to_string()))?;
        }
        std::str::from_utf8(&buf[..width])
            .ok()
            .and_then(|s| s.chars().next())
            .map(Some)
            .ok_or_else(|| YkErr::Io("invalid UTF-8 in stream".to_string()))
    }

    pub fn close_stream(&mut self, stream: Value) -> Result<(), YkErr> {
        let index = self.stream_cell(stream)?;
        match self.heap.get_mut(index) {
            Cell::StrStream(s) => s.open = false,
            // dropping the port closes the file
            Cell::FileStream(port) => *port = Port::Closed,
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Everything written to a string stream so far, as a new string
    pub fn stream_string(&mut self, stream: Value) -> Result<Value, YkErr> {
        let index = self.stream_cell(stream)?;
        let text = match self.heap.get(index) {
            Cell::StrStream(s) => {
                String::from_utf8_lossy(&self.heap.bytes(s.data)[..s.len as usize]).into_owned()
            }
            _ => return Err(self.type_err("string stream", stream)),
        };
        Ok(self.make_string(&text))
    }

    /// Current value of `*standard-output*`
    pub(crate) fn standard_output(&self) -> Result<Value, YkErr> {
        let sym = self.sym.standard_output;
        self.global(sym)
            .ok_or_else(|| YkErr::Unbound(self.symbol_name(sym).to_string()))
    }

    pub(crate) fn standard_input(&self) -> Result<Value, YkErr> {
        let sym = self.sym.standard_input;
        self.global(sym)
            .ok_or_else(|| YkErr::Unbound(self.symbol_name(sym).to_string()))
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
    fn string_stream_grows() {
        let mut rt = rt();
        let s = rt.make_string_stream();
        rt.protect(s);
        let mut expect = String::new();
        for i in 0..200 {
            let piece = format!("{} ", i);
            rt.stream_write_str(s, &piece).unwrap();
            expect.push_str(&piece);
        }
        let text = rt.stream_string(s).unwrap();
        assert_eq!(rt.string_value(text).unwrap(), expect);
    }

    #[test]
    fn read_back() {
        let mut rt = rt();
        let s = rt.make_string_stream();
        rt.protect(s);
        rt.stream_write_str(s, "aé").unwrap();
        rt.stream_write_byte(s, b'!').unwrap();

        assert_eq!(rt.read_char(s).unwrap(), Some('a'));
        assert_eq!(rt.read_char(s).unwrap(), Some('é'));
        assert_eq!(rt.read_byte(s).unwrap(), Some(b'!'));
        assert_eq!(rt.read_byte(s).unwrap(), None);
    }

    #[test]
    fn closed_streams() {
        let mut rt = rt();
        let s = rt.make_string_stream();
        rt.protect(s);
        rt.close_stream(s).unwrap();
        assert!(matches!(rt.stream_write_str(s, "x"), Err(YkErr::ClosedStream)));

        let f = rt.make_file_stream(Port::Stdout);
        rt.protect(f);
        rt.close_stream(f).unwrap();
        assert!(matches!(rt.stream_write_str(f, "x"), Err(YkErr::ClosedStream)));
    }

    #[test]
    fn not_a_stream() {
        let mut rt = rt();
        assert!(matches!(
            rt.stream_write_str(Value::int(3), "x"),
            Err(YkErr::Type { .. })
        ));
        assert!(!rt.is_stream(Value::NIL));
    }

    #[test]
    fn files() {
        let mut rt = rt();
        let path = std::env::temp_dir().join(format!("yuki-stream-{}.txt", std::process::id()));
        let path = path.to_string_lossy().into_owned();

        let out = rt.open_file(&path, "write").unwrap();
        rt.protect(out);
        rt.stream_write_str(out, "hi").unwrap();
        rt.close_stream(out).unwrap();

        let inp = rt.open_file(&path, "read").unwrap();
        rt.protect(inp);
        assert_eq!(rt.read_char(inp).unwrap(), Some('h'));
        assert_eq!(rt.read_char(inp).unwrap(), Some('i'));
        assert_eq!(rt.read_char(inp).unwrap(), None);

        assert!(matches!(rt.open_file(&path, "sideways"), Err(YkErr::Io(_))));
        let _ = std::fs::remove_file(&path);
    }
}
