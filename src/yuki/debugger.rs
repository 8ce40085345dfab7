// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/debugger.rs

// Violation handling. Every violation that escapes the machine is
// recorded with a backtrace; in interactive mode the user may inspect
// the stopped machine before it unwinds to the top level.

// <>

use std::io::{self, BufRead, Write};

use super::{Runtime, YkErr};

/// What happens when a violation reaches the top level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// Ask on the console whether to inspect before unwinding
    Interactive,
    /// Log the violation and unwind at once
    Abort,
}

/// Record of a violation
#[derive(Debug, Clone)]
pub struct Failure {
    pub error: String,
    /// Active procedures, innermost first
    pub frames: Vec<String>,
    /// Operand stack depth when the violation occurred
    pub depth: usize,
}

/// Values listed by the stack command
const STACK_SHOWN: usize = 16;

impl Runtime {
    pub(crate) fn handle_violation(&mut self, err: &YkErr) {
        let failure = Failure {
            error: err.to_string(),
            frames: self.backtrace(),
            depth: self.vm.depth(),
        };

        match self.config.debugger {
            DebugMode::Abort => {
                log::error!("{}", failure.error);
                if !failure.frames.is_empty() {
                    log::error!("in {}", failure.frames.join(" <- "));
                }
            }
            DebugMode::Interactive => {
                let stdin = io::stdin();
                let stdout = io::stdout();
                let session = self.debug_session(&failure, &mut stdin.lock(), &mut stdout.lock());
                if let Err(e) = session {
                    log::error!("debugger console failed: {}", e);
                }
            }
        }

        self.last_failure = Some(failure);
    }

    /// Offers inspection of the stopped machine until the user aborts
    pub(crate) fn debug_session(
        &self,
        failure: &Failure,
        input: &mut impl BufRead,
        output: &mut impl Write,
    ) -> io::Result<()> {
        writeln!(output, "error: {}", failure.error)?;
        write_frames(output, &failure.frames)?;
        write!(output, "[a]bort or [b]reak? ")?;
        output.flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 || !line.trim().starts_with('b') {
            return Ok(());
        }

        loop {
            write!(output, "debug> ")?;
            output.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                return Ok(());
            }

            match line.trim() {
                "frames" | "f" => write_frames(output, &failure.frames)?,
                "stack" | "s" => {
                    for (i, v) in self.vm.stack.iter().rev().take(STACK_SHOWN).enumerate() {
                        writeln!(output, "{:3}  {}", i, self.print_string(*v))?;
                    }
                    if self.vm.stack.len() > STACK_SHOWN {
                        writeln!(output, "     ... {} more", self.vm.stack.len() - STACK_SHOWN)?;
                    }
                }
                "regs" | "r" => {
                    writeln!(
                        output,
                        "pc {}  fp {}  depth {}  dynamic {}  continuations {}",
                        self.vm.pc,
                        self.vm.fp,
                        self.vm.depth(),
                        self.vm.dyns.len(),
                        self.vm.conts.len()
                    )?;
                    writeln!(output, "val {}", self.print_string(self.vm.val))?;
                }
                "code" | "c" => {
                    if self.vm.code.tag() == super::Tag::Bytecode {
                        write!(output, "{}", self.disassemble(self.vm.code))?;
                    }
                }
                "abort" | "a" | "quit" | "q" => return Ok(()),
                "" => {}
                other => writeln!(
                    output,
                    "unknown command {}; try frames, stack, regs, code or abort",
                    other
                )?,
            }
        }
    }
}

/// Lists pending procedures, innermost first
fn write_frames(output: &mut impl Write, frames: &[String]) -> io::Result<()> {
    for (i, name) in frames.iter().enumerate() {
        writeln!(output, "{:3}  {}", i, name)?;
    }
    Ok(())
}
