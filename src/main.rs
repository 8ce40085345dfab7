// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/main.rs

// Command line entry point.

// <>

use yuki::yuki as yk;

use std::env;
use std::io;
use std::process;

const USAGE: &str = "usage: yuki [-v] [repl | file <filename>]";

fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let verbose = args.iter().any(|a| a == "-v");
    args.retain(|a| a != "-v");

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    if let Err(e) = simple_logger::SimpleLogger::new().with_level(level).init() {
        eprintln!("logger setup failed: {}", e);
    }

    // yuki file <filename> runs a file; yuki or yuki repl starts the REPL
    match args.as_slice() {
        [] => yk::repl(io::stdin()),
        [cmd] if cmd == "repl" => yk::repl(io::stdin()),
        [cmd, filename] if cmd == "file" => match yk::run_file(filename) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                log::error!("{}: {}", filename, e);
                process::exit(1);
            }
        },
        _ => {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    }
}
