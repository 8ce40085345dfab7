// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/lib.rs

// Crate root.

// <>

pub mod yuki;

pub use yuki::{Config, Runtime, YkErr};
