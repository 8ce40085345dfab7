// Yuki, a self-hosted Lisp runtime.
// Copyright (C) 2024 Matthew Rothlisberger

// Yuki is licensed under the terms of the GNU Affero General Public
// License, version 3. See the top level LICENSE file for the license
// text.

// Find full copyright information in the top level COPYRIGHT file.

// <>

// src/yuki/memmgt.rs

// Memory management for Yuki. Owns the fixed pool of uniform cells and
// the payload arena holding variable-length buffers, and implements the
// precise mark and sweep collector over both of them.

// <>

use super::types::{Block, Cell, Trace, Value};
use super::Runtime;

/// Bytes in a payload block header: size, then flags
const HEAD: usize = 8;
/// Smallest remainder worth splitting off as a separate free block
const MIN_SPLIT: usize = 16;

const USED: u32 = 0b01;
const MARKED: u32 = 0b10;

struct Slot {
    marked: bool,
    cell: Cell,
}

/// Both heaps of a runtime
pub struct Heap {
    cells: Vec<Slot>,
    /// Head of the free list; zero when empty
    free: u32,
    free_count: usize,
    low_water: usize,

    arena: Vec<u8>,
    /// Arena high-water mark
    top: usize,

    pub(crate) collections: usize,
}

impl Heap {
    /// Creates a pool of `cells` cells and a payload arena of `bytes`
    /// bytes. Cell zero is reserved and never handed out.
    pub fn new(cells: usize, bytes: usize, low_water: usize) -> Self {
        let cells = cells.max(2);
        let pool = (0..cells)
            .map(|i| Slot {
                marked: false,
                cell: Cell::Free(if i == 0 || i + 1 == cells {
                    0
                } else {
                    i as u32 + 1
                }),
            })
            .collect();

        if cfg!(feature = "memdbg") {
            log::debug!("creating heap: {} cells, {} payload bytes", cells, bytes);
        }

        Heap {
            cells: pool,
            free: 1,
            free_count: cells - 1,
            low_water,
            arena: vec![0; bytes],
            top: 0,
            collections: 0,
        }
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> &Cell {
        &self.cells[index].cell
    }

    #[inline(always)]
    pub fn get_mut(&mut self, index: usize) -> &mut Cell {
        &mut self.cells[index].cell
    }

    pub fn free_cells(&self) -> usize {
        self.free_count
    }

    pub fn live_cells(&self) -> usize {
        self.cells.len() - 1 - self.free_count
    }

    pub(crate) fn needs_collect(&self) -> bool {
        self.free_count <= self.low_water
    }

    /// Moves `cell` into a free slot, returning its index
    fn take_free(&mut self, cell: Cell) -> Option<usize> {
        let index = self.free as usize;
        if index == 0 {
            return None;
        }

        self.free = match self.cells[index].cell {
            Cell::Free(next) => next,
            _ => unreachable!("free list runs through a live cell"),
        };
        self.free_count -= 1;
        self.cells[index].cell = cell;

        if cfg!(feature = "memdbg") {
            log::debug!("cell {} allocated, {} free", index, self.free_count);
        }

        Some(index)
    }

    // payload blocks

    fn header(&self, at: usize) -> (usize, u32) {
        let word = |o: usize| {
            u32::from_le_bytes([
                self.arena[o],
                self.arena[o + 1],
                self.arena[o + 2],
                self.arena[o + 3],
            ])
        };
        (word(at) as usize, word(at + 4))
    }

    fn set_header(&mut self, at: usize, size: usize, flags: u32) {
        self.arena[at..at + 4].copy_from_slice(&(size as u32).to_le_bytes());
        self.arena[at + 4..at + 8].copy_from_slice(&flags.to_le_bytes());
    }

    /// First fit scan, then arena extension
    pub(crate) fn find_block(&mut self, size: usize) -> Option<Block> {
        let need = ((size.max(8) + 7) / 8) * 8;

        let mut at = 0;
        while at < self.top {
            let (bsize, flags) = self.header(at);
            if flags & USED == 0 && bsize >= need {
                if bsize - need >= HEAD + MIN_SPLIT {
                    self.set_header(at + HEAD + need, bsize - need - HEAD, 0);
                    self.set_header(at, need, USED);
                } else {
                    self.set_header(at, bsize, USED);
                }
                return Some(self.claim(at));
            }
            at += HEAD + bsize;
        }

        if self.top + HEAD + need > self.arena.len() {
            return None;
        }

        let at = self.top;
        self.set_header(at, need, USED);
        self.top += HEAD + need;
        Some(self.claim(at))
    }

    fn claim(&mut self, at: usize) -> Block {
        let (size, _) = self.header(at);
        self.arena[at + HEAD..at + HEAD + size].fill(0);

        if cfg!(feature = "memdbg") {
            log::debug!("block at {} allocated, {} bytes", at, size);
        }

        Block(at as u32)
    }

    /// Usable bytes in a block
    pub fn capacity(&self, b: Block) -> usize {
        self.header(b.0 as usize).0
    }

    pub fn bytes(&self, b: Block) -> &[u8] {
        let at = b.0 as usize + HEAD;
        &self.arena[at..at + self.capacity(b)]
    }

    pub fn bytes_mut(&mut self, b: Block) -> &mut [u8] {
        let at = b.0 as usize + HEAD;
        let size = self.capacity(b);
        &mut self.arena[at..at + size]
    }

    /// Copies the first `n` bytes of one block into another
    pub(crate) fn copy_block(&mut self, from: Block, to: Block, n: usize) {
        let src = from.0 as usize + HEAD;
        self.arena
            .copy_within(src..src + n, to.0 as usize + HEAD);
    }

    pub fn read_word(&self, b: Block, index: usize) -> u64 {
        let at = b.0 as usize + HEAD + index * 8;
        let mut word = [0; 8];
        word.copy_from_slice(&self.arena[at..at + 8]);
        u64::from_le_bytes(word)
    }

    pub fn write_word(&mut self, b: Block, index: usize, word: u64) {
        let at = b.0 as usize + HEAD + index * 8;
        self.arena[at..at + 8].copy_from_slice(&word.to_le_bytes());
    }

    // collection

    fn mark_block(&mut self, b: Block) {
        let at = b.0 as usize;
        let (size, flags) = self.header(at);
        self.set_header(at, size, flags | MARKED);
    }

    /// Marks everything reachable from `v`
    ///
    /// List structure is followed iteratively along the cdr, so long
    /// lists do not deepen the native stack.
    pub fn mark_value(&mut self, v: Value) {
        let mut v = v;
        loop {
            let index = match v.cell_index() {
                Some(i) => i,
                None => return,
            };
            let slot = &mut self.cells[index];
            if slot.marked {
                return;
            }
            slot.marked = true;

            let trace = slot.cell.trace();
            match self.mark_trace(trace) {
                Some(next) => v = next,
                None => return,
            }
        }
    }

    /// Marks the references of a cell not yet placed in the pool
    pub(crate) fn mark_pending(&mut self, cell: &Cell) {
        if let Some(next) = self.mark_trace(cell.trace()) {
            self.mark_value(next);
        }
    }

    /// Marks all but one of a cell's references, returning the last
    fn mark_trace(&mut self, trace: Trace) -> Option<Value> {
        match trace {
            Trace::Leaf => None,
            Trace::One(v) => Some(v),
            Trace::Two(a, d) => {
                self.mark_value(a);
                Some(d)
            }
            Trace::Symbol { name, value, next } => {
                self.mark_value(name);
                if let Some(v) = value {
                    self.mark_value(v);
                }
                Some(next)
            }
            Trace::Code {
                name,
                doc,
                code,
                len,
            } => {
                self.mark_block(code);
                for i in 0..len as usize {
                    let operand = Value::from_bits(self.read_word(code, i * 2 + 1));
                    self.mark_value(operand);
                }
                self.mark_value(name);
                Some(doc)
            }
            Trace::Array(data, len) => {
                self.mark_block(data);
                for i in 0..len as usize {
                    let elt = Value::from_bits(self.read_word(data, i));
                    self.mark_value(elt);
                }
                None
            }
            Trace::Block(b) => {
                self.mark_block(b);
                None
            }
        }
    }

    /// Frees every unmarked cell and merges every unmarked block into
    /// its free neighbors, clearing marks on survivors
    ///
    /// Returns the number of cells and blocks reclaimed.
    pub(crate) fn sweep(&mut self) -> (usize, usize) {
        let mut cells_freed = 0;
        for i in (1..self.cells.len()).rev() {
            let slot = &mut self.cells[i];
            if slot.marked {
                slot.marked = false;
            } else if !matches!(slot.cell, Cell::Free(_)) {
                slot.cell = Cell::Free(self.free);
                self.free = i as u32;
                self.free_count += 1;
                cells_freed += 1;
            }
        }

        let mut blocks_freed = 0;
        let mut at = 0;
        while at < self.top {
            let (size, flags) = self.header(at);
            if flags & USED != 0 && flags & MARKED != 0 {
                self.set_header(at, size, USED);
                at += HEAD + size;
                continue;
            }

            if flags & USED != 0 {
                blocks_freed += 1;
            }
            let mut end = at + HEAD + size;
            while end < self.top {
                let (nsize, nflags) = self.header(end);
                if nflags & USED != 0 && nflags & MARKED != 0 {
                    break;
                }
                if nflags & USED != 0 {
                    blocks_freed += 1;
                }
                end += HEAD + nsize;
            }

            self.set_header(at, end - at - HEAD, 0);
            at = end;
        }

        (cells_freed, blocks_freed)
    }

    /// Sizes and used flags of every block, in arena order
    #[cfg(test)]
    fn blocks(&self) -> Vec<(usize, bool)> {
        let mut out = Vec::new();
        let mut at = 0;
        while at < self.top {
            let (size, flags) = self.header(at);
            out.push((size, flags & USED != 0));
            at += HEAD + size;
        }
        out
    }
}

fn exhausted(what: &str) -> ! {
    log::error!("{} exhausted after collection", what);
    panic!("{} exhausted", what)
}

impl Runtime {
    /// Places `cell` in the pool, collecting first when free cells run
    /// low. The cell's own references are treated as roots meanwhile.
    pub(crate) fn alloc_cell(&mut self, cell: Cell) -> Value {
        if self.heap.needs_collect() {
            self.collect_with(Some(&cell));
        }

        let tag = cell.tag();
        match self.heap.take_free(cell) {
            Some(index) => Value::from_cell(tag, index),
            None => exhausted("cell pool"),
        }
    }

    /// Acquires a zeroed payload block of at least `size` bytes
    ///
    /// The caller must hold every other unrooted block it still needs
    /// through a cell before calling this.
    pub(crate) fn alloc_block(&mut self, size: usize) -> Block {
        if let Some(b) = self.heap.find_block(size) {
            return b;
        }

        self.collect();
        match self.heap.find_block(size) {
            Some(b) => b,
            None => exhausted("payload heap"),
        }
    }

    pub fn cons(&mut self, car: Value, cdr: Value) -> Value {
        self.alloc_cell(Cell::Cons(car, cdr))
    }

    /// Runs a full collection
    pub fn collect(&mut self) {
        self.collect_with(None)
    }

    fn collect_with(&mut self, pending: Option<&Cell>) {
        if let Some(cell) = pending {
            self.heap.mark_pending(cell);
        }

        for &b in self.symtab.buckets() {
            self.heap.mark_value(b);
        }
        for &r in &self.roots {
            self.heap.mark_value(r);
        }

        self.heap.mark_value(self.sym.halt);
        self.heap.mark_value(self.sym.make_closure);

        self.heap.mark_value(self.vm.val);
        self.heap.mark_value(self.vm.code);
        if let Some(n) = self.vm.native {
            self.heap.mark_value(n);
        }
        for &v in &self.vm.stack {
            self.heap.mark_value(v);
        }
        for b in &self.vm.dyns {
            self.heap.mark_value(b.sym);
            if let Some(old) = b.old {
                self.heap.mark_value(old);
            }
        }
        for &c in &self.vm.conts {
            self.heap.mark_value(c);
        }

        let (cells, blocks) = self.heap.sweep();
        self.heap.collections += 1;

        log::debug!(
            "gc #{}: {} cells and {} blocks reclaimed, {} cells free",
            self.heap.collections,
            cells,
            blocks,
            self.heap.free_cells()
        );
    }

    /// Cells in use; exact only right after a collection
    pub fn live_cells(&self) -> usize {
        self.heap.live_cells()
    }

    /// Pushes a value onto the root stack, returning its slot
    pub fn protect(&mut self, v: Value) -> usize {
        if self.roots.len() >= self.config.root_capacity {
            log::error!("root stack overflow");
            panic!("root stack overflow");
        }
        self.roots.push(v);
        self.roots.len() - 1
    }

    /// Replaces the value held in a root slot
    pub fn root_set(&mut self, slot: usize, v: Value) {
        self.roots[slot] = v;
    }

    /// Pops `count` values off the root stack
    pub fn unprotect(&mut self, count: usize) {
        let depth = self.roots.len().saturating_sub(count);
        self.roots.truncate(depth);
    }

    /// Runs `f`, then restores the root stack to its prior depth
    /// whether or not `f` returned early
    pub fn with_roots<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let depth = self.roots.len();
        let out = f(self);
        self.roots.truncate(depth);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuki::Config;

    fn small(cells: usize) -> Runtime {
        Runtime::bare(Config {
            cells,
            low_water: 8,
            ..Config::default()
        })
    }

    #[test]
    fn fresh_heap() {
        let heap = Heap::new(16, 1024, 2);
        assert_eq!(heap.free_cells(), 15);
        assert_eq!(heap.live_cells(), 0);
    }

    #[test]
    fn free_list_order() {
        let mut heap = Heap::new(4, 64, 0);
        assert_eq!(heap.take_free(Cell::Cons(Value::NIL, Value::NIL)), Some(1));
        assert_eq!(heap.take_free(Cell::Cons(Value::NIL, Value::NIL)), Some(2));
        assert_eq!(heap.take_free(Cell::Cons(Value::NIL, Value::NIL)), Some(3));
        assert_eq!(heap.take_free(Cell::Cons(Value::NIL, Value::NIL)), None);
    }

    #[test]
    fn block_split_and_reuse() {
        let mut heap = Heap::new(4, 1024, 0);
        let a = heap.find_block(100).unwrap();
        let b = heap.find_block(40).unwrap();
        assert_eq!(heap.capacity(a), 104);
        assert_eq!(heap.blocks(), vec![(104, true), (40, true)]);

        // keep b alive, drop a
        heap.mark_block(b);
        heap.sweep();
        assert_eq!(heap.blocks(), vec![(104, false), (40, true)]);

        // a split leaves a usable remainder behind
        let c = heap.find_block(16).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.blocks(), vec![(16, true), (80, false), (40, true)]);
    }

    #[test]
    fn sweep_coalesces() {
        let mut heap = Heap::new(4, 1024, 0);
        for _ in 0..5 {
            heap.find_block(24).unwrap();
        }
        let keep = heap.find_block(24).unwrap();
        heap.mark_block(keep);

        let (_, freed) = heap.sweep();
        assert_eq!(freed, 5);
        assert_eq!(heap.blocks(), vec![(5 * 24 + 4 * HEAD, false), (24, true)]);
    }

    #[test]
    fn block_words() {
        let mut heap = Heap::new(4, 256, 0);
        let b = heap.find_block(24).unwrap();
        heap.write_word(b, 2, 0xdead_beef);
        assert_eq!(heap.read_word(b, 2), 0xdead_beef);
        assert_eq!(heap.read_word(b, 0), 0);
    }

    #[test]
    fn reachable_cells_survive() {
        let mut rt = small(4096);
        rt.collect();
        let baseline = rt.heap.live_cells();

        let slot = rt.protect(Value::NIL);
        for i in 0..100 {
            // interleave garbage with the kept list
            rt.cons(Value::int(i), Value::NIL);
            let head = rt.roots[slot];
            let kept = rt.cons(Value::int(i), head);
            rt.root_set(slot, kept);
        }

        rt.collect();
        assert_eq!(rt.heap.live_cells(), baseline + 100);

        let mut n = 0;
        let mut cur = rt.roots[slot];
        while let Ok(next) = rt.cdr(cur) {
            if !cur.is_pair() {
                break;
            }
            n += 1;
            cur = next;
        }
        assert_eq!(n, 100);

        rt.unprotect(1);
        rt.collect();
        assert_eq!(rt.live_cells(), baseline);
    }

    #[test]
    fn burst_beyond_pool() {
        let mut rt = small(2048);
        let slot = rt.protect(Value::NIL);
        for i in 0..20_000 {
            let c = rt.cons(Value::int(i), Value::NIL);
            if i % 1000 == 0 {
                let head = rt.roots[slot];
                let kept = rt.cons(c, head);
                rt.root_set(slot, kept);
            }
        }
        assert!(rt.heap.collections > 0);
        rt.collect();
        assert!(rt.heap.free_cells() > 1000);
    }

    #[test]
    #[should_panic(expected = "cell pool exhausted")]
    fn live_set_too_large() {
        let mut rt = small(2048);
        let slot = rt.protect(Value::NIL);
        for i in 0..4096 {
            let head = rt.roots[slot];
            let kept = rt.cons(Value::int(i), head);
            rt.root_set(slot, kept);
        }
    }

    fn small_payload(payload_bytes: usize) -> Runtime {
        Runtime::bare(Config {
            cells: 4096,
            low_water: 8,
            payload_bytes,
            ..Config::default()
        })
    }

    #[test]
    fn payload_recovered_by_collecting() {
        let mut rt = small_payload(16 << 10);
        let text = "k".repeat(1000);
        let anchor = rt.make_string(&text);
        rt.protect(anchor);

        // far more bytes than the arena holds, all but one string garbage
        for _ in 0..200 {
            rt.make_string(&"g".repeat(1000));
        }

        assert_eq!(rt.string_value(anchor).unwrap(), text);
    }

    #[test]
    #[should_panic(expected = "payload heap exhausted")]
    fn payload_live_set_too_large() {
        let mut rt = small_payload(16 << 10);
        let slot = rt.protect(Value::NIL);
        for _ in 0..40 {
            let s = rt.make_string(&"l".repeat(1000));
            let head = rt.roots[slot];
            let kept = rt.cons(s, head);
            rt.root_set(slot, kept);
        }
    }

    #[test]
    fn pending_cell_is_rooted() {
        let mut rt = small(1024);
        // force every allocation to collect
        rt.heap.low_water = usize::MAX;
        let s = rt.make_string("survivor");
        let pair = rt.cons(s, Value::NIL);
        rt.protect(pair);
        rt.cons(Value::NIL, Value::NIL);
        let kept = rt.car(pair).unwrap();
        assert_eq!(rt.string_value(kept).unwrap(), "survivor");
    }

    #[test]
    fn scoped_roots() {
        let mut rt = small(1024);
        rt.protect(Value::int(1));
        let r: Result<(), ()> = rt.with_roots(|rt| {
            rt.protect(Value::int(2));
            rt.protect(Value::int(3));
            Err(())
        });
        assert!(r.is_err());
        assert_eq!(rt.roots.len(), 1);
    }
}
