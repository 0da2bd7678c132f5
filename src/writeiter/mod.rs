//! # Write Iterator
//!
//! The compaction merge: N sorted statement sources in, one sorted stream
//! out, projected for the set of live read views. The output is consumed
//! directly by the next level's run writer.
//!
//! ## How a key is projected
//!
//! The ascending read-view list partitions LSN space into **bands**; a
//! statement belongs to the band of the smallest vlsn at or above its LSN
//! (the synthetic "newest" band above them all). Within a band, history
//! collection stops at the first terminal statement — everything older in
//! the band is dominated. Each band then resolves to at most one output
//! statement:
//!
//! - a terminal-ended band applies its upsert prefix over the terminal;
//! - a band of bare upserts squashes into one upsert, except the oldest
//!   band at the last level, which materializes over an absent base;
//! - a band result indistinguishable from the next older band's (same
//!   type and payload, not an INSERT) is dropped — the older statement is
//!   already visible in both views.
//!
//! Leading DELETE discarding and INSERT/REPLACE rewriting, last-level
//! DELETE elision and the secondary-index optimized-update elision are
//! applied per the rules in the method docs below.
//!
//! ## Guarantees
//!
//! - Output is strictly ascending by key, descending LSN within a key.
//! - For every live read view, the visible statements of the output equal
//!   the visible statements of the input.
//! - Deterministic: identical inputs and configuration produce identical
//!   output.
//! - Skip-read statements are consumed for band accounting, never emitted.
//! - Errors abort the merge; the iterator never retries.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub mod source;

pub use source::{DecodeSource, MemSource, SourceError, StmtSource, VecSource};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::keydef::KeyDef;
use crate::mem::Mem;
use crate::stmt::{StmtRef, StmtType, TupleFormat};
use crate::upsert::{History, squash_chain};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the write iterator.
#[derive(Debug, Error)]
pub enum WriteIterError {
    /// A source failed; forwarded verbatim.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// The iterator was driven outside its state machine.
    #[error("logic violation: {0}")]
    Logic(String),
}

// ------------------------------------------------------------------------------------------------
// Merge heap
// ------------------------------------------------------------------------------------------------

struct HeapEntry {
    stmt: StmtRef,
    /// Source index; lower means newer level and wins ties.
    src: usize,
    key_def: Arc<KeyDef>,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap: reverse so the smallest key / highest LSN pops first,
        // and the newest-level source wins a full tie.
        self.key_def
            .compare_stmts(&self.stmt, &other.stmt)
            .then(self.src.cmp(&other.src))
            .reverse()
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

// ------------------------------------------------------------------------------------------------
// Write iterator
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WiState {
    New,
    Running,
    Done,
    Closed,
}

/// Merges sorted sources into the minimal stream the next level needs.
pub struct WriteIterator {
    key_def: Arc<KeyDef>,
    format: TupleFormat,
    is_primary: bool,
    is_last_level: bool,
    /// Ascending, deduplicated read-view LSNs.
    rv_list: Vec<u64>,
    sources: Vec<Box<dyn StmtSource>>,
    heap: BinaryHeap<HeapEntry>,
    /// Output batch of the key under emission, newest first.
    out: VecDeque<StmtRef>,
    state: WiState,
    stmts_in: u64,
    stmts_out: u64,
}

impl WriteIterator {
    /// Creates a write iterator.
    ///
    /// `rv_list` is the read-view snapshot the merge must preserve; it is
    /// normalized to ascending order. `is_last_level` allows dangling
    /// terminal DELETE elision; `is_primary = false` enables the
    /// secondary-index optimized-update elision.
    pub fn new(
        key_def: Arc<KeyDef>,
        format: TupleFormat,
        is_primary: bool,
        is_last_level: bool,
        mut rv_list: Vec<u64>,
    ) -> Self {
        rv_list.sort_unstable();
        rv_list.dedup();
        Self {
            key_def,
            format,
            is_primary,
            is_last_level,
            rv_list,
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            out: VecDeque::new(),
            state: WiState::New,
            stmts_in: 0,
            stmts_out: 0,
        }
    }

    pub fn format(&self) -> TupleFormat {
        self.format
    }

    /// Adds a source. Sources are added newest-to-oldest; on a full
    /// `(key, lsn, type)` tie the earliest-added source wins.
    pub fn add_source(&mut self, source: Box<dyn StmtSource>) -> Result<(), WriteIterError> {
        if self.state != WiState::New {
            return Err(WriteIterError::Logic(
                "sources must be added before start".into(),
            ));
        }
        self.sources.push(source);
        Ok(())
    }

    /// Convenience: adds a sealed generation as a source. The generation
    /// must carry the iterator's tuple format.
    pub fn add_mem(&mut self, mem: Arc<Mem>) -> Result<(), WriteIterError> {
        if mem.format() != self.format {
            return Err(WriteIterError::Logic(format!(
                "generation {} has format {}, iterator expects {}",
                mem.generation(),
                mem.format().id,
                self.format.id
            )));
        }
        self.add_source(Box::new(MemSource::new(mem)))
    }

    /// Starts every source and primes the merge heap.
    pub fn start(&mut self) -> Result<(), WriteIterError> {
        if self.state != WiState::New {
            return Err(WriteIterError::Logic(format!(
                "start in state {:?}",
                self.state
            )));
        }
        debug!(
            sources = self.sources.len(),
            read_views = self.rv_list.len(),
            is_primary = self.is_primary,
            is_last_level = self.is_last_level,
            "write iterator starting"
        );
        for idx in 0..self.sources.len() {
            if let Err(e) = self.sources[idx].start() {
                self.state = WiState::Done;
                return Err(e.into());
            }
            if let Err(e) = self.refill(idx) {
                self.state = WiState::Done;
                return Err(e);
            }
        }
        self.state = WiState::Running;
        Ok(())
    }

    /// Next output statement, or `None` once the merge is complete.
    pub fn next(&mut self) -> Result<Option<StmtRef>, WriteIterError> {
        match self.state {
            WiState::New => {
                return Err(WriteIterError::Logic("next before start".into()));
            }
            WiState::Closed => {
                return Err(WriteIterError::Logic("next after close".into()));
            }
            WiState::Done => return Ok(None),
            WiState::Running => {}
        }
        loop {
            if let Some(stmt) = self.out.pop_front() {
                self.stmts_out += 1;
                return Ok(Some(stmt));
            }
            if self.heap.is_empty() {
                self.state = WiState::Done;
                debug!(
                    stmts_in = self.stmts_in,
                    stmts_out = self.stmts_out,
                    "write iterator finished"
                );
                return Ok(None);
            }
            match self.emit_next_key() {
                Ok(()) => {}
                Err(e) => {
                    self.state = WiState::Done;
                    return Err(e);
                }
            }
        }
    }

    /// Stops the sources. The iterator yields nothing afterwards.
    pub fn stop(&mut self) {
        for source in &mut self.sources {
            source.stop();
        }
        if self.state != WiState::Closed {
            self.state = WiState::Done;
        }
    }

    /// Releases every source reference. Terminal.
    pub fn close(&mut self) {
        self.stop();
        self.sources.clear();
        self.heap.clear();
        self.out.clear();
        self.state = WiState::Closed;
    }

    // --------------------------------------------------------------------------------------------
    // Merge plumbing
    // --------------------------------------------------------------------------------------------

    fn refill(&mut self, src: usize) -> Result<(), WriteIterError> {
        if let Some(stmt) = self.sources[src].next()? {
            self.stmts_in += 1;
            self.heap.push(HeapEntry {
                stmt,
                src,
                key_def: Arc::clone(&self.key_def),
            });
        }
        Ok(())
    }

    /// Pops the full version chain of the smallest key and projects it
    /// into the output queue.
    fn emit_next_key(&mut self) -> Result<(), WriteIterError> {
        let first = self.heap.pop().ok_or_else(|| {
            WriteIterError::Logic("emit_next_key on an empty heap".into())
        })?;
        self.refill(first.src)?;
        let key = self.key_def.extract_key(&first.stmt);
        let mut chain: Vec<StmtRef> = vec![first.stmt];

        loop {
            let same_key = self
                .heap
                .peek()
                .is_some_and(|top| self.key_def.same_key(&top.stmt, &chain[0]));
            if !same_key {
                break;
            }
            let entry = self.heap.pop().ok_or_else(|| {
                WriteIterError::Logic("peeked entry vanished".into())
            })?;
            self.refill(entry.src)?;
            // A statement present in several sources is the same row seen
            // at different levels; keep the newest-level copy only.
            let duplicate = chain.last().is_some_and(|prev| {
                prev.lsn() == entry.stmt.lsn() && prev.ty() == entry.stmt.ty()
            });
            if !duplicate {
                chain.push(entry.stmt);
            }
        }

        let emitted = self.project_key(&chain);
        trace!(
            key = ?key,
            chain_len = chain.len(),
            emitted = emitted.len(),
            "key projected"
        );
        self.out.extend(emitted);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Per-key projection
    // --------------------------------------------------------------------------------------------

    /// Projects one key's chain (newest first) into its output statements
    /// (newest first).
    fn project_key(&self, chain: &[StmtRef]) -> Vec<StmtRef> {
        let bands = self.rv_list.len() + 1;
        let mut slots: Vec<Vec<StmtRef>> = vec![Vec::new(); bands];
        let mut done = vec![false; bands];

        // Assign each statement to its band: the smallest read view at or
        // above its LSN, the synthetic newest band otherwise. The chain is
        // newest-first, so the cursor only ever moves toward older bands.
        let mut cur = bands - 1;
        let mut i = 0;
        while i < chain.len() {
            let stmt = &chain[i];
            while cur > 0 && self.rv_list[cur - 1] >= stmt.lsn() {
                cur -= 1;
            }
            // Skip-read statements take part in band accounting only.
            if stmt.skip_read() {
                i += 1;
                continue;
            }
            // Secondary-index optimized update: a REPLACE + DELETE pair
            // sharing a group id within one band cancels out; the on-disk
            // secondary index reads the same either way.
            if !self.is_primary
                && stmt.ty() == StmtType::Replace
                && stmt.opt_update_group().is_some()
                && i + 1 < chain.len()
            {
                let del = &chain[i + 1];
                if del.ty() == StmtType::Delete
                    && del.opt_update_group() == stmt.opt_update_group()
                    && Self::band_of(&self.rv_list, del.lsn()) == cur
                {
                    i += 2;
                    continue;
                }
            }
            if !done[cur] {
                slots[cur].push(stmt.clone());
                if stmt.is_terminal() {
                    done[cur] = true;
                }
            }
            i += 1;
        }

        // Resolve each band, oldest first.
        let oldest_filled = slots.iter().position(|s| !s.is_empty());
        let mut results: Vec<StmtRef> = Vec::new();
        for (idx, hist) in slots.iter().enumerate() {
            if hist.is_empty() {
                continue;
            }
            let terminal = hist.last().is_some_and(|oldest| oldest.is_terminal());
            let resolved = if terminal {
                self.apply_band(hist, true)
            } else if self.is_last_level && Some(idx) == oldest_filled {
                // Bottom of the tree: nothing underneath, materialize the
                // bare upsert chain over an absent base.
                self.apply_band(hist, false)
            } else {
                Some(squash_chain(hist, &self.key_def))
            };
            if let Some(stmt) = resolved {
                results.push(stmt);
            }
        }

        // Adjacent bands that resolved to indistinguishable statements
        // collapse onto the older one: it is visible in both views.
        let mut deduped: Vec<StmtRef> = Vec::new();
        for stmt in results {
            if let Some(prev) = deduped.last() {
                let same = stmt.ty() == prev.ty()
                    && match stmt.ty() {
                        StmtType::Delete => true,
                        StmtType::Replace => stmt.tuple() == prev.tuple(),
                        _ => false,
                    };
                if same {
                    continue;
                }
            }
            deduped.push(stmt);
        }

        self.rewrite_leading(chain, &mut deduped);
        self.elide_last_level_delete(&mut deduped);

        deduped.reverse();
        deduped
    }

    fn apply_band(&self, hist: &[StmtRef], keep_delete: bool) -> Option<StmtRef> {
        let mut history = History::new();
        for stmt in hist {
            history.push(stmt.clone());
        }
        history.apply(&self.key_def, keep_delete)
    }

    fn band_of(rv_list: &[u64], lsn: u64) -> usize {
        rv_list.partition_point(|&rv| rv < lsn)
    }

    /// Leading INSERT/DELETE rewriting, applied at the oldest end of the
    /// emitted sequence:
    ///
    /// - A key born by an INSERT sheds its oldest DELETE results, and the
    ///   REPLACE that follows them becomes the new birth INSERT.
    /// - A key with prior history must not lead with an INSERT; it is
    ///   demoted to a REPLACE.
    fn rewrite_leading(&self, chain: &[StmtRef], emitted: &mut Vec<StmtRef>) {
        let Some(oldest_input) = chain.last() else { return };
        if oldest_input.ty() == StmtType::Insert {
            let leading_deletes = emitted
                .iter()
                .take_while(|s| s.ty() == StmtType::Delete)
                .count();
            emitted.drain(..leading_deletes);
            if emitted.first().is_some_and(|s| s.ty() == StmtType::Replace) {
                let reborn = emitted[0].to_insert();
                emitted[0] = reborn;
            }
        } else if emitted.first().is_some_and(|s| s.ty() == StmtType::Insert) {
            let demoted = emitted[0].to_replace();
            emitted[0] = demoted;
        }
    }

    /// Drops a terminal DELETE at the bottom of the last level, but only
    /// if no live read view could still observe it. A read view pinned
    /// exactly at the DELETE's LSN keeps it.
    fn elide_last_level_delete(&self, emitted: &mut Vec<StmtRef>) {
        if !self.is_last_level {
            return;
        }
        let Some(oldest) = emitted.first() else { return };
        if oldest.ty() != StmtType::Delete {
            return;
        }
        let next_newer_lsn = emitted.get(1).map_or(u64::MAX, |s| s.lsn());
        let observed = self
            .rv_list
            .iter()
            .any(|&rv| oldest.lsn() <= rv && rv < next_newer_lsn);
        if !observed {
            emitted.remove(0);
        }
    }
}

impl Drop for WriteIterator {
    fn drop(&mut self) {
        if self.state != WiState::Closed {
            self.close();
        }
    }
}
