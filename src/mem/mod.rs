//! # In-Memory Generation (MEM)
//!
//! The ordered, multi-version write buffer of the storage core. One `Mem`
//! owns one generation of statements for one tuple format, absorbs writes
//! from a single committer, and serves concurrent snapshot readers until
//! it is sealed and drained into the next level by the write iterator.
//!
//! ## Design Invariants
//!
//! - The tree is fully consistent between mutations: all versions of a key
//!   are adjacent, newest first, under the key definition's total order.
//! - Writers are single-threaded per generation. Readers never take the
//!   writer's lock across yields; they detect mutation through the
//!   monotone `version` counter and re-probe by key.
//! - A write that returns an error leaves the generation unchanged.
//! - `commit` never fails: it only advances `dump_lsn` and the version.
//! - Rollback removes the statement but does **not** reclaim arena bytes;
//!   accounting is released when the generation is dropped.
//! - State moves one way: `Active` → `Sealed` → `Draining`.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

pub mod iterator;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam::channel::Sender;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::CoreConfig;
use crate::keydef::{KeyDef, KeyError, LSN_INF};
use crate::stmt::{StmtRef, StmtType, TupleFormat, Value};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by generation write operations.
#[derive(Debug, Error)]
pub enum MemError {
    /// The statement's key cannot be interpreted under the generation's
    /// key definition.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// The arena quota is exhausted and the grow hook could not help.
    #[error("arena quota exceeded (requested {requested}, used {used}, quota {quota})")]
    QuotaExceeded {
        requested: usize,
        used: usize,
        quota: usize,
    },

    /// The statement's tuple does not match the generation's format.
    #[error("tuple has {got} fields, format {format_id} expects {expected}")]
    Format {
        format_id: u32,
        expected: u32,
        got: usize,
    },

    /// Write on a generation that is no longer active.
    #[error("generation {generation} is {state:?}, writes are not allowed")]
    NotActive { generation: u64, state: MemState },

    /// An internal invariant was violated. Never ignored, always fatal for
    /// the current operation.
    #[error("logic violation: {0}")]
    Logic(String),
}

// ------------------------------------------------------------------------------------------------
// Tree entry — statements under the comparator's total order
// ------------------------------------------------------------------------------------------------

/// A statement wrapped with its key definition so the standard ordered
/// collections can sort it: key ascending, LSN descending, rank.
#[derive(Clone)]
pub(crate) struct TreeEntry {
    pub stmt: StmtRef,
    key_def: Arc<KeyDef>,
}

impl TreeEntry {
    pub fn new(stmt: StmtRef, key_def: Arc<KeyDef>) -> Self {
        Self { stmt, key_def }
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_def.compare_stmts(&self.stmt, &other.stmt)
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TreeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TreeEntry {}

// ------------------------------------------------------------------------------------------------
// Tree — the ordered multi-version container
// ------------------------------------------------------------------------------------------------

/// Sorted multi-version statement set.
///
/// Iteration order coincides with the comparator. Probes built from the
/// reserved bound LSNs straddle a key: `LSN_INF` before all versions,
/// `0` after. There is no structural sharing across generations.
pub(crate) struct Tree {
    set: BTreeSet<TreeEntry>,
    key_def: Arc<KeyDef>,
}

impl Tree {
    pub fn new(key_def: Arc<KeyDef>) -> Self {
        Self {
            set: BTreeSet::new(),
            key_def,
        }
    }

    fn entry(&self, stmt: &StmtRef) -> TreeEntry {
        TreeEntry::new(stmt.clone(), Arc::clone(&self.key_def))
    }

    /// Inserts a statement, returning the previous statement equal under
    /// the comparator, if any.
    pub fn replace(&mut self, stmt: StmtRef) -> Option<StmtRef> {
        let entry = self.entry(&stmt);
        self.set.replace(entry).map(|prev| prev.stmt)
    }

    /// Removes a statement. Returns `false` if it was not present.
    pub fn remove(&mut self, stmt: &StmtRef) -> bool {
        let entry = self.entry(stmt);
        self.set.remove(&entry)
    }

    pub fn first(&self) -> Option<StmtRef> {
        self.set.first().map(|e| e.stmt.clone())
    }

    pub fn last(&self) -> Option<StmtRef> {
        self.set.last().map(|e| e.stmt.clone())
    }

    /// First statement at or after the probe (lower bound).
    pub fn first_at_or_after(&self, probe: &StmtRef) -> Option<StmtRef> {
        let entry = self.entry(probe);
        self.set
            .range((Bound::Included(&entry), Bound::Unbounded))
            .next()
            .map(|e| e.stmt.clone())
    }

    /// First statement strictly after the probe (upper bound).
    pub fn first_after(&self, probe: &StmtRef) -> Option<StmtRef> {
        let entry = self.entry(probe);
        self.set
            .range((Bound::Excluded(&entry), Bound::Unbounded))
            .next()
            .map(|e| e.stmt.clone())
    }

    /// Last statement strictly before the probe.
    pub fn last_before(&self, probe: &StmtRef) -> Option<StmtRef> {
        let entry = self.entry(probe);
        self.set
            .range((Bound::Unbounded, Bound::Excluded(&entry)))
            .next_back()
            .map(|e| e.stmt.clone())
    }
}

// ------------------------------------------------------------------------------------------------
// Arena accounting
// ------------------------------------------------------------------------------------------------

/// Grow hook: given the shortfall in bytes, return the new quota if more
/// memory could be made available.
pub type GrowHook = Box<dyn Fn(usize) -> Option<usize> + Send + Sync>;

struct ArenaInner {
    used: usize,
    quota: usize,
}

/// Byte accounting for the statements of one or more active generations.
///
/// Charging is the only fallible step of a write: once the arena accepted
/// the bytes, the tree mutation cannot fail, so a failed write leaves no
/// partial state behind. A charge that would exceed the quota invokes the
/// grow hook once and retries before giving up.
pub struct MemArena {
    inner: Mutex<ArenaInner>,
    grow_hook: Option<GrowHook>,
}

impl MemArena {
    /// Creates an arena; `None` means unbounded.
    pub fn new(quota: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                used: 0,
                quota: quota.unwrap_or(usize::MAX),
            }),
            grow_hook: None,
        }
    }

    /// Creates an unbounded arena.
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Installs the grow hook consulted when a charge hits the quota.
    pub fn with_grow_hook(mut self, hook: GrowHook) -> Self {
        self.grow_hook = Some(hook);
        self
    }

    /// Reserves `bytes`, retrying once after the grow hook.
    pub fn charge(&self, bytes: usize) -> Result<(), MemError> {
        for attempt in 0..2 {
            {
                let mut inner = self.inner.lock().expect("arena poisoned");
                if inner.used.saturating_add(bytes) <= inner.quota {
                    inner.used += bytes;
                    return Ok(());
                }
                if attempt == 1 || self.grow_hook.is_none() {
                    return Err(MemError::QuotaExceeded {
                        requested: bytes,
                        used: inner.used,
                        quota: inner.quota,
                    });
                }
            }
            // Lock released: the hook may consult the arena itself.
            if let Some(hook) = &self.grow_hook {
                match hook(bytes) {
                    Some(new_quota) => {
                        debug!(new_quota, "arena grown by hook");
                        self.inner.lock().expect("arena poisoned").quota = new_quota;
                    }
                    None => {
                        let inner = self.inner.lock().expect("arena poisoned");
                        return Err(MemError::QuotaExceeded {
                            requested: bytes,
                            used: inner.used,
                            quota: inner.quota,
                        });
                    }
                }
            }
        }
        unreachable!("charge loop runs at most twice")
    }

    /// Returns `bytes` to the arena. Called when a generation is dropped.
    pub fn release(&self, bytes: usize) {
        let mut inner = self.inner.lock().expect("arena poisoned");
        inner.used = inner.used.saturating_sub(bytes);
    }

    pub fn used(&self) -> usize {
        self.inner.lock().expect("arena poisoned").used
    }

    pub fn quota(&self) -> usize {
        self.inner.lock().expect("arena poisoned").quota
    }
}

// ------------------------------------------------------------------------------------------------
// Squash requests
// ------------------------------------------------------------------------------------------------

/// Request to materialize an upsert chain in the background.
///
/// Emitted at most once per threshold crossing thanks to the saturating
/// per-statement counter.
#[derive(Debug, Clone, PartialEq)]
pub struct SquashRequest {
    pub generation: u64,
    pub key: Vec<Value>,
}

// ------------------------------------------------------------------------------------------------
// Generation state
// ------------------------------------------------------------------------------------------------

/// Lifecycle of a generation. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemState {
    /// Receiving writes from one committer.
    Active,
    /// No more writes; readable, awaiting drain.
    Sealed,
    /// Being consumed by a write iterator.
    Draining,
}

const STATE_ACTIVE: u8 = 0;
const STATE_SEALED: u8 = 1;
const STATE_DRAINING: u8 = 2;

fn state_from_u8(raw: u8) -> MemState {
    match raw {
        STATE_ACTIVE => MemState::Active,
        STATE_SEALED => MemState::Sealed,
        _ => MemState::Draining,
    }
}

// ------------------------------------------------------------------------------------------------
// Mem
// ------------------------------------------------------------------------------------------------

struct MemInner {
    tree: Tree,
    row_count: u64,
    byte_count: usize,
    min_lsn: u64,
    max_lsn: u64,
    dump_lsn: u64,
}

/// One in-memory generation: a tree of versioned statements plus arena
/// accounting and the bookkeeping counters.
pub struct Mem {
    key_def: Arc<KeyDef>,
    format: TupleFormat,
    generation: u64,
    arena: Arc<MemArena>,
    inner: RwLock<MemInner>,
    /// Bumped on every mutation; read lock-free by iterators.
    version: AtomicU64,
    state: AtomicU8,
    squash_threshold: u8,
    squash_tx: Option<Sender<SquashRequest>>,
    cache_pinning: bool,
}

impl Mem {
    /// Creates an active generation bound to an arena, a key definition
    /// and a tuple format.
    pub fn new(
        arena: Arc<MemArena>,
        key_def: Arc<KeyDef>,
        format: TupleFormat,
        generation: u64,
    ) -> Self {
        Self {
            inner: RwLock::new(MemInner {
                tree: Tree::new(Arc::clone(&key_def)),
                row_count: 0,
                byte_count: 0,
                min_lsn: u64::MAX,
                max_lsn: 0,
                dump_lsn: 0,
            }),
            key_def,
            format,
            generation,
            arena,
            version: AtomicU64::new(0),
            state: AtomicU8::new(STATE_ACTIVE),
            squash_threshold: CoreConfig::default().upsert_squash_threshold,
            squash_tx: None,
            cache_pinning: false,
        }
    }

    /// Applies configuration knobs. Call before the first write.
    pub fn with_config(mut self, config: &CoreConfig) -> Self {
        self.squash_threshold = config.upsert_squash_threshold;
        self.cache_pinning = config.cache_pinning;
        self
    }

    /// Installs the channel the generation uses to request background
    /// upsert squashing.
    pub fn with_squash_queue(mut self, tx: Sender<SquashRequest>) -> Self {
        self.squash_tx = Some(tx);
        self
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn key_def(&self) -> &Arc<KeyDef> {
        &self.key_def
    }

    pub fn format(&self) -> TupleFormat {
        self.format
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> MemState {
        state_from_u8(self.state.load(AtomicOrdering::Acquire))
    }

    /// Monotone mutation counter.
    pub fn version(&self) -> u64 {
        self.version.load(AtomicOrdering::Acquire)
    }

    pub fn row_count(&self) -> u64 {
        self.read_inner().row_count
    }

    pub fn byte_count(&self) -> usize {
        self.read_inner().byte_count
    }

    /// Smallest LSN of any resident statement; `u64::MAX` when empty.
    pub fn min_lsn(&self) -> u64 {
        self.read_inner().min_lsn
    }

    /// Largest LSN of any resident statement; `0` when empty.
    pub fn max_lsn(&self) -> u64 {
        self.read_inner().max_lsn
    }

    /// Largest LSN known to be durably committed into this generation.
    pub fn dump_lsn(&self) -> u64 {
        self.read_inner().dump_lsn
    }

    pub fn is_empty(&self) -> bool {
        self.read_inner().row_count == 0
    }

    pub(crate) fn cache_pinning(&self) -> bool {
        self.cache_pinning
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, MemInner> {
        self.inner.read().expect("mem lock poisoned")
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, MemInner> {
        self.inner.write().expect("mem lock poisoned")
    }

    /// Runs a closure against the tree under the read lock. Iterators use
    /// this for every probe so they never hold the lock across yields.
    pub(crate) fn with_tree<R>(&self, f: impl FnOnce(&Tree) -> R) -> R {
        f(&self.read_inner().tree)
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Stops accepting writes. Active → Sealed.
    pub fn seal(&self) -> Result<(), MemError> {
        self.transition(STATE_ACTIVE, STATE_SEALED, "seal")
    }

    /// Marks the generation as being consumed by a write iterator.
    /// Sealed → Draining.
    pub fn begin_drain(&self) -> Result<(), MemError> {
        self.transition(STATE_SEALED, STATE_DRAINING, "begin_drain")
    }

    fn transition(&self, from: u8, to: u8, op: &str) -> Result<(), MemError> {
        self.state
            .compare_exchange(from, to, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .map_err(|actual| {
                MemError::Logic(format!(
                    "{op} on generation {} in state {:?}",
                    self.generation,
                    state_from_u8(actual)
                ))
            })?;
        debug!(
            generation = self.generation,
            state = ?state_from_u8(to),
            "generation state changed"
        );
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts a terminal statement (INSERT / REPLACE / DELETE).
    ///
    /// The statement becomes visible to iterators immediately; visibility
    /// to cache consumers is finalized by [`commit`](Self::commit).
    pub fn insert(&self, stmt: StmtRef) -> Result<(), MemError> {
        if stmt.ty() == StmtType::Upsert {
            return Err(MemError::Logic(
                "upsert statements go through insert_upsert".into(),
            ));
        }
        self.insert_checked(stmt)?;
        Ok(())
    }

    /// Inserts an UPSERT, maintaining the per-key squash counter.
    ///
    /// When the counter crosses the threshold, exactly one
    /// [`SquashRequest`] is emitted for the key.
    pub fn insert_upsert(&self, stmt: StmtRef) -> Result<(), MemError> {
        if stmt.ty() != StmtType::Upsert {
            return Err(MemError::Logic(format!(
                "insert_upsert called with a {} statement",
                stmt.ty()
            )));
        }
        self.insert_checked(stmt.clone())?;

        // If the adjacent older statement for the key is also an upsert,
        // bump the saturating counter:
        //
        //   UPSERT, n = 0
        //   UPSERT, n = 1,
        //           ...
        //   UPSERT, n = threshold,
        //   UPSERT, n = threshold + 1, and every following one stays
        //           ...                at threshold + 1.
        let older = self.with_tree(|tree| tree.first_after(&stmt));
        let Some(older) = older else { return Ok(()) };
        if older.ty() != StmtType::Upsert || !self.key_def.same_key(&stmt, &older) {
            return Ok(());
        }
        let n = older.n_upserts();
        if n <= self.squash_threshold {
            let bumped = n + 1;
            stmt.set_n_upserts(bumped);
            if bumped > self.squash_threshold {
                self.request_squash(&stmt);
            }
        } else {
            stmt.set_n_upserts(self.squash_threshold.saturating_add(1));
        }
        Ok(())
    }

    fn insert_checked(&self, stmt: StmtRef) -> Result<(), MemError> {
        let state = self.state();
        if state != MemState::Active {
            return Err(MemError::NotActive {
                generation: self.generation,
                state,
            });
        }
        if stmt.ty() == StmtType::SelectKey {
            return Err(MemError::Logic(
                "select-key probes never reside in a generation".into(),
            ));
        }
        if stmt.lsn() == 0 || stmt.lsn() == LSN_INF {
            return Err(MemError::Logic(format!(
                "lsn {} is reserved for iterator bounds",
                stmt.lsn()
            )));
        }
        self.key_def.validate_stmt(&stmt)?;
        if !stmt.ty().is_key_only() && stmt.tuple().len() != self.format.field_count as usize {
            return Err(MemError::Format {
                format_id: self.format.id,
                expected: self.format.field_count,
                got: stmt.tuple().len(),
            });
        }

        let size = stmt.size();
        self.arena.charge(size)?;

        let mut inner = self.write_inner();
        let lsn = stmt.lsn();
        let replaced = inner.tree.replace(stmt);
        if replaced.is_none() {
            inner.row_count += 1;
        }
        inner.byte_count += size;
        inner.min_lsn = inner.min_lsn.min(lsn);
        inner.max_lsn = inner.max_lsn.max(lsn);
        drop(inner);
        self.version.fetch_add(1, AtomicOrdering::AcqRel);
        trace!(generation = self.generation, lsn, "statement inserted");
        Ok(())
    }

    fn request_squash(&self, stmt: &StmtRef) {
        let Some(tx) = &self.squash_tx else { return };
        let request = SquashRequest {
            generation: self.generation,
            key: self.key_def.extract_key(stmt),
        };
        if tx.try_send(request).is_err() {
            // The scheduler is gone or backlogged; the next threshold
            // crossing will ask again.
            warn!(generation = self.generation, "squash request dropped");
        } else {
            debug!(generation = self.generation, "squash requested");
        }
    }

    /// Finalizes the visibility of a previously inserted statement.
    ///
    /// Commit never fails: it advances `dump_lsn` and bumps the version so
    /// a reader parked on the committed read view re-seeks and observes
    /// the statement.
    pub fn commit(&self, stmt: &StmtRef) {
        let mut inner = self.write_inner();
        inner.dump_lsn = inner.dump_lsn.max(stmt.lsn());
        drop(inner);
        self.version.fetch_add(1, AtomicOrdering::AcqRel);
        trace!(generation = self.generation, lsn = stmt.lsn(), "statement committed");
    }

    /// Removes a previously inserted, not yet committed statement.
    ///
    /// Arena bytes are not reclaimed until the generation is freed.
    pub fn rollback(&self, stmt: &StmtRef) -> Result<(), MemError> {
        let mut inner = self.write_inner();
        if !inner.tree.remove(stmt) {
            return Err(MemError::Logic(format!(
                "rollback of a statement not present in generation {}: {stmt}",
                self.generation
            )));
        }
        inner.row_count -= 1;
        drop(inner);
        self.version.fetch_add(1, AtomicOrdering::AcqRel);
        trace!(generation = self.generation, lsn = stmt.lsn(), "statement rolled back");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// The next older statement with the same key, or `None`.
    pub fn older_lsn(&self, stmt: &StmtRef) -> Option<StmtRef> {
        let prev_lsn = stmt.lsn().checked_sub(1)?;
        let key = self.key_def.extract_key(stmt);
        let probe = self.key_def.probe_at(&key, prev_lsn);
        let candidate = self.with_tree(|tree| tree.first_at_or_after(&probe))?;
        self.key_def.same_key(&candidate, stmt).then_some(candidate)
    }

    /// Newest statement of the whole generation under the comparator.
    pub fn first(&self) -> Option<StmtRef> {
        self.with_tree(|tree| tree.first())
    }

    /// Last statement of the whole generation under the comparator.
    pub fn last(&self) -> Option<StmtRef> {
        self.with_tree(|tree| tree.last())
    }
}

impl Drop for Mem {
    fn drop(&mut self) {
        let bytes = self.read_inner().byte_count;
        self.arena.release(bytes);
    }
}
