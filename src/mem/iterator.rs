//! Snapshot-aware iteration over one generation.
//!
//! A [`MemIterator`] yields the statements visible in one read view, in
//! either direction, without ever holding the generation's lock across a
//! yield: every step re-probes the tree by key, so concurrent insertion
//! can move positions but never corrupt the cursor. [`restore`] is the
//! explicit re-synchronization point after the generation's version
//! counter moved.
//!
//! [`restore`]: MemIterator::restore

use std::sync::Arc;

use tracing::trace;

use crate::mem::{Mem, MemError, MemState};
use crate::readview::ReadViewHandle;
use crate::stmt::{StmtRef, Value};
use crate::upsert::History;

// ------------------------------------------------------------------------------------------------
// Iterator type
// ------------------------------------------------------------------------------------------------

/// Range shape of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterType {
    /// Full forward scan.
    All,
    /// Keys greater than or equal to the search key.
    Ge,
    /// Keys strictly greater. An empty key behaves like [`IterType::Ge`].
    Gt,
    /// Keys less than or equal, reverse order.
    Le,
    /// Keys strictly less, reverse order. An empty key behaves like
    /// [`IterType::Le`].
    Lt,
    /// Exactly the search key.
    Eq,
    /// Exactly the search key, versions walked in reverse entry order.
    Req,
}

impl IterType {
    /// Reverse iterations walk toward smaller keys.
    pub fn is_reverse(self) -> bool {
        matches!(self, IterType::Le | IterType::Lt | IterType::Req)
    }

    fn is_exact(self) -> bool {
        matches!(self, IterType::Eq | IterType::Req)
    }
}

/// Result of [`MemIterator::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The generation did not change; the position is still valid.
    Continue,
    /// The position was rebuilt; the next `next_key` call yields the
    /// statement following the restore anchor.
    Restarted,
}

// ------------------------------------------------------------------------------------------------
// Iterator
// ------------------------------------------------------------------------------------------------

/// Forward or reverse range scan over one generation, honoring a read
/// view.
///
/// The iterator owns nothing but its position; closing it is synchronous
/// and allocation-free.
pub struct MemIterator<'a> {
    mem: &'a Mem,
    ty: IterType,
    key: Vec<Value>,
    rv: &'a ReadViewHandle,
    version: u64,
    search_started: bool,
    curr: Option<StmtRef>,
    cache_pinning: bool,
}

impl<'a> std::fmt::Debug for MemIterator<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemIterator")
            .field("ty", &self.ty)
            .field("key", &self.key)
            .field("version", &self.version)
            .field("search_started", &self.search_started)
            .field("cache_pinning", &self.cache_pinning)
            .finish()
    }
}

impl Mem {
    /// Opens an iterator over this generation.
    ///
    /// Exact lookups (`Eq`/`Req`) on a unique key definition require the
    /// full key arity; prefix keys are fine everywhere else.
    pub fn open_iter<'a>(
        &'a self,
        ty: IterType,
        key: Vec<Value>,
        rv: &'a ReadViewHandle,
    ) -> Result<MemIterator<'a>, MemError> {
        self.key_def().validate_search_key(&key, ty.is_exact())?;
        Ok(MemIterator {
            mem: self,
            ty,
            key,
            rv,
            version: 0,
            search_started: false,
            curr: None,
            cache_pinning: self.cache_pinning(),
        })
    }
}

impl<'a> MemIterator<'a> {
    /// The statement the iterator is positioned at.
    pub fn curr(&self) -> Option<&StmtRef> {
        self.curr.as_ref()
    }

    /// Whether yielded statements should be offered to the external
    /// cache. Pass-through only; the core does not cache.
    pub fn cache_pinning(&self) -> bool {
        self.cache_pinning
    }

    pub fn set_cache_pinning(&mut self, pin: bool) {
        self.cache_pinning = pin;
    }

    /// Advances to the newest visible version of the next key in the
    /// iteration direction. The first call positions the iterator.
    pub fn next_key(&mut self) -> Option<StmtRef> {
        if !self.search_started {
            self.seek(None);
            return self.curr.clone();
        }
        let curr = self.curr.clone()?;
        let curr_key = self.mem.key_def().extract_key(&curr);
        let candidate = self.step_to_next_key(&curr_key);
        self.curr = candidate;
        self.check_exact();
        self.find_lsn();
        self.curr.clone()
    }

    /// Steps down the LSN chain of the current key to the next older
    /// version, honoring the read view.
    pub fn next_lsn(&mut self) -> Option<StmtRef> {
        let mut curr = self.curr.clone()?;
        loop {
            let next = self
                .mem
                .with_tree(|tree| tree.first_after(&curr))?;
            if !self.mem.key_def().same_key(&next, &curr) {
                return None;
            }
            curr = next;
            if curr.skip_read() {
                continue;
            }
            self.curr = Some(curr.clone());
            return Some(curr);
        }
    }

    /// Positions the iterator after `last` unless it is already past it.
    ///
    /// Returns the current statement. Used by read paths that fast-forward
    /// a lagging source.
    pub fn skip(&mut self, last: Option<&StmtRef>) -> Option<StmtRef> {
        if self.search_started {
            let already_past = match (&self.curr, last) {
                (None, _) | (_, None) => true,
                (Some(curr), Some(last)) => {
                    let ord = self.mem.key_def().compare_stmts(curr, last);
                    if self.ty.is_reverse() {
                        ord == std::cmp::Ordering::Less
                    } else {
                        ord == std::cmp::Ordering::Greater
                    }
                }
            };
            if already_past {
                return self.curr.clone();
            }
        }
        self.seek(last);
        self.curr.clone()
    }

    /// Re-synchronizes after a generation mutation.
    ///
    /// When the version moved, the iterator is re-anchored so that the
    /// next `next_key` yields exactly the statement that follows `last`
    /// in the iteration direction, as if the mutations had happened
    /// before the iterator was opened.
    pub fn restore(&mut self, last: Option<&StmtRef>) -> RestoreOutcome {
        if !self.search_started || self.version == self.mem.version() {
            return RestoreOutcome::Continue;
        }
        trace!(
            generation = self.mem.generation(),
            old = self.version,
            new = self.mem.version(),
            "iterator restored across mutation"
        );
        self.version = self.mem.version();
        match last {
            Some(last) => self.curr = Some(last.clone()),
            None => {
                self.search_started = false;
                self.curr = None;
            }
        }
        RestoreOutcome::Restarted
    }

    /// Collects the version chain of the current key, newest first, up to
    /// and including the first terminal statement.
    pub fn history(&mut self) -> History {
        let mut history = History::new();
        let Some(curr) = self.curr.clone() else {
            return history;
        };
        history.push(curr);
        while !history.is_terminal() {
            match self.next_lsn() {
                Some(older) => history.push(older),
                None => break,
            }
        }
        history
    }

    /// Closing is synchronous and allocation-free: the iterator owns no
    /// resources beyond its position.
    pub fn close(self) {}

    // --------------------------------------------------------------------------------------------
    // Positioning
    // --------------------------------------------------------------------------------------------

    /// Positions at the first statement satisfying the search criteria
    /// and following `last` (`None` starts the iteration).
    fn seek(&mut self, last: Option<&StmtRef>) {
        self.search_started = true;
        self.version = self.mem.version();
        self.curr = None;

        let key_def = Arc::clone(self.mem.key_def());
        match last {
            Some(last) => {
                let last_key = key_def.extract_key(last);
                self.curr = self.step_to_next_key(&last_key);
            }
            None if self.key.is_empty() => {
                self.curr = self.mem.with_tree(|tree| {
                    if self.ty.is_reverse() {
                        tree.last()
                    } else {
                        tree.first()
                    }
                });
            }
            None => {
                self.curr = self.mem.with_tree(|tree| match self.ty {
                    IterType::All | IterType::Ge | IterType::Eq => {
                        tree.first_at_or_after(&key_def.probe_before(&self.key))
                    }
                    IterType::Gt => tree.first_at_or_after(&key_def.probe_after(&self.key)),
                    IterType::Le | IterType::Req => {
                        tree.last_before(&key_def.probe_after(&self.key))
                    }
                    IterType::Lt => tree.last_before(&key_def.probe_before(&self.key)),
                });
            }
        }
        self.check_exact();
        self.find_lsn();
    }

    /// First statement of the next key group in the iteration direction.
    fn step_to_next_key(&self, from_key: &[Value]) -> Option<StmtRef> {
        let key_def = self.mem.key_def();
        self.mem.with_tree(|tree| {
            if self.ty.is_reverse() {
                tree.last_before(&key_def.probe_before(from_key))
            } else {
                tree.first_at_or_after(&key_def.probe_after(from_key))
            }
        })
    }

    /// One tree step in the iteration direction.
    fn step(&self, from: &StmtRef) -> Option<StmtRef> {
        self.mem.with_tree(|tree| {
            if self.ty.is_reverse() {
                tree.last_before(from)
            } else {
                tree.first_after(from)
            }
        })
    }

    /// Exhausts an exact-match iterator positioned on a foreign key.
    fn check_exact(&mut self) {
        if !self.ty.is_exact() {
            return;
        }
        if let Some(curr) = &self.curr {
            let probe = self.mem.key_def().probe_before(&self.key);
            if !self.mem.key_def().same_key(curr, &probe) {
                self.curr = None;
            }
        }
    }

    /// Skips to the first statement visible in the read view.
    ///
    /// For reverse iteration the tree's LSN-descending order means the
    /// first visible statement met is the **lowest** visible LSN, so the
    /// iterator hops to the highest visible version of the key with one
    /// bound probe instead of walking the chain linearly.
    fn find_lsn(&mut self) {
        let vlsn = self.rv.vlsn();
        let key_def = Arc::clone(self.mem.key_def());
        loop {
            let Some(curr) = self.curr.clone() else { return };
            if curr.lsn() <= vlsn && !curr.skip_read() {
                break;
            }
            let next = self.step(&curr);
            match next {
                None => {
                    self.curr = None;
                    return;
                }
                Some(next) => {
                    if self.ty.is_exact() {
                        // Walked off the probe key: nothing visible.
                        let probe = key_def.probe_before(&self.key);
                        if !key_def.same_key(&next, &probe) {
                            self.curr = None;
                            return;
                        }
                    }
                    self.curr = Some(next);
                }
            }
        }

        if !self.ty.is_reverse() {
            return;
        }

        // Hop to the highest LSN still visible for this key. The current
        // statement is in the probed range, so the hop stays on the key.
        let Some(curr) = self.curr.clone() else { return };
        let key = key_def.extract_key(&curr);
        let probe = key_def.probe_at(&key, vlsn);
        if let Some(hopped) = self.mem.with_tree(|tree| tree.first_at_or_after(&probe)) {
            debug_assert!(key_def.same_key(&hopped, &curr));
            self.curr = Some(hopped);
        }

        // The hop may land on a bookkeeping statement; walk down to the
        // first readable one. The statement found above bounds the walk.
        while let Some(curr) = self.curr.clone() {
            if !curr.skip_read() {
                break;
            }
            let older = self.mem.with_tree(|tree| tree.first_after(&curr));
            match older {
                Some(older) if key_def.same_key(&older, &curr) => self.curr = Some(older),
                _ => {
                    self.curr = None;
                    return;
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Drain stream
// ------------------------------------------------------------------------------------------------

/// Full-order drain over a sealed generation: every statement, every
/// version, in comparator order. This is the shape the write iterator
/// consumes.
pub struct MemStream {
    mem: Arc<Mem>,
    last: Option<StmtRef>,
}

impl Mem {
    /// Opens a drain stream. The generation must no longer be active.
    pub fn stream(self: Arc<Self>) -> Result<MemStream, MemError> {
        if self.state() == MemState::Active {
            return Err(MemError::Logic(format!(
                "drain stream on active generation {}",
                self.generation()
            )));
        }
        Ok(MemStream {
            mem: self,
            last: None,
        })
    }
}

impl MemStream {
    /// The generation being drained.
    pub fn mem(&self) -> &Arc<Mem> {
        &self.mem
    }

    /// Next statement in comparator order, or `None` at the end.
    pub fn next(&mut self) -> Option<StmtRef> {
        let next = match &self.last {
            None => self.mem.with_tree(|tree| tree.first()),
            Some(last) => self.mem.with_tree(|tree| tree.first_after(last)),
        };
        self.last = next.clone();
        next
    }
}
