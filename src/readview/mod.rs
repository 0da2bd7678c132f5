//! # Read-View Registry
//!
//! A read view pins a snapshot LSN (`vlsn`): a statement with
//! `lsn <= vlsn` is visible in that view unless marked skip-read. The
//! registry tracks every vlsn some reader still needs, so the write
//! iterator knows which versions must survive compaction.
//!
//! ## Design Invariants
//!
//! - The registry is monotone only in aggregate: individual handles may
//!   close in any order, so consumers always take a fresh [`snapshot`].
//! - The committed watermark advances monotonically and never exceeds the
//!   newest notified commit.
//! - Mutation happens under one short mutex; `snapshot` copies out.
//!
//! [`snapshot`]: ReadViewRegistry::snapshot

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::keydef::LSN_INF;

// ------------------------------------------------------------------------------------------------
// Registry
// ------------------------------------------------------------------------------------------------

struct RegistryInner {
    /// vlsn -> number of open handles pinned at it.
    readers: BTreeMap<u64, usize>,
    /// Oldest LSN observable by cache consumers; advances on commit
    /// notifications.
    committed_vlsn: u64,
}

/// The ordered set of snapshot LSNs currently needed by readers.
#[derive(Clone)]
pub struct ReadViewRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for ReadViewRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadViewRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                readers: BTreeMap::new(),
                committed_vlsn: 0,
            })),
        }
    }

    /// Registers a new read view.
    ///
    /// With `vlsn = None` the view pins at the current commit watermark.
    /// The returned handle unregisters itself when closed or dropped.
    pub fn open(&self, vlsn: Option<u64>) -> ReadViewHandle {
        let mut inner = self.inner.lock().expect("read view registry poisoned");
        let vlsn = vlsn.unwrap_or(inner.committed_vlsn);
        *inner.readers.entry(vlsn).or_default() += 1;
        trace!(vlsn, "read view opened");
        ReadViewHandle {
            vlsn,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Unregisters a read view.
    ///
    /// Dropping the handle has the same effect; the explicit form exists
    /// for callers that want the close to be visible in the code.
    pub fn close(&self, handle: ReadViewHandle) {
        drop(handle);
    }

    /// The set of pinned vlsns, ascending and deduplicated, taken
    /// atomically. The write iterator consults this afresh for every
    /// compaction.
    pub fn snapshot(&self) -> Vec<u64> {
        let inner = self.inner.lock().expect("read view registry poisoned");
        inner.readers.keys().copied().collect()
    }

    /// Number of distinct pinned vlsns.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("read view registry poisoned");
        inner.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The oldest vlsn observable to cache consumers.
    pub fn committed_vlsn(&self) -> u64 {
        let inner = self.inner.lock().expect("read view registry poisoned");
        inner.committed_vlsn
    }

    /// Advances the commit watermark. Stale notifications (an LSN at or
    /// below the watermark) are ignored, keeping the advance monotone.
    pub fn advance_committed(&self, lsn: u64) {
        let mut inner = self.inner.lock().expect("read view registry poisoned");
        if lsn > inner.committed_vlsn {
            inner.committed_vlsn = lsn;
        }
    }

    /// The oldest vlsn still pinned by some reader, or `None` when no
    /// reader is active (everything before the watermark is collectable).
    pub fn oldest_pinned(&self) -> Option<u64> {
        let inner = self.inner.lock().expect("read view registry poisoned");
        inner.readers.first_key_value().map(|(vlsn, _)| *vlsn)
    }
}

// ------------------------------------------------------------------------------------------------
// Handle
// ------------------------------------------------------------------------------------------------

/// An open read view.
///
/// Iterators borrow the handle for their lifetime; the snapshot LSN is
/// fixed at open time.
pub struct ReadViewHandle {
    vlsn: u64,
    inner: Arc<Mutex<RegistryInner>>,
}

impl ReadViewHandle {
    /// The snapshot LSN this view is pinned at.
    pub fn vlsn(&self) -> u64 {
        self.vlsn
    }

    /// A detached view that sees everything, for scans that bypass the
    /// registry (tests, draining).
    pub fn all_visible() -> ReadViewHandle {
        ReadViewHandle {
            vlsn: LSN_INF,
            inner: Arc::new(Mutex::new(RegistryInner {
                readers: BTreeMap::new(),
                committed_vlsn: 0,
            })),
        }
    }

    /// A detached view pinned at an arbitrary vlsn, for tests and internal
    /// probes. Detached views are invisible to the registry.
    pub fn detached(vlsn: u64) -> ReadViewHandle {
        ReadViewHandle {
            vlsn,
            inner: Arc::new(Mutex::new(RegistryInner {
                readers: BTreeMap::new(),
                committed_vlsn: 0,
            })),
        }
    }
}

impl Drop for ReadViewHandle {
    fn drop(&mut self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(count) = inner.readers.get_mut(&self.vlsn) {
            *count -= 1;
            if *count == 0 {
                inner.readers.remove(&self.vlsn);
            }
            trace!(vlsn = self.vlsn, "read view closed");
        }
    }
}
