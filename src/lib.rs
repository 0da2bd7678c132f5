//! # tesseradb
//!
//! The in-memory and compaction core of a **log-structured, MVCC** tuple
//! storage engine: versioned statements are absorbed by an in-memory
//! generation, read through snapshot-aware iterators, and projected to
//! the next LSM level by a read-view-aware write iterator.
//!
//! ## Architecture
//!
//! ```text
//! committers ──► ┌───────────────┐        ┌──────────────────────┐
//!                │  Mem (active) │        │  ReadViewRegistry    │
//!                │  tree + arena │◄─────  │  pinned snapshot     │
//! readers   ──► │  + iterators  │  rv    │  LSNs                │
//!                └──────┬────────┘        └──────────┬───────────┘
//!                       │ seal                       │ snapshot()
//!                       ▼                            ▼
//!                ┌───────────────┐        ┌──────────────────────┐
//!                │ Mem (sealed)  │─────►  │   WriteIterator      │──► run writer
//!                │   draining    │ source │  band projection     │    (next level)
//!                └───────────────┘        └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`stmt`] | Versioned statements: types, flags, tuple values |
//! | [`keydef`] | The total order: key ascending, LSN descending |
//! | [`mem`] | In-memory generation — ordered tree, arena accounting, snapshot iterators |
//! | [`upsert`] | Additive updates: apply, squash, key-history resolution |
//! | [`readview`] | Registry of snapshot LSNs pinned by readers |
//! | [`writeiter`] | Compaction merge projecting sources for all live read views |
//! | [`encoding`] | Deterministic statement wire codec |
//! | [`config`] | Core configuration knobs |
//!
//! ## Key Features
//!
//! - **Multi-version concurrency** — any number of versions per key,
//!   ordered by LSN; a reader pinned at a snapshot LSN observes exactly
//!   the commits at or below it.
//! - **Lock-free-readable generations** — readers never hold the writer's
//!   lock across yields; mutations are detected through a monotone
//!   version counter and recovered by key re-probing.
//! - **Additive upserts** — squashable operation chains with a saturating
//!   counter that requests background materialization exactly once.
//! - **Read-view-preserving compaction** — the write iterator emits the
//!   minimal statement stream that keeps every live snapshot's view
//!   byte-for-byte intact, eliding dominated versions, dangling deletes
//!   and secondary-index no-op updates.
//! - **Deterministic wire codec** — self-describing statement records
//!   with strict, allocation-bounded decoding.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tesseradb::keydef::{FieldType, KeyDef, KeyPart};
//! use tesseradb::mem::iterator::IterType;
//! use tesseradb::mem::{Mem, MemArena};
//! use tesseradb::readview::ReadViewRegistry;
//! use tesseradb::stmt::{Stmt, TupleFormat, Value};
//! use tesseradb::writeiter::WriteIterator;
//!
//! let key_def = Arc::new(KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]));
//! let format = TupleFormat::new(1, 2);
//! let arena = Arc::new(MemArena::unbounded());
//! let mem = Arc::new(Mem::new(arena, Arc::clone(&key_def), format, 1));
//!
//! // Two committed versions of one row.
//! let v1 = Stmt::new_replace(vec![Value::Unsigned(1), Value::Str("a".into())], 10);
//! mem.insert(v1.clone()).unwrap();
//! mem.commit(&v1);
//! let v2 = Stmt::new_replace(vec![Value::Unsigned(1), Value::Str("b".into())], 20);
//! mem.insert(v2.clone()).unwrap();
//! mem.commit(&v2);
//!
//! // A reader pinned before the second commit sees the first version.
//! let registry = ReadViewRegistry::new();
//! registry.advance_committed(10);
//! let rv = registry.open(None);
//! let mut iter = mem.open_iter(IterType::Ge, vec![], &rv).unwrap();
//! assert_eq!(iter.next_key().unwrap().lsn(), 10);
//! drop(iter);
//! drop(rv);
//!
//! // Seal and compact: with no readers left, only the newest version
//! // survives.
//! mem.seal().unwrap();
//! let mut wi = WriteIterator::new(key_def, format, true, true, registry.snapshot());
//! wi.add_mem(Arc::clone(&mem)).unwrap();
//! wi.start().unwrap();
//! assert_eq!(wi.next().unwrap().unwrap().lsn(), 20);
//! assert!(wi.next().unwrap().is_none());
//! wi.close();
//! ```

pub mod config;
pub mod encoding;
pub mod keydef;
pub mod mem;
pub mod readview;
pub mod stmt;
pub mod upsert;
pub mod writeiter;
