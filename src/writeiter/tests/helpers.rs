//! Shared builders for the write iterator tests: create a generation with
//! the given content, merge it with the given read views and compare the
//! emitted statements with the expected ones.

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::keydef::{FieldType, KeyDef, KeyPart};
use crate::mem::{Mem, MemArena};
use crate::stmt::{Stmt, StmtRef, StmtType, TupleFormat, Value};
use crate::upsert::UpsertOp;
use crate::writeiter::{WriteIterError, WriteIterator};

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

pub fn key_def() -> Arc<KeyDef> {
    Arc::new(KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]))
}

pub fn format() -> TupleFormat {
    TupleFormat::new(1, 2)
}

pub fn replace(lsn: u64, key: u64, val: u64) -> StmtRef {
    Stmt::new_replace(vec![Value::Unsigned(key), Value::Unsigned(val)], lsn)
}

pub fn insert(lsn: u64, key: u64, val: u64) -> StmtRef {
    Stmt::new_insert(vec![Value::Unsigned(key), Value::Unsigned(val)], lsn)
}

pub fn delete(lsn: u64, key: u64) -> StmtRef {
    Stmt::new_delete(vec![Value::Unsigned(key)], lsn)
}

/// Upsert whose default tuple is `(key, val)` with a single `+1` on the
/// value column.
pub fn upsert(lsn: u64, key: u64, val: u64) -> StmtRef {
    Stmt::new_upsert(
        vec![Value::Unsigned(key), Value::Unsigned(val)],
        vec![UpsertOp::Add { field: 1, delta: 1 }],
        lsn,
    )
}

/// The upsert a band of `n` stacked [`upsert`]s squashes into: the
/// concatenated ops, the newest LSN, and the default tuple accumulated
/// from the oldest default plus every newer `+1`.
pub fn squashed_upsert(lsn: u64, key: u64, accumulated_val: u64, n: usize) -> StmtRef {
    Stmt::new_upsert(
        vec![Value::Unsigned(key), Value::Unsigned(accumulated_val)],
        vec![UpsertOp::Add { field: 1, delta: 1 }; n],
        lsn,
    )
}

/// Tags a statement as one half of an optimized secondary-index update.
pub fn opt(stmt: StmtRef, group: u64) -> StmtRef {
    stmt.with_opt_update_group(group)
}

/// Builds a sealed generation holding `content` (committed in order).
pub fn mem_from(content: &[StmtRef]) -> Arc<Mem> {
    let mem = Mem::new(Arc::new(MemArena::unbounded()), key_def(), format(), 1);
    for stmt in content {
        match stmt.ty() {
            StmtType::Upsert => mem.insert_upsert(stmt.clone()).unwrap(),
            _ => mem.insert(stmt.clone()).unwrap(),
        }
        mem.commit(stmt);
    }
    mem.seal().unwrap();
    Arc::new(mem)
}

/// Merges one generation and collects the output.
pub fn run(
    content: &[StmtRef],
    rvs: &[u64],
    is_primary: bool,
    is_last_level: bool,
) -> Vec<StmtRef> {
    let mut wi = WriteIterator::new(
        key_def(),
        format(),
        is_primary,
        is_last_level,
        rvs.to_vec(),
    );
    wi.add_mem(mem_from(content)).unwrap();
    collect(&mut wi).unwrap()
}

/// Starts the iterator and drains it.
pub fn collect(wi: &mut WriteIterator) -> Result<Vec<StmtRef>, WriteIterError> {
    wi.start()?;
    let mut out = Vec::new();
    while let Some(stmt) = wi.next()? {
        out.push(stmt);
    }
    wi.close();
    Ok(out)
}

/// Compares emitted statements with the expected ones, statement by
/// statement.
pub fn assert_stmts(actual: &[StmtRef], expected: &[StmtRef]) {
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(a, e, "statement {i}: got {a}, expected {e}");
    }
    assert_eq!(
        actual.len(),
        expected.len(),
        "wrong result count: got {}, expected {}",
        actual.len(),
        expected.len()
    );
}
