//! Shared builders for the generation tests.

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

use crate::keydef::{FieldType, KeyDef, KeyPart};
use crate::mem::{Mem, MemArena};
use crate::stmt::{Stmt, StmtRef, TupleFormat, Value};
use crate::upsert::UpsertOp;

pub fn init_tracing() {
    let _ = Subscriber::builder()
        .with_max_level(Level::TRACE)
        .try_init();
}

/// Unique key on field 0 (unsigned).
pub fn key_def() -> Arc<KeyDef> {
    Arc::new(KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]))
}

/// Two-field tuples: key + one value column.
pub fn format() -> TupleFormat {
    TupleFormat::new(7, 2)
}

pub fn test_mem() -> Mem {
    Mem::new(Arc::new(MemArena::unbounded()), key_def(), format(), 1)
}

pub fn replace(lsn: u64, key: u64, val: u64) -> StmtRef {
    Stmt::new_replace(vec![Value::Unsigned(key), Value::Unsigned(val)], lsn)
}

/// Upsert with a default tuple `(key, val)` and a single `+delta` on the
/// value column.
pub fn upsert(lsn: u64, key: u64, val: u64, delta: i64) -> StmtRef {
    Stmt::new_upsert(
        vec![Value::Unsigned(key), Value::Unsigned(val)],
        vec![UpsertOp::Add { field: 1, delta }],
        lsn,
    )
}

pub fn key(k: u64) -> Vec<Value> {
    vec![Value::Unsigned(k)]
}
