//! Integration tests for the storage core's public surface.
//!
//! These tests exercise the full core pipeline (generation → snapshot
//! iteration → write iterator → wire codec → next level) through the
//! public `tesseradb` API only. No internal modules are referenced.
//!
//! ## Coverage areas
//! - **Pipeline**: write, commit, seal, merge, encode, decode, re-merge
//! - **Visibility**: every live read view observes the same data before
//!   and after a projection, including randomized workloads
//! - **Multi-level**: merging a generation with an older encoded run
//! - **Determinism / idempotence**: the projection is a reproducible
//!   fixed point
//!
//! ## See also
//! - `mem::tests` — generation and iterator unit tests
//! - `writeiter::tests` — per-rule write iterator unit tests

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tesseradb::encoding::encode_to_vec;
use tesseradb::keydef::{FieldType, KeyDef, KeyPart, LSN_INF};
use tesseradb::mem::iterator::IterType;
use tesseradb::mem::{Mem, MemArena};
use tesseradb::readview::ReadViewRegistry;
use tesseradb::stmt::{Stmt, StmtRef, StmtType, TupleFormat, Value};
use tesseradb::upsert::{History, UpsertOp};
use tesseradb::writeiter::{DecodeSource, VecSource, WriteIterator};

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn key_def() -> Arc<KeyDef> {
    Arc::new(KeyDef::new(vec![KeyPart::new(0, FieldType::Unsigned)]))
}

fn format() -> TupleFormat {
    TupleFormat::new(1, 2)
}

fn new_mem(generation: u64) -> Mem {
    Mem::new(Arc::new(MemArena::unbounded()), key_def(), format(), generation)
}

fn replace(lsn: u64, key: u64, val: u64) -> StmtRef {
    Stmt::new_replace(vec![Value::Unsigned(key), Value::Unsigned(val)], lsn)
}

fn delete(lsn: u64, key: u64) -> StmtRef {
    Stmt::new_delete(vec![Value::Unsigned(key)], lsn)
}

fn upsert(lsn: u64, key: u64, val: u64, delta: i64) -> StmtRef {
    Stmt::new_upsert(
        vec![Value::Unsigned(key), Value::Unsigned(val)],
        vec![UpsertOp::Add { field: 1, delta }],
        lsn,
    )
}

fn commit_all(mem: &Mem, stmts: &[StmtRef]) {
    for stmt in stmts {
        match stmt.ty() {
            StmtType::Upsert => mem.insert_upsert(stmt.clone()).unwrap(),
            _ => mem.insert(stmt.clone()).unwrap(),
        }
        mem.commit(stmt);
    }
}

fn drain(wi: &mut WriteIterator) -> Vec<StmtRef> {
    wi.start().unwrap();
    let mut out = Vec::new();
    while let Some(stmt) = wi.next().unwrap() {
        out.push(stmt);
    }
    wi.close();
    out
}

fn encode_run(stmts: &[StmtRef]) -> Vec<u8> {
    let mut buf = Vec::new();
    for stmt in stmts {
        buf.extend(encode_to_vec(stmt.as_ref()).unwrap());
    }
    buf
}

/// Model read: resolve what a reader pinned at `vlsn` observes for `key`
/// in an arbitrary statement set.
fn resolve(
    def: &KeyDef,
    stmts: &[StmtRef],
    key: u64,
    vlsn: u64,
) -> Option<Vec<Value>> {
    let probe = Stmt::new_select_key(vec![Value::Unsigned(key)], LSN_INF);
    let mut versions: Vec<&StmtRef> = stmts
        .iter()
        .filter(|s| def.same_key(s, &probe) && s.lsn() <= vlsn && !s.skip_read())
        .collect();
    versions.sort_by(|a, b| def.compare_stmts(a, b));
    let mut history = History::new();
    for stmt in versions {
        history.push((*stmt).clone());
        if history.is_terminal() {
            break;
        }
    }
    history
        .apply(def, false)
        .map(|stmt| stmt.tuple().to_vec())
}

// ================================================================================================
// Pipeline
// ================================================================================================

#[test]
fn test_full_pipeline_generation_to_next_level() {
    let def = key_def();
    let mem = Arc::new(new_mem(1));
    let content = vec![
        replace(10, 1, 1),
        replace(20, 1, 2),
        delete(30, 2),
        replace(5, 2, 7),
        upsert(40, 3, 1, 1),
    ];
    commit_all(&mem, &content);

    // A reader opened before the merge pins its view.
    let registry = ReadViewRegistry::new();
    registry.advance_committed(10);
    let pinned = registry.open(None);
    assert_eq!(pinned.vlsn(), 10);

    mem.seal().unwrap();
    let mut wi = WriteIterator::new(
        Arc::clone(&def),
        format(),
        true,
        false,
        registry.snapshot(),
    );
    wi.add_mem(Arc::clone(&mem)).unwrap();
    let level1 = drain(&mut wi);

    // Both the pinned view and the current state read identically before
    // and after the projection.
    for vlsn in [10, LSN_INF] {
        for key in 1..=3 {
            assert_eq!(
                resolve(&def, &content, key, vlsn),
                resolve(&def, &level1, key, vlsn),
                "key {key} at vlsn {vlsn}"
            );
        }
    }

    // Ship the level through the wire codec and merge it again at the
    // bottom of the tree with the reader gone.
    registry.close(pinned);
    let buf = encode_run(&level1);
    let mut wi = WriteIterator::new(
        Arc::clone(&def),
        format(),
        true,
        true,
        registry.snapshot(),
    );
    wi.add_source(Box::new(DecodeSource::new(buf))).unwrap();
    let bottom = drain(&mut wi);

    // Key 1 keeps its newest version, the deleted key 2 vanishes, the
    // upsert on key 3 materializes.
    assert_eq!(resolve(&def, &bottom, 1, LSN_INF), Some(vec![
        Value::Unsigned(1),
        Value::Unsigned(2)
    ]));
    assert_eq!(resolve(&def, &bottom, 2, LSN_INF), None);
    assert_eq!(resolve(&def, &bottom, 3, LSN_INF), Some(vec![
        Value::Unsigned(3),
        Value::Unsigned(1)
    ]));
    assert!(bottom.iter().all(|s| s.ty() != StmtType::Delete));
    assert!(bottom.iter().all(|s| s.ty() != StmtType::Upsert));
}

#[test]
fn test_merge_generation_with_older_run() {
    let def = key_def();
    // The older run holds the original rows.
    let older = vec![replace(10, 1, 1), replace(11, 2, 2), replace(12, 3, 3)];
    // The newer generation overwrites key 1 and deletes key 2.
    let mem = Arc::new(new_mem(2));
    commit_all(&mem, &[replace(20, 1, 100), delete(21, 2)]);
    mem.seal().unwrap();

    let mut wi = WriteIterator::new(Arc::clone(&def), format(), true, true, Vec::new());
    wi.add_mem(Arc::clone(&mem)).unwrap();
    wi.add_source(Box::new(VecSource::new(Arc::clone(&def), older)))
        .unwrap();
    let merged = drain(&mut wi);

    assert_eq!(merged.len(), 2);
    assert_eq!(resolve(&def, &merged, 1, LSN_INF), Some(vec![
        Value::Unsigned(1),
        Value::Unsigned(100)
    ]));
    assert_eq!(resolve(&def, &merged, 2, LSN_INF), None);
    assert_eq!(resolve(&def, &merged, 3, LSN_INF), Some(vec![
        Value::Unsigned(3),
        Value::Unsigned(3)
    ]));
}

#[test]
fn test_snapshot_reader_is_stable_across_writes() {
    let mem = new_mem(1);
    let v1 = replace(10, 1, 1);
    mem.insert(v1.clone()).unwrap();
    mem.commit(&v1);

    let registry = ReadViewRegistry::new();
    registry.advance_committed(10);
    let rv = registry.open(None);

    let mut iter = mem.open_iter(IterType::Ge, vec![], &rv).unwrap();
    let seen = iter.next_key().unwrap();
    assert_eq!(seen.lsn(), 10);

    // A newer commit lands while the reader is parked.
    let v2 = replace(20, 1, 2);
    mem.insert(v2.clone()).unwrap();
    mem.commit(&v2);
    registry.advance_committed(20);

    // After restoring, the parked reader still sees only its snapshot.
    iter.restore(None);
    let seen = iter.next_key().unwrap();
    assert_eq!(seen.lsn(), 10);

    // A fresh reader at the new watermark sees the new version.
    let rv2 = registry.open(None);
    let mut iter2 = mem.open_iter(IterType::Ge, vec![], &rv2).unwrap();
    assert_eq!(iter2.next_key().unwrap().lsn(), 20);
}

// ================================================================================================
// Randomized visibility property
// ================================================================================================

#[test]
fn test_projection_preserves_every_read_view() {
    let def = key_def();
    let mut rng = StdRng::seed_from_u64(0x7e55e7a);

    for round in 0..20u64 {
        let mem = Arc::new(new_mem(round));
        let mut content: Vec<StmtRef> = Vec::new();
        for lsn in 1..=120u64 {
            let key = rng.random_range(0..8u64);
            let stmt = match rng.random_range(0..10u32) {
                0..=4 => replace(lsn, key, lsn),
                5 | 6 => delete(lsn, key),
                _ => upsert(lsn, key, lsn, 1),
            };
            content.push(stmt);
        }
        commit_all(&mem, &content);
        mem.seal().unwrap();

        let rvs: Vec<u64> = vec![
            rng.random_range(1..40),
            rng.random_range(40..80),
            rng.random_range(80..120),
        ];
        let mut wi =
            WriteIterator::new(Arc::clone(&def), format(), true, false, rvs.clone());
        wi.add_mem(Arc::clone(&mem)).unwrap();
        let output = drain(&mut wi);

        // Output is strictly sorted under the comparator.
        for pair in output.windows(2) {
            assert_eq!(
                def.compare_stmts(&pair[0], &pair[1]),
                std::cmp::Ordering::Less,
                "round {round}: output not strictly sorted"
            );
        }

        // Every live read view, and the current state, reads the same.
        for &vlsn in rvs.iter().chain([LSN_INF].iter()) {
            for key in 0..8u64 {
                assert_eq!(
                    resolve(&def, &content, key, vlsn),
                    resolve(&def, &output, key, vlsn),
                    "round {round}: key {key} diverged at vlsn {vlsn} (rvs {rvs:?})"
                );
            }
        }
    }
}

#[test]
fn test_projection_is_deterministic_and_idempotent() {
    let def = key_def();
    let content = vec![
        replace(5, 1, 1),
        delete(6, 1),
        upsert(7, 1, 2, 1),
        replace(8, 1, 3),
        replace(9, 2, 4),
        delete(11, 2),
        upsert(12, 3, 9, 1),
    ];
    let rvs = vec![6, 9];

    let run = || {
        let mem = Arc::new(new_mem(1));
        commit_all(&mem, &content);
        mem.seal().unwrap();
        let mut wi =
            WriteIterator::new(Arc::clone(&def), format(), true, false, rvs.clone());
        wi.add_mem(mem).unwrap();
        drain(&mut wi)
    };

    let first = run();
    let second = run();
    assert_eq!(encode_run(&first), encode_run(&second));

    // Re-projecting the output is a fixed point.
    let mut wi = WriteIterator::new(Arc::clone(&def), format(), true, false, rvs.clone());
    wi.add_source(Box::new(VecSource::new(Arc::clone(&def), first.clone())))
        .unwrap();
    let again = drain(&mut wi);
    assert_eq!(encode_run(&first), encode_run(&again));
}

// ================================================================================================
// Codec interop
// ================================================================================================

#[test]
fn test_encoded_run_reads_back_identically() {
    let def = key_def();
    let mem = Arc::new(new_mem(1));
    let content = vec![
        replace(10, 1, 1),
        delete(11, 2),
        upsert(12, 3, 5, 2),
    ];
    commit_all(&mem, &content);
    mem.seal().unwrap();

    let mut wi = WriteIterator::new(Arc::clone(&def), format(), true, false, Vec::new());
    wi.add_mem(mem).unwrap();
    let output = drain(&mut wi);

    let buf = encode_run(&output);
    let mut wi = WriteIterator::new(Arc::clone(&def), format(), true, false, Vec::new());
    wi.add_source(Box::new(DecodeSource::new(buf))).unwrap();
    let decoded = drain(&mut wi);

    assert_eq!(encode_run(&output), encode_run(&decoded));
}
