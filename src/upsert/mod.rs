//! # Upsert Engine
//!
//! UPSERT is an additive statement: an ordered list of operations plus a
//! default tuple. Resolution is deferred — against a terminal base when
//! one exists, to the default tuple when the key has no history.
//!
//! ## Design Invariants
//!
//! - Applying an upsert **never fails**: an operation that would violate a
//!   field type (or touch an indexed field) is discarded alone and the
//!   rest of the list still applies.
//! - Operations of distinct upserts compose by ordered application,
//!   oldest first.
//! - Squashing two upserts concatenates the operation lists oldest-first,
//!   takes the **newer** LSN, and folds the newer operations into the
//!   older default tuple — so the squashed statement resolves exactly
//!   like the original pair against any base, present or absent.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use tracing::debug;

use crate::keydef::KeyDef;
use crate::stmt::{Stmt, StmtRef, StmtType, Tuple, Value};

// ------------------------------------------------------------------------------------------------
// Operations
// ------------------------------------------------------------------------------------------------

/// A single additive operation inside an UPSERT.
///
/// Operations address tuple fields by position and are serialized only at
/// the codec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOp {
    /// Add a signed delta to a numeric field.
    Add { field: u32, delta: i64 },
    /// Overwrite a field with a value.
    Assign { field: u32, value: Value },
    /// Set a field only if it is currently null (or one past the end).
    SetIfAbsent { field: u32, value: Value },
    /// Replace `cut` bytes at `offset` of a string or byte field with
    /// `paste`.
    Splice {
        field: u32,
        offset: u32,
        cut: u32,
        paste: Vec<u8>,
    },
}

impl UpsertOp {
    /// Field addressed by the operation.
    pub fn field(&self) -> u32 {
        match self {
            UpsertOp::Add { field, .. }
            | UpsertOp::Assign { field, .. }
            | UpsertOp::SetIfAbsent { field, .. }
            | UpsertOp::Splice { field, .. } => *field,
        }
    }

    /// Approximate heap footprint in bytes.
    pub fn size(&self) -> usize {
        let inline = std::mem::size_of::<UpsertOp>();
        match self {
            UpsertOp::Assign { value, .. } | UpsertOp::SetIfAbsent { value, .. } => {
                inline + value.size()
            }
            UpsertOp::Splice { paste, .. } => inline + paste.len(),
            UpsertOp::Add { .. } => inline,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Single application
// ------------------------------------------------------------------------------------------------

/// Applies one upsert over an optional terminal base.
///
/// - Terminal `Replace`/`Insert` base: operations apply in order, the
///   result is a `Replace` carrying the upsert's LSN.
/// - `Delete` base: the key holds nothing, so the default tuple wins —
///   unless `keep_delete` is set, in which case the delete itself is the
///   result.
/// - Absent base: the default tuple wins.
pub fn apply_upsert(
    upsert: &Stmt,
    base: Option<&StmtRef>,
    key_def: &KeyDef,
    keep_delete: bool,
) -> StmtRef {
    debug_assert_eq!(upsert.ty(), StmtType::Upsert);
    match base {
        None => upsert.replace_from_upsert(),
        Some(base) if base.ty() == StmtType::Delete => {
            if keep_delete {
                base.clone()
            } else {
                upsert.replace_from_upsert()
            }
        }
        Some(base) => {
            debug_assert!(base.is_terminal());
            let mut tuple: Tuple = base.tuple().to_vec();
            for op in upsert.ops() {
                if key_def.indexes_field(op.field()) {
                    debug!(field = op.field(), "upsert op touches an indexed field, discarded");
                    continue;
                }
                if let Err(reason) = apply_op(&mut tuple, op) {
                    debug!(field = op.field(), reason, "upsert op discarded");
                }
            }
            Stmt::new_replace(tuple, upsert.lsn())
        }
    }
}

/// Applies one operation in place. An `Err` means the operation is
/// discarded; the tuple is left untouched in that case.
fn apply_op(tuple: &mut Tuple, op: &UpsertOp) -> Result<(), &'static str> {
    let field = op.field() as usize;
    match op {
        UpsertOp::Add { delta, .. } => {
            let slot = tuple.get_mut(field).ok_or("field out of range")?;
            match slot {
                Value::Unsigned(v) => {
                    let next = if *delta >= 0 {
                        v.checked_add(*delta as u64)
                    } else {
                        v.checked_sub(delta.unsigned_abs())
                    };
                    *v = next.ok_or("unsigned overflow")?;
                }
                Value::Integer(v) => {
                    *v = v.checked_add(*delta).ok_or("integer overflow")?;
                }
                _ => return Err("arithmetic on non-numeric field"),
            }
            Ok(())
        }
        UpsertOp::Assign { value, .. } => {
            let slot = tuple.get_mut(field).ok_or("field out of range")?;
            *slot = value.clone();
            Ok(())
        }
        UpsertOp::SetIfAbsent { value, .. } => {
            if field == tuple.len() {
                tuple.push(value.clone());
                return Ok(());
            }
            let slot = tuple.get_mut(field).ok_or("field out of range")?;
            if matches!(slot, Value::Null) {
                *slot = value.clone();
            }
            Ok(())
        }
        UpsertOp::Splice {
            offset, cut, paste, ..
        } => {
            let slot = tuple.get_mut(field).ok_or("field out of range")?;
            match slot {
                Value::Bytes(bytes) => {
                    splice_bytes(bytes, *offset, *cut, paste)?;
                    Ok(())
                }
                Value::Str(s) => {
                    let mut bytes = s.clone().into_bytes();
                    splice_bytes(&mut bytes, *offset, *cut, paste)?;
                    *s = String::from_utf8(bytes).map_err(|_| "splice broke utf-8")?;
                    Ok(())
                }
                _ => Err("splice on non-string field"),
            }
        }
    }
}

fn splice_bytes(bytes: &mut Vec<u8>, offset: u32, cut: u32, paste: &[u8]) -> Result<(), &'static str> {
    let offset = offset as usize;
    if offset > bytes.len() {
        return Err("splice offset out of range");
    }
    let cut = (cut as usize).min(bytes.len() - offset);
    bytes.splice(offset..offset + cut, paste.iter().copied());
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Squashing
// ------------------------------------------------------------------------------------------------

/// Squashes two upserts into one that resolves identically.
///
/// Against a present base the concatenated operation lists apply in the
/// original order; against an absent base the default tuple must already
/// carry the newer operations, so they are folded in here.
pub fn squash(newer: &Stmt, older: &Stmt, key_def: &KeyDef) -> StmtRef {
    debug_assert_eq!(newer.ty(), StmtType::Upsert);
    debug_assert_eq!(older.ty(), StmtType::Upsert);
    let mut tuple: Tuple = older.tuple().to_vec();
    for op in newer.ops() {
        if key_def.indexes_field(op.field()) {
            continue;
        }
        if let Err(reason) = apply_op(&mut tuple, op) {
            debug!(field = op.field(), reason, "upsert op discarded during squash");
        }
    }
    let mut ops = older.ops().to_vec();
    ops.extend_from_slice(newer.ops());
    Stmt::new_upsert(tuple, ops, newer.lsn())
}

/// Squashes a newest-first chain of upserts into a single upsert.
///
/// # Panics
/// Panics on an empty chain (callers always hold at least one statement).
pub fn squash_chain(chain: &[StmtRef], key_def: &KeyDef) -> StmtRef {
    let mut result = chain
        .last()
        .expect("squash_chain on empty chain")
        .clone();
    for newer in chain.iter().rev().skip(1) {
        result = squash(newer, &result, key_def);
    }
    result
}

// ------------------------------------------------------------------------------------------------
// Key history
// ------------------------------------------------------------------------------------------------

/// The version chain of one key, newest first, ending at the first
/// terminal statement (when one was found).
#[derive(Debug, Default)]
pub struct History {
    stmts: Vec<StmtRef>,
}

impl History {
    pub fn new() -> Self {
        Self { stmts: Vec::new() }
    }

    /// Appends the next **older** statement.
    pub fn push(&mut self, stmt: StmtRef) {
        debug_assert!(
            !self
                .stmts
                .last()
                .is_some_and(|newest| newest.is_terminal()),
            "history already ended at a terminal statement"
        );
        self.stmts.push(stmt);
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    /// Returns `true` if the chain ends with a terminal statement.
    pub fn is_terminal(&self) -> bool {
        self.stmts.last().is_some_and(|oldest| oldest.is_terminal())
    }

    /// Newest statement of the chain.
    pub fn newest(&self) -> Option<&StmtRef> {
        self.stmts.first()
    }

    /// Oldest statement of the chain.
    pub fn oldest(&self) -> Option<&StmtRef> {
        self.stmts.last()
    }

    pub fn stmts(&self) -> &[StmtRef] {
        &self.stmts
    }

    pub fn clear(&mut self) {
        self.stmts.clear();
    }

    /// Resolves the chain to at most one statement.
    ///
    /// The oldest terminal statement (if any) is the base; every upsert
    /// above it applies in order, oldest first. A terminal `Delete` under
    /// upserts contributes no base — the first upsert's default tuple
    /// wins. A chain that resolves to a bare `Delete` is returned only
    /// when `keep_delete` is set.
    pub fn apply(&self, key_def: &KeyDef, keep_delete: bool) -> Option<StmtRef> {
        let oldest = self.stmts.last()?;
        let mut curr: Option<StmtRef> = None;
        let mut rest = &self.stmts[..];
        if oldest.is_terminal() {
            match oldest.ty() {
                StmtType::Delete => {
                    if self.stmts.len() == 1 {
                        return keep_delete.then(|| oldest.clone());
                    }
                    // The delete is consumed: upserts above it resolve
                    // against an absent base.
                }
                _ => curr = Some(oldest.clone()),
            }
            rest = &self.stmts[..self.stmts.len() - 1];
        }
        for upsert in rest.iter().rev() {
            curr = Some(apply_upsert(upsert, curr.as_ref(), key_def, false));
        }
        curr
    }
}
