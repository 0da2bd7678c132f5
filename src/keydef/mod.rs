//! # Key Comparator Module
//!
//! Defines the total order every other component relies on: statements are
//! sorted by **key ascending**, then **LSN descending**, so the newest
//! version of a key is met first on forward iteration.
//!
//! ## Design Invariants
//!
//! - Key comparison is lexicographic per configured part, honoring each
//!   part's sort order and field type.
//! - A prefix key (fewer parts than the definition) compares equal to any
//!   key it prefixes; prefix probes are valid range bounds but rejected
//!   for exact point lookups on unique definitions.
//! - Ties on `(key, LSN)` are broken by statement rank: tuple statements
//!   order before a DELETE with the same LSN, keeping an optimized-update
//!   pair adjacent with the REPLACE on the newer side.
//! - The reserved LSNs [`LSN_INF`] and `0` let a probe straddle a key:
//!   `LSN_INF` positions strictly before every version, `0` strictly after.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::cmp::Ordering;

use thiserror::Error;

use crate::stmt::{Stmt, StmtRef, StmtType, Value};

/// Reserved LSN used by probes that must sort before all versions of a key.
///
/// Real statements never carry it; commit LSNs are strictly below.
pub const LSN_INF: u64 = u64::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// A key cannot be interpreted under a key definition.
#[derive(Debug, Error)]
pub enum KeyError {
    /// A key field holds a value of the wrong type.
    #[error("key part {part} expects {expected:?}, got {got}")]
    FieldType {
        part: u32,
        expected: FieldType,
        got: &'static str,
    },

    /// A tuple is too short to contain all indexed fields.
    #[error("tuple with {field_count} fields is missing indexed field {field_no}")]
    MissingField { field_no: u32, field_count: usize },

    /// A partial key was used where a unique point lookup requires the
    /// full arity.
    #[error("partial key ({got} of {expected} parts) is not allowed for exact match")]
    PartialKey { got: usize, expected: usize },
}

// ------------------------------------------------------------------------------------------------
// Field and part definitions
// ------------------------------------------------------------------------------------------------

/// Type of an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Unsigned,
    Integer,
    Str,
    Bytes,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::Unsigned, Value::Unsigned(_))
                | (FieldType::Integer, Value::Integer(_))
                | (FieldType::Str, Value::Str(_))
                | (FieldType::Bytes, Value::Bytes(_))
        )
    }
}

/// Per-part sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One part of a key definition: which tuple field is indexed, its type
/// and its direction.
#[derive(Debug, Clone)]
pub struct KeyPart {
    pub field_no: u32,
    pub field_type: FieldType,
    pub order: SortOrder,
}

impl KeyPart {
    pub fn new(field_no: u32, field_type: FieldType) -> Self {
        Self {
            field_no,
            field_type,
            order: SortOrder::Asc,
        }
    }

    pub fn desc(mut self) -> Self {
        self.order = SortOrder::Desc;
        self
    }
}

// ------------------------------------------------------------------------------------------------
// Key definition
// ------------------------------------------------------------------------------------------------

/// An ordered list of key parts plus the uniqueness contract.
#[derive(Debug, Clone)]
pub struct KeyDef {
    parts: Vec<KeyPart>,
    unique: bool,
}

impl KeyDef {
    /// Creates a unique key definition.
    pub fn new(parts: Vec<KeyPart>) -> Self {
        Self {
            parts,
            unique: true,
        }
    }

    /// Creates a non-unique key definition.
    pub fn new_non_unique(parts: Vec<KeyPart>) -> Self {
        Self {
            parts,
            unique: false,
        }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// Returns `true` if the indexed field is part of the key.
    pub fn indexes_field(&self, field_no: u32) -> bool {
        self.parts.iter().any(|p| p.field_no == field_no)
    }

    /// The `idx`-th key field of a statement, or `None` past the end of a
    /// prefix. Key-only statements are positional; tuple statements are
    /// projected through the part's field number.
    pub fn key_field<'a>(&self, stmt: &'a Stmt, idx: usize) -> Option<&'a Value> {
        let part = &self.parts[idx];
        if stmt.ty().is_key_only() {
            stmt.tuple().get(idx)
        } else {
            stmt.tuple().get(part.field_no as usize)
        }
    }

    /// Projects a statement onto its key fields.
    pub fn extract_key(&self, stmt: &Stmt) -> Vec<Value> {
        (0..self.parts.len())
            .filter_map(|i| self.key_field(stmt, i).cloned())
            .collect()
    }

    /// Verifies that a statement's key fields are present and well-typed.
    ///
    /// Surfaced from the call that introduces the key; nothing is mutated
    /// on failure.
    pub fn validate_stmt(&self, stmt: &Stmt) -> Result<(), KeyError> {
        for (i, part) in self.parts.iter().enumerate() {
            match self.key_field(stmt, i) {
                None => {
                    return Err(KeyError::MissingField {
                        field_no: part.field_no,
                        field_count: stmt.tuple().len(),
                    });
                }
                Some(value) if !part.field_type.matches(value) => {
                    return Err(KeyError::FieldType {
                        part: i as u32,
                        expected: part.field_type,
                        got: value_type_name(value),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Verifies a search key. Prefix keys are fine for ordered scans;
    /// exact lookups on a unique definition need the full arity.
    pub fn validate_search_key(&self, key: &[Value], exact: bool) -> Result<(), KeyError> {
        if exact && self.unique && key.len() < self.parts.len() {
            return Err(KeyError::PartialKey {
                got: key.len(),
                expected: self.parts.len(),
            });
        }
        for (i, value) in key.iter().enumerate().take(self.parts.len()) {
            let part = &self.parts[i];
            if !part.field_type.matches(value) {
                return Err(KeyError::FieldType {
                    part: i as u32,
                    expected: part.field_type,
                    got: value_type_name(value),
                });
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Comparison
    // --------------------------------------------------------------------------------------------

    /// Compares the key projections of two statements.
    ///
    /// A statement that runs out of key fields (a prefix probe) compares
    /// equal to anything it prefixes, which makes a prefix probe behave as
    /// a bound covering every extension.
    pub fn compare_keys(&self, a: &Stmt, b: &Stmt) -> Ordering {
        for i in 0..self.parts.len() {
            let (va, vb) = match (self.key_field(a, i), self.key_field(b, i)) {
                (Some(va), Some(vb)) => (va, vb),
                // Prefix rule: the shorter operand matched on every
                // compared part.
                _ => return Ordering::Equal,
            };
            let ord = match self.parts[i].order {
                SortOrder::Asc => va.cmp(vb),
                SortOrder::Desc => vb.cmp(va),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// The full statement order: key ascending, then LSN descending, then
    /// statement rank.
    pub fn compare_stmts(&self, a: &Stmt, b: &Stmt) -> Ordering {
        self.compare_keys(a, b)
            .then_with(|| b.lsn().cmp(&a.lsn()))
            .then_with(|| stmt_rank(a).cmp(&stmt_rank(b)))
    }

    /// Returns `true` when two statements address the same key.
    pub fn same_key(&self, a: &Stmt, b: &Stmt) -> bool {
        self.compare_keys(a, b) == Ordering::Equal
    }

    // --------------------------------------------------------------------------------------------
    // Probes
    // --------------------------------------------------------------------------------------------

    /// A probe that sorts strictly before every version of `key` (and of
    /// every key extending a prefix probe).
    pub fn probe_before(&self, key: &[Value]) -> StmtRef {
        Stmt::new_select_key(key.to_vec(), LSN_INF)
    }

    /// A probe that sorts strictly after every version of `key`.
    pub fn probe_after(&self, key: &[Value]) -> StmtRef {
        Stmt::new_select_key(key.to_vec(), 0)
    }

    /// A probe positioned at `(key, lsn)`, before any stored statement
    /// with the same LSN. Used to hop to the newest version visible in a
    /// read view.
    pub fn probe_at(&self, key: &[Value], lsn: u64) -> StmtRef {
        Stmt::new_select_key(key.to_vec(), lsn)
    }
}

/// Rank breaking `(key, LSN)` ties: probes first, tuple statements next,
/// DELETE last. Within one generation a real tie can only be an optimized
/// DELETE + REPLACE pair sharing a commit LSN.
fn stmt_rank(stmt: &Stmt) -> u8 {
    match stmt.ty() {
        StmtType::SelectKey => 0,
        StmtType::Insert | StmtType::Replace | StmtType::Upsert => 1,
        StmtType::Delete => 2,
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Unsigned(_) => "unsigned",
        Value::Integer(_) => "integer",
        Value::Str(_) => "string",
        Value::Bytes(_) => "bytes",
    }
}
