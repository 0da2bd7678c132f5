//! # Statement Module
//!
//! The atomic unit of the storage core: a **versioned statement**.
//!
//! ## Design Invariants
//!
//! - A statement is immutable once constructed (the upsert bookkeeping
//!   counter is the single, atomically updated exception).
//! - `Delete` and `SelectKey` statements carry key fields only; they never
//!   hold a tuple body.
//! - `SelectKey` is a probe used by iterators and comparators. It never
//!   resides in a generation.
//! - Statements are shared as [`StmtRef`] (`Arc<Stmt>`); cloning the `Arc`
//!   is how a consumer pins a statement for the duration of a merge or a
//!   scan.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::upsert::UpsertOp;

// ------------------------------------------------------------------------------------------------
// Statement type
// ------------------------------------------------------------------------------------------------

/// Kind of a versioned statement.
///
/// `Insert`, `Replace` and `Delete` are **terminal**: their effect is fully
/// determined without consulting older versions. `Upsert` is additive and
/// only resolves against a base. `SelectKey` is a key-only probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StmtType {
    /// Insert a tuple for a key that has no prior history.
    Insert,
    /// Replace whatever version of the key was visible before.
    Replace,
    /// Surrogate delete: key fields only, no tuple body.
    Delete,
    /// Additive update: an ordered list of operations over a base.
    Upsert,
    /// Key-only probe used by iterators; never stored.
    SelectKey,
}

impl StmtType {
    /// Returns `true` for statements whose payload stands on its own
    /// (Insert / Replace / Delete).
    pub fn is_terminal(self) -> bool {
        matches!(self, StmtType::Insert | StmtType::Replace | StmtType::Delete)
    }

    /// Returns `true` for statements that carry key fields only.
    pub fn is_key_only(self) -> bool {
        matches!(self, StmtType::Delete | StmtType::SelectKey)
    }
}

impl fmt::Display for StmtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StmtType::Insert => "INSERT",
            StmtType::Replace => "REPLACE",
            StmtType::Delete => "DELETE",
            StmtType::Upsert => "UPSERT",
            StmtType::SelectKey => "SELECT_KEY",
        };
        f.write_str(name)
    }
}

// ------------------------------------------------------------------------------------------------
// Statement flags
// ------------------------------------------------------------------------------------------------

/// Per-statement flag bitset.
///
/// Reserved bits are tolerated on decode and ignored everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StmtFlags(u8);

impl StmtFlags {
    /// The statement participates in ordering and bookkeeping but must not
    /// be returned to readers.
    pub const SKIP_READ: StmtFlags = StmtFlags(0b0000_0001);

    /// Secondary-index bookkeeping hint: the matching index delete is
    /// produced lazily by a later compaction.
    pub const DEFERRED_DELETE: StmtFlags = StmtFlags(0b0000_0010);

    /// All bits with a defined meaning.
    pub const KNOWN: StmtFlags = StmtFlags(0b0000_0011);

    /// An empty flag set.
    pub const fn empty() -> Self {
        StmtFlags(0)
    }

    /// Constructs a flag set from raw bits, dropping reserved bits.
    pub const fn from_bits_truncate(bits: u8) -> Self {
        StmtFlags(bits & Self::KNOWN.0)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set in `self`.
    pub const fn contains(self, other: StmtFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of two flag sets.
    pub const fn union(self, other: StmtFlags) -> StmtFlags {
        StmtFlags(self.0 | other.0)
    }
}

// ------------------------------------------------------------------------------------------------
// Tuple values
// ------------------------------------------------------------------------------------------------

/// A single dynamically-typed tuple field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Absent / null field.
    Null,
    /// 64-bit unsigned integer.
    Unsigned(u64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
}

impl Value {
    /// Discriminant rank used as the cross-type ordering fallback.
    ///
    /// Key definitions guarantee same-type comparisons on well-formed data;
    /// the rank only keeps the ordering total for corrupted or mixed input.
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Unsigned(_) => 1,
            Value::Integer(_) => 2,
            Value::Str(_) => 3,
            Value::Bytes(_) => 4,
        }
    }

    /// Approximate heap footprint of the value in bytes.
    pub fn size(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Str(s) => inline + s.len(),
            Value::Bytes(b) => inline + b.len(),
            _ => inline,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        match (self, other) {
            (Value::Unsigned(a), Value::Unsigned(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Null, Value::Null) => Equal,
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "0x{}", HexBytes(b)),
        }
    }
}

/// An ordered list of tuple fields.
pub type Tuple = Vec<Value>;

// ------------------------------------------------------------------------------------------------
// Tuple format
// ------------------------------------------------------------------------------------------------

/// Shape of the tuples stored in one generation.
///
/// Each generation is bound to exactly one format; a statement inserted
/// into a generation must match its field count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleFormat {
    /// Format identifier, assigned by the schema owner.
    pub id: u32,
    /// Number of fields in a full tuple body.
    pub field_count: u32,
}

impl TupleFormat {
    /// Creates a format descriptor.
    pub fn new(id: u32, field_count: u32) -> Self {
        Self { id, field_count }
    }
}

// ------------------------------------------------------------------------------------------------
// Statement
// ------------------------------------------------------------------------------------------------

/// Shared handle to an immutable statement.
pub type StmtRef = Arc<Stmt>;

/// A single versioned statement.
///
/// The tuple holds the full body for `Insert`/`Replace`/`Upsert` and the
/// key fields (positionally) for `Delete`/`SelectKey`. The `ops` list is
/// non-empty only for `Upsert`.
#[derive(Debug)]
pub struct Stmt {
    ty: StmtType,
    tuple: Tuple,
    ops: Vec<UpsertOp>,
    lsn: u64,
    flags: StmtFlags,
    /// Number of upsert statements for the same key directly beneath this
    /// one, saturating at the squash threshold plus one. Updated by the
    /// generation on insertion; excluded from equality.
    n_upserts: AtomicU8,
    /// Identifier pairing an optimized secondary-index DELETE with its
    /// REPLACE counterpart.
    opt_update_group: Option<u64>,
}

impl Stmt {
    fn new(ty: StmtType, tuple: Tuple, ops: Vec<UpsertOp>, lsn: u64) -> Self {
        Self {
            ty,
            tuple,
            ops,
            lsn,
            flags: StmtFlags::empty(),
            n_upserts: AtomicU8::new(0),
            opt_update_group: None,
        }
    }

    /// Creates a REPLACE statement from a full tuple body.
    pub fn new_replace(tuple: Tuple, lsn: u64) -> StmtRef {
        Arc::new(Self::new(StmtType::Replace, tuple, Vec::new(), lsn))
    }

    /// Creates an INSERT statement from a full tuple body.
    pub fn new_insert(tuple: Tuple, lsn: u64) -> StmtRef {
        Arc::new(Self::new(StmtType::Insert, tuple, Vec::new(), lsn))
    }

    /// Creates a surrogate DELETE from key fields.
    pub fn new_delete(key: Tuple, lsn: u64) -> StmtRef {
        Arc::new(Self::new(StmtType::Delete, key, Vec::new(), lsn))
    }

    /// Creates an UPSERT from its default tuple body and operation list.
    ///
    /// The default tuple is used as the result when the key has no prior
    /// history; the operations apply over any terminal base.
    pub fn new_upsert(tuple: Tuple, ops: Vec<UpsertOp>, lsn: u64) -> StmtRef {
        Arc::new(Self::new(StmtType::Upsert, tuple, ops, lsn))
    }

    /// Creates a key-only SELECT_KEY probe. Probes may use a prefix of the
    /// key and the reserved bound LSNs.
    pub fn new_select_key(key: Tuple, lsn: u64) -> StmtRef {
        Arc::new(Self::new(StmtType::SelectKey, key, Vec::new(), lsn))
    }

    /// Rebuilds a statement with a different flag set.
    pub fn with_flags(&self, flags: StmtFlags) -> StmtRef {
        let mut copy = self.shallow_copy();
        copy.flags = flags;
        Arc::new(copy)
    }

    /// Rebuilds a statement tagged as one half of an optimized-update pair.
    pub fn with_opt_update_group(&self, group: u64) -> StmtRef {
        let mut copy = self.shallow_copy();
        copy.opt_update_group = Some(group);
        Arc::new(copy)
    }

    /// Rewrites this statement as an INSERT, keeping tuple, LSN and flags.
    pub fn to_insert(&self) -> StmtRef {
        let mut copy = self.shallow_copy();
        copy.ty = StmtType::Insert;
        Arc::new(copy)
    }

    /// Rewrites this statement as a REPLACE, keeping tuple, LSN and flags.
    pub fn to_replace(&self) -> StmtRef {
        let mut copy = self.shallow_copy();
        copy.ty = StmtType::Replace;
        Arc::new(copy)
    }

    /// Materializes the default tuple of an UPSERT as a REPLACE with the
    /// same LSN, dropping the operation list.
    pub fn replace_from_upsert(&self) -> StmtRef {
        debug_assert_eq!(self.ty, StmtType::Upsert);
        let mut copy = self.shallow_copy();
        copy.ty = StmtType::Replace;
        copy.ops = Vec::new();
        Arc::new(copy)
    }

    fn shallow_copy(&self) -> Stmt {
        Stmt {
            ty: self.ty,
            tuple: self.tuple.clone(),
            ops: self.ops.clone(),
            lsn: self.lsn,
            flags: self.flags,
            n_upserts: AtomicU8::new(self.n_upserts()),
            opt_update_group: self.opt_update_group,
        }
    }

    pub fn ty(&self) -> StmtType {
        self.ty
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn flags(&self) -> StmtFlags {
        self.flags
    }

    /// The tuple body, or the positional key fields for key-only statements.
    pub fn tuple(&self) -> &[Value] {
        &self.tuple
    }

    /// Upsert operation list; empty for every other statement type.
    pub fn ops(&self) -> &[UpsertOp] {
        &self.ops
    }

    pub fn opt_update_group(&self) -> Option<u64> {
        self.opt_update_group
    }

    pub fn n_upserts(&self) -> u8 {
        self.n_upserts.load(Ordering::Relaxed)
    }

    pub(crate) fn set_n_upserts(&self, n: u8) {
        self.n_upserts.store(n, Ordering::Relaxed);
    }

    /// Returns `true` for Insert / Replace / Delete.
    pub fn is_terminal(&self) -> bool {
        self.ty.is_terminal()
    }

    /// Returns `true` if the statement must be hidden from readers.
    pub fn skip_read(&self) -> bool {
        self.flags.contains(StmtFlags::SKIP_READ)
    }

    /// Approximate memory footprint, used for arena accounting.
    pub fn size(&self) -> usize {
        let mut size = std::mem::size_of::<Stmt>();
        for value in &self.tuple {
            size += value.size();
        }
        for op in &self.ops {
            size += op.size();
        }
        size
    }
}

/// Content equality: type, tuple, operations, LSN, flags and the
/// optimized-update pairing. The upsert bookkeeping counter is excluded —
/// it describes the statement's surroundings, not the statement.
impl PartialEq for Stmt {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty
            && self.lsn == other.lsn
            && self.flags == other.flags
            && self.tuple == other.tuple
            && self.ops == other.ops
            && self.opt_update_group == other.opt_update_group
    }
}

impl Eq for Stmt {}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}([", self.ty)?;
        for (i, value) in self.tuple.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, "], lsn={})", self.lsn)
    }
}

// ------------------------------------------------------------------------------------------------
// Display helper
// ------------------------------------------------------------------------------------------------

struct HexBytes<'a>(&'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter().take(16) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 16 {
            write!(f, "...[{} bytes]", self.0.len())?;
        }
        Ok(())
    }
}
