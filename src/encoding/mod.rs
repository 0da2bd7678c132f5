//! Deterministic, zero-dependency binary encoding for statement records.
//!
//! This module provides the [`Encode`] and [`Decode`] traits and the
//! self-describing wire layout used by on-disk sources and the replication
//! codec. Because the crate owns this format, the byte representation
//! **never** changes due to a dependency upgrade.
//!
//! # Record layout
//!
//! | Section | Encoding |
//! |---------|----------|
//! | type tag | 1 byte (unknown tag is a fatal decode error) |
//! | LSN | varint |
//! | flags | varint (reserved bits ignored on decode) |
//! | key fields (`Delete`/`SelectKey`) | `[varint count][value…]` |
//! | field map (other types) | `[varint count][u32 offset…][u32 region len][packed values]` |
//! | operations (`Upsert` only) | `[varint count][op…]` |
//! | extensions | `[u8 bits][varint group if bit 0]` |
//!
//! Values are tagged (`null`/`unsigned`/`integer`/`string`/`bytes`);
//! multi-byte fixed integers are little-endian; varints are LEB128 and
//! signed values use zigzag. Field-map offsets point into the packed value
//! region and are verified during decode.
//!
//! # Safety limits
//!
//! All variable-length decoders enforce upper bounds so a crafted record
//! cannot trigger an allocation bomb: [`MAX_BYTE_LEN`] for byte payloads,
//! [`MAX_FIELD_COUNT`] for tuple arity, [`MAX_OP_COUNT`] for upsert
//! operation lists.
//!
//! # Zero-panic guarantee
//!
//! No function in this module uses `unwrap()`, `expect()`, or any other
//! panicking path. All errors are propagated via [`EncodingError`].


use thiserror::Error;

use crate::stmt::{Stmt, StmtFlags, StmtRef, StmtType, Value};
use crate::upsert::UpsertOp;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length for a single string or byte-string value during
/// decoding (16 MiB).
pub const MAX_BYTE_LEN: u32 = 16 * 1024 * 1024;

/// Maximum tuple arity during decoding.
pub const MAX_FIELD_COUNT: u32 = 4096;

/// Maximum upsert operation count during decoding.
pub const MAX_OP_COUNT: u32 = 4096;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A tag byte was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag {
        /// The tag value that was read.
        tag: u32,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A varint ran past its maximum width or overflowed 64 bits.
    #[error("varint overflow")]
    VarintOverflow,

    /// A byte-sequence decoded as a string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its safety limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// A field-map offset disagrees with the packed value region.
    #[error("field {field} offset mismatch (map says {map_offset}, region says {actual})")]
    OffsetMismatch {
        field: u32,
        map_offset: u32,
        actual: u32,
    },
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations **must** produce deterministic output: the same logical
/// value always yields the exact same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` on success so that callers can
/// advance a cursor through a buffer containing multiple encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`.
///
/// Returns `(value, bytes_consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn read_varint(buf: &[u8]) -> Result<(u64, usize), EncodingError> {
    let mut value: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(10) {
        // The tenth byte may only contribute the final bit.
        if i == 9 && byte > 0x01 {
            return Err(EncodingError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7F) << (7 * i as u32);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() >= 10 {
        Err(EncodingError::VarintOverflow)
    } else {
        Err(EncodingError::UnexpectedEof {
            needed: buf.len() + 1,
            available: buf.len(),
        })
    }
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8]) -> Result<(u32, usize), EncodingError> {
    require(buf, 4)?;
    Ok((
        u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        4,
    ))
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EncodingError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| EncodingError::LengthOverflow(format!("{} bytes", bytes.len())))?;
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!("{len} bytes")));
    }
    write_u32(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_bytes(buf: &[u8]) -> Result<(Vec<u8>, usize), EncodingError> {
    let (len, mut consumed) = read_u32(buf)?;
    if len > MAX_BYTE_LEN {
        return Err(EncodingError::LengthOverflow(format!("{len} bytes")));
    }
    let len = len as usize;
    require(&buf[consumed..], len)?;
    let bytes = buf[consumed..consumed + len].to_vec();
    consumed += len;
    Ok((bytes, consumed))
}

// ------------------------------------------------------------------------------------------------
// Value encoding
// ------------------------------------------------------------------------------------------------

const VALUE_TAG_NULL: u8 = 0;
const VALUE_TAG_UNSIGNED: u8 = 1;
const VALUE_TAG_INTEGER: u8 = 2;
const VALUE_TAG_STR: u8 = 3;
const VALUE_TAG_BYTES: u8 = 4;

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Value::Null => buf.push(VALUE_TAG_NULL),
            Value::Unsigned(v) => {
                buf.push(VALUE_TAG_UNSIGNED);
                write_varint(buf, *v);
            }
            Value::Integer(v) => {
                buf.push(VALUE_TAG_INTEGER);
                write_varint(buf, zigzag_encode(*v));
            }
            Value::Str(s) => {
                buf.push(VALUE_TAG_STR);
                write_bytes(buf, s.as_bytes())?;
            }
            Value::Bytes(b) => {
                buf.push(VALUE_TAG_BYTES);
                write_bytes(buf, b)?;
            }
        }
        Ok(())
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        let tag = buf[0];
        let mut consumed = 1;
        let value = match tag {
            VALUE_TAG_NULL => Value::Null,
            VALUE_TAG_UNSIGNED => {
                let (v, n) = read_varint(&buf[consumed..])?;
                consumed += n;
                Value::Unsigned(v)
            }
            VALUE_TAG_INTEGER => {
                let (v, n) = read_varint(&buf[consumed..])?;
                consumed += n;
                Value::Integer(zigzag_decode(v))
            }
            VALUE_TAG_STR => {
                let (bytes, n) = read_bytes(&buf[consumed..])?;
                consumed += n;
                Value::Str(String::from_utf8(bytes)?)
            }
            VALUE_TAG_BYTES => {
                let (bytes, n) = read_bytes(&buf[consumed..])?;
                consumed += n;
                Value::Bytes(bytes)
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Value",
                });
            }
        };
        Ok((value, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Upsert operation encoding
// ------------------------------------------------------------------------------------------------

const OP_TAG_ADD: u8 = 0;
const OP_TAG_ASSIGN: u8 = 1;
const OP_TAG_SET_IF_ABSENT: u8 = 2;
const OP_TAG_SPLICE: u8 = 3;

impl Encode for UpsertOp {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            UpsertOp::Add { field, delta } => {
                buf.push(OP_TAG_ADD);
                write_varint(buf, u64::from(*field));
                write_varint(buf, zigzag_encode(*delta));
            }
            UpsertOp::Assign { field, value } => {
                buf.push(OP_TAG_ASSIGN);
                write_varint(buf, u64::from(*field));
                value.encode_to(buf)?;
            }
            UpsertOp::SetIfAbsent { field, value } => {
                buf.push(OP_TAG_SET_IF_ABSENT);
                write_varint(buf, u64::from(*field));
                value.encode_to(buf)?;
            }
            UpsertOp::Splice {
                field,
                offset,
                cut,
                paste,
            } => {
                buf.push(OP_TAG_SPLICE);
                write_varint(buf, u64::from(*field));
                write_u32(buf, *offset);
                write_u32(buf, *cut);
                write_bytes(buf, paste)?;
            }
        }
        Ok(())
    }
}

impl Decode for UpsertOp {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        let tag = buf[0];
        let mut consumed = 1;
        let (field, n) = read_varint(&buf[consumed..])?;
        consumed += n;
        let field = u32::try_from(field)
            .map_err(|_| EncodingError::LengthOverflow(format!("field number {field}")))?;
        let op = match tag {
            OP_TAG_ADD => {
                let (delta, n) = read_varint(&buf[consumed..])?;
                consumed += n;
                UpsertOp::Add {
                    field,
                    delta: zigzag_decode(delta),
                }
            }
            OP_TAG_ASSIGN => {
                let (value, n) = Value::decode_from(&buf[consumed..])?;
                consumed += n;
                UpsertOp::Assign { field, value }
            }
            OP_TAG_SET_IF_ABSENT => {
                let (value, n) = Value::decode_from(&buf[consumed..])?;
                consumed += n;
                UpsertOp::SetIfAbsent { field, value }
            }
            OP_TAG_SPLICE => {
                let (offset, n) = read_u32(&buf[consumed..])?;
                consumed += n;
                let (cut, n) = read_u32(&buf[consumed..])?;
                consumed += n;
                let (paste, n) = read_bytes(&buf[consumed..])?;
                consumed += n;
                UpsertOp::Splice {
                    field,
                    offset,
                    cut,
                    paste,
                }
            }
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "UpsertOp",
                });
            }
        };
        Ok((op, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Statement encoding
// ------------------------------------------------------------------------------------------------

const STMT_TAG_INSERT: u8 = 0;
const STMT_TAG_REPLACE: u8 = 1;
const STMT_TAG_DELETE: u8 = 2;
const STMT_TAG_UPSERT: u8 = 3;
const STMT_TAG_SELECT_KEY: u8 = 4;

/// Extension bit: an optimized-update group id follows.
const EXT_OPT_UPDATE_GROUP: u8 = 0b0000_0001;

fn stmt_type_tag(ty: StmtType) -> u8 {
    match ty {
        StmtType::Insert => STMT_TAG_INSERT,
        StmtType::Replace => STMT_TAG_REPLACE,
        StmtType::Delete => STMT_TAG_DELETE,
        StmtType::Upsert => STMT_TAG_UPSERT,
        StmtType::SelectKey => STMT_TAG_SELECT_KEY,
    }
}

impl Encode for Stmt {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(stmt_type_tag(self.ty()));
        write_varint(buf, self.lsn());
        write_varint(buf, u64::from(self.flags().bits()));

        if self.ty().is_key_only() {
            // Positional key-field array.
            write_varint(buf, self.tuple().len() as u64);
            for value in self.tuple() {
                value.encode_to(buf)?;
            }
        } else {
            // Field map of offsets into a packed value region.
            let count = u32::try_from(self.tuple().len()).map_err(|_| {
                EncodingError::LengthOverflow(format!("{} fields", self.tuple().len()))
            })?;
            if count > MAX_FIELD_COUNT {
                return Err(EncodingError::LengthOverflow(format!("{count} fields")));
            }
            let mut region = Vec::new();
            let mut offsets = Vec::with_capacity(self.tuple().len());
            for value in self.tuple() {
                offsets.push(region.len() as u32);
                value.encode_to(&mut region)?;
            }
            write_varint(buf, u64::from(count));
            for offset in offsets {
                write_u32(buf, offset);
            }
            let region_len = u32::try_from(region.len()).map_err(|_| {
                EncodingError::LengthOverflow(format!("{} region bytes", region.len()))
            })?;
            write_u32(buf, region_len);
            buf.extend_from_slice(&region);
        }

        if self.ty() == StmtType::Upsert {
            write_varint(buf, self.ops().len() as u64);
            for op in self.ops() {
                op.encode_to(buf)?;
            }
        }

        let mut ext = 0u8;
        if self.opt_update_group().is_some() {
            ext |= EXT_OPT_UPDATE_GROUP;
        }
        buf.push(ext);
        if let Some(group) = self.opt_update_group() {
            write_varint(buf, group);
        }
        Ok(())
    }
}

impl Decode for StmtRef {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        let tag = buf[0];
        let mut consumed = 1;
        let ty = match tag {
            STMT_TAG_INSERT => StmtType::Insert,
            STMT_TAG_REPLACE => StmtType::Replace,
            STMT_TAG_DELETE => StmtType::Delete,
            STMT_TAG_UPSERT => StmtType::Upsert,
            STMT_TAG_SELECT_KEY => StmtType::SelectKey,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other as u32,
                    type_name: "Stmt",
                });
            }
        };

        let (lsn, n) = read_varint(&buf[consumed..])?;
        consumed += n;
        let (flag_bits, n) = read_varint(&buf[consumed..])?;
        consumed += n;
        // Reserved flag bits are ignored.
        let flags = StmtFlags::from_bits_truncate(flag_bits as u8);

        let tuple = if ty.is_key_only() {
            let (count, n) = read_varint(&buf[consumed..])?;
            consumed += n;
            if count > u64::from(MAX_FIELD_COUNT) {
                return Err(EncodingError::LengthOverflow(format!("{count} key fields")));
            }
            let mut tuple = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (value, n) = Value::decode_from(&buf[consumed..])?;
                consumed += n;
                tuple.push(value);
            }
            tuple
        } else {
            let (count, n) = read_varint(&buf[consumed..])?;
            consumed += n;
            if count > u64::from(MAX_FIELD_COUNT) {
                return Err(EncodingError::LengthOverflow(format!("{count} fields")));
            }
            let mut offsets = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (offset, n) = read_u32(&buf[consumed..])?;
                consumed += n;
                offsets.push(offset);
            }
            let (region_len, n) = read_u32(&buf[consumed..])?;
            consumed += n;
            let region_len = region_len as usize;
            require(&buf[consumed..], region_len)?;
            let region = &buf[consumed..consumed + region_len];
            consumed += region_len;

            let mut tuple = Vec::with_capacity(count as usize);
            let mut pos = 0usize;
            for (i, &offset) in offsets.iter().enumerate() {
                if offset as usize != pos {
                    return Err(EncodingError::OffsetMismatch {
                        field: i as u32,
                        map_offset: offset,
                        actual: pos as u32,
                    });
                }
                let (value, n) = Value::decode_from(&region[pos..])?;
                pos += n;
                tuple.push(value);
            }
            tuple
        };

        let ops = if ty == StmtType::Upsert {
            let (count, n) = read_varint(&buf[consumed..])?;
            consumed += n;
            if count > u64::from(MAX_OP_COUNT) {
                return Err(EncodingError::LengthOverflow(format!("{count} upsert ops")));
            }
            let mut ops = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let (op, n) = UpsertOp::decode_from(&buf[consumed..])?;
                consumed += n;
                ops.push(op);
            }
            ops
        } else {
            Vec::new()
        };

        require(&buf[consumed..], 1)?;
        let ext = buf[consumed];
        consumed += 1;
        let opt_update_group = if ext & EXT_OPT_UPDATE_GROUP != 0 {
            let (group, n) = read_varint(&buf[consumed..])?;
            consumed += n;
            Some(group)
        } else {
            None
        };

        let mut stmt = match ty {
            StmtType::Insert => Stmt::new_insert(tuple, lsn),
            StmtType::Replace => Stmt::new_replace(tuple, lsn),
            StmtType::Delete => Stmt::new_delete(tuple, lsn),
            StmtType::Upsert => Stmt::new_upsert(tuple, ops, lsn),
            StmtType::SelectKey => Stmt::new_select_key(tuple, lsn),
        };
        if flags != StmtFlags::empty() {
            stmt = stmt.with_flags(flags);
        }
        if let Some(group) = opt_update_group {
            stmt = stmt.with_opt_update_group(group);
        }
        Ok((stmt, consumed))
    }
}
