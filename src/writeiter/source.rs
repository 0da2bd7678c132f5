//! Ordered statement sources feeding the write iterator.
//!
//! Anything presenting a sorted statement sequence for the same comparator
//! can be merged: a sealed generation under drain, a pre-sorted vector
//! standing in for an on-disk run, or a codec-encoded byte stream.

use std::sync::Arc;

use thiserror::Error;

use crate::encoding::{EncodingError, decode_from_slice};
use crate::keydef::KeyDef;
use crate::mem::iterator::MemStream;
use crate::mem::{Mem, MemState};
use crate::stmt::StmtRef;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// A source failed to produce its next statement.
///
/// Errors are forwarded verbatim by the write iterator; the consumer
/// discards any partial output.
#[derive(Debug, Error)]
pub enum SourceError {
    /// An external read failed.
    #[error("source read failed: {0}")]
    Read(String),

    /// A statement record could not be decoded.
    #[error("bad encoding: {0}")]
    Encoding(#[from] EncodingError),

    /// The source was used outside its contract.
    #[error("source misuse: {0}")]
    Misuse(String),
}

// ------------------------------------------------------------------------------------------------
// Source trait
// ------------------------------------------------------------------------------------------------

/// An ordered sequence of statements under one comparator.
///
/// `start` is called once before the first `next`; `stop` releases any
/// held resources and may be called at any point after `start`. Pulling
/// from a source is the only place the write iterator may suspend.
pub trait StmtSource: Send {
    fn start(&mut self) -> Result<(), SourceError>;
    fn next(&mut self) -> Result<Option<StmtRef>, SourceError>;
    fn stop(&mut self);
}

// ------------------------------------------------------------------------------------------------
// Mem source
// ------------------------------------------------------------------------------------------------

/// Drains a sealed generation. The generation is pinned by the source for
/// the duration of the merge and transitions to `Draining` on start.
pub struct MemSource {
    mem: Arc<Mem>,
    stream: Option<MemStream>,
}

impl MemSource {
    pub fn new(mem: Arc<Mem>) -> Self {
        Self { mem, stream: None }
    }
}

impl StmtSource for MemSource {
    fn start(&mut self) -> Result<(), SourceError> {
        match self.mem.state() {
            MemState::Active => {
                return Err(SourceError::Misuse(format!(
                    "generation {} is still active",
                    self.mem.generation()
                )));
            }
            MemState::Sealed => {
                self.mem
                    .begin_drain()
                    .map_err(|e| SourceError::Misuse(e.to_string()))?;
            }
            MemState::Draining => {}
        }
        let stream = Arc::clone(&self.mem)
            .stream()
            .map_err(|e| SourceError::Misuse(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn next(&mut self) -> Result<Option<StmtRef>, SourceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SourceError::Misuse("next before start".into()))?;
        Ok(stream.next())
    }

    fn stop(&mut self) {
        self.stream = None;
    }
}

// ------------------------------------------------------------------------------------------------
// Vector source
// ------------------------------------------------------------------------------------------------

/// Adapts a pre-sorted statement vector. This is the seam on-disk run
/// readers plug into, and the workhorse of the test suite.
pub struct VecSource {
    key_def: Arc<KeyDef>,
    stmts: Vec<StmtRef>,
    pos: usize,
}

impl VecSource {
    pub fn new(key_def: Arc<KeyDef>, stmts: Vec<StmtRef>) -> Self {
        Self {
            key_def,
            stmts,
            pos: 0,
        }
    }
}

impl StmtSource for VecSource {
    fn start(&mut self) -> Result<(), SourceError> {
        for pair in self.stmts.windows(2) {
            if self.key_def.compare_stmts(&pair[0], &pair[1]) == std::cmp::Ordering::Greater {
                return Err(SourceError::Misuse(format!(
                    "statements out of order: {} before {}",
                    pair[0], pair[1]
                )));
            }
        }
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<StmtRef>, SourceError> {
        let next = self.stmts.get(self.pos).cloned();
        if next.is_some() {
            self.pos += 1;
        }
        Ok(next)
    }

    fn stop(&mut self) {
        self.stmts.clear();
    }
}

// ------------------------------------------------------------------------------------------------
// Decode source
// ------------------------------------------------------------------------------------------------

/// Streams statements out of a codec-encoded byte buffer. Decode failures
/// surface as [`SourceError::Encoding`] and abort the merge.
pub struct DecodeSource {
    buf: Vec<u8>,
    pos: usize,
}

impl DecodeSource {
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, pos: 0 }
    }
}

impl StmtSource for DecodeSource {
    fn start(&mut self) -> Result<(), SourceError> {
        self.pos = 0;
        Ok(())
    }

    fn next(&mut self) -> Result<Option<StmtRef>, SourceError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let (stmt, consumed) = decode_from_slice::<StmtRef>(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(Some(stmt))
    }

    fn stop(&mut self) {
        self.buf.clear();
    }
}
