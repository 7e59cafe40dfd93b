//! Destinations for change records.
//!
//! The insertion engine calls [`WalSink::record_change`] exactly once per
//! atomic mutation group, while every page the record touches is still
//! latched, and stamps the returned LSN on those pages.

use bytes::BytesMut;
use parking_lot::Mutex;
use sptree_common::types::Lsn;
use tracing::trace;

use crate::error::{WalError, WalResult};
use crate::record::ChangeRecord;

/// Accepts change records from the engine.
pub trait WalSink: Send + Sync {
    /// Records one change and returns the LSN to stamp on touched pages.
    fn record_change(&self, record: &ChangeRecord) -> WalResult<Lsn>;

    /// Returns true if records from this sink should be stamped on pages.
    fn is_logged(&self) -> bool {
        true
    }
}

/// Sink for unlogged indexes; discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWal;

impl WalSink for NoopWal {
    fn record_change(&self, _record: &ChangeRecord) -> WalResult<Lsn> {
        Ok(Lsn::INVALID)
    }

    fn is_logged(&self) -> bool {
        false
    }
}

struct MemoryWalInner {
    buffer: BytesMut,
    records: u64,
    closed: bool,
}

/// In-memory log buffer.
///
/// Records are framed back to back; the LSN of a record is the buffer
/// length after it was appended, so LSNs increase strictly.
pub struct MemoryWal {
    inner: Mutex<MemoryWalInner>,
}

impl MemoryWal {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryWalInner {
                buffer: BytesMut::new(),
                records: 0,
                closed: false,
            }),
        }
    }

    /// Returns the number of records appended.
    pub fn record_count(&self) -> u64 {
        self.inner.lock().records
    }

    /// Returns the LSN of the last appended record.
    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.inner.lock().buffer.len() as u64)
    }

    /// Stops accepting records.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Decodes every record in append order.
    pub fn records(&self) -> WalResult<Vec<ChangeRecord>> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < inner.buffer.len() {
            let (record, used) = ChangeRecord::decode(&inner.buffer[pos..])?;
            out.push(record);
            pos += used;
        }
        Ok(out)
    }
}

impl Default for MemoryWal {
    fn default() -> Self {
        Self::new()
    }
}

impl WalSink for MemoryWal {
    fn record_change(&self, record: &ChangeRecord) -> WalResult<Lsn> {
        let frame = record.encode()?;
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(WalError::Closed);
        }
        inner.buffer.extend_from_slice(&frame);
        inner.records += 1;
        let lsn = Lsn::new(inner.buffer.len() as u64);
        trace!(?lsn, record_type = ?record.record_type(), "appended change record");
        Ok(lsn)
    }
}

impl std::fmt::Debug for MemoryWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryWal")
            .field("bytes", &inner.buffer.len())
            .field("records", &inner.records)
            .field("closed", &inner.closed)
            .finish()
    }
}
