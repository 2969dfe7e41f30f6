//! Incremental blob handle

use super::child::ChildCore;
use super::connection::ConnectionHandle;
use super::{HandleKind, NativeHandle, ReleaseOutcome};
use crate::core::api::RawPtr;
use crate::error::Result;

/// Owns one `sqlite3_blob`
#[derive(Debug)]
pub struct BlobHandle {
    core: ChildCore,
}

impl BlobHandle {
    /// Adopt a raw blob opened on `connection`
    pub fn new(connection: &ConnectionHandle, raw: RawPtr) -> Self {
        Self {
            core: ChildCore::new(connection, raw),
        }
    }

    /// Size of the blob in bytes
    pub fn len(&self) -> Result<usize> {
        let raw = self.core.live_raw(HandleKind::Blob)?;
        // SAFETY: live blob whose connection is still at our generation
        let bytes = unsafe { self.core.api().blob_bytes(raw) };
        Ok(bytes.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn is_stale(&self) -> bool {
        self.core.is_stale()
    }
}

impl NativeHandle for BlobHandle {
    fn kind(&self) -> HandleKind {
        HandleKind::Blob
    }

    fn as_raw(&self) -> RawPtr {
        self.core.raw()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn release(&self) -> ReleaseOutcome {
        // SAFETY: the core only hands over a live, owned, current pointer
        self.core
            .release(HandleKind::Blob, |api, raw| unsafe { api.blob_close(raw) })
    }
}

impl Drop for BlobHandle {
    fn drop(&mut self) {
        self.release();
    }
}
