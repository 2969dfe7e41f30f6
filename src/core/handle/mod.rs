//! Safe native handles
//!
//! Each handle owns exactly one raw native pointer and releases it at most
//! once, whether released explicitly, dropped, or both, from any thread.
//!
//! ## Release protocol
//!
//! 1. Already closed → no-op
//! 2. Child handles only: the parent connection's generation moved on →
//!    invalidate without a native call
//! 3. Atomically swap the raw pointer to the invalid sentinel
//! 4. If the prior value was live (and owned), call the native release function
//! 5. Mark closed, whatever step 4 returned; failures are logged, never raised
//!
//! The swap in step 3 is the only concurrency guard: whichever caller observes
//! a live prior value performs the native call, every other caller no-ops.
//!
//! ## Parent/child ordering
//!
//! An owning connection's release runs, in order: finish every open backup
//! it takes part in (as source or destination), bump the generation, native
//! close. Statement, backup and blob handles snapshot the generation when
//! created and share the counter with the connection. A child whose snapshot
//! no longer matches never touches its pointer again, because the native
//! library may already have reused that address. The close path finalizes
//! outstanding statements natively, which also retires open blobs.
//!
//! The counter outlives the connection handle, so dropping a non-owning
//! alias leaves its children current and they release normally.
//!
//! The check narrows, but does not close, the window in which a connection is
//! closed concurrently with a child's first use. Callers are expected to close
//! children first.

mod backup;
mod blob;
mod child;
mod connection;
mod statement;

pub use backup::{BackupHandle, BackupStep};
pub use blob::BlobHandle;
pub use connection::ConnectionHandle;
pub use statement::StatementHandle;

use crate::core::api::{RawPtr, INVALID, SQLITE_OK};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use tracing::{trace, warn};

/// Handle variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Statement,
    Backup,
    Blob,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Connection => "connection",
            HandleKind::Statement => "statement",
            HandleKind::Backup => "backup",
            HandleKind::Blob => "blob",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a call to `release` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The native release function ran and reported success
    Released,
    /// The native release function ran and reported a failure (or panicked);
    /// the handle is closed regardless
    Failed(i32),
    /// The handle had already been closed
    AlreadyClosed,
    /// The pointer was already the invalid sentinel (e.g. lost a release race)
    Empty,
    /// The handle does not own its resource; nothing was released
    NotOwned,
    /// The parent connection was closed first; the native call was skipped
    Stale,
}

impl ReleaseOutcome {
    /// Whether this call performed the native release
    pub fn invoked_native(self) -> bool {
        matches!(self, ReleaseOutcome::Released | ReleaseOutcome::Failed(_))
    }
}

/// Status reported when a native release function panics
pub const PANICKED: i32 = -1;

/// Common surface of every handle variant
pub trait NativeHandle {
    fn kind(&self) -> HandleKind;

    /// Current raw pointer, or the invalid sentinel once released
    fn as_raw(&self) -> RawPtr;

    /// Whether release has completed
    fn is_closed(&self) -> bool;

    /// Whether the handle currently holds no resource
    fn is_invalid(&self) -> bool {
        self.as_raw().is_null()
    }

    /// Release the native resource, at most once
    fn release(&self) -> ReleaseOutcome;
}

/// Atomic pointer slot shared by every variant
pub(crate) struct RawSlot {
    raw: AtomicPtr<std::ffi::c_void>,
    closed: AtomicBool,
    owns: bool,
}

impl RawSlot {
    pub(crate) fn new(raw: RawPtr, owns: bool) -> Self {
        Self {
            raw: AtomicPtr::new(raw),
            closed: AtomicBool::new(false),
            owns,
        }
    }

    pub(crate) fn load(&self) -> RawPtr {
        self.raw.load(Ordering::Acquire)
    }

    pub(crate) fn owns(&self) -> bool {
        self.owns
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop the pointer without a native call
    pub(crate) fn invalidate(&self) {
        self.raw.swap(INVALID, Ordering::AcqRel);
        self.closed.store(true, Ordering::Release);
    }

    /// Steps 3–5 of the release protocol
    ///
    /// `native` runs only for a live, owned prior value. It must be
    /// self-contained: it may run on any thread, after the rest of the owning
    /// object is gone.
    pub(crate) fn release_with<F>(&self, kind: HandleKind, native: F) -> ReleaseOutcome
    where
        F: FnOnce(RawPtr) -> i32,
    {
        let prior = self.raw.swap(INVALID, Ordering::AcqRel);

        let outcome = if prior.is_null() {
            ReleaseOutcome::Empty
        } else if !self.owns {
            ReleaseOutcome::NotOwned
        } else {
            match catch_unwind(AssertUnwindSafe(|| native(prior))) {
                Ok(SQLITE_OK) => ReleaseOutcome::Released,
                Ok(code) => {
                    warn!(handle = %kind, code, "Native release reported failure");
                    ReleaseOutcome::Failed(code)
                }
                Err(_) => {
                    warn!(handle = %kind, "Native release panicked");
                    ReleaseOutcome::Failed(PANICKED)
                }
            }
        };

        self.closed.store(true, Ordering::Release);
        trace!(handle = %kind, outcome = ?outcome, "Handle released");
        outcome
    }
}

impl fmt::Debug for RawSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSlot")
            .field("raw", &self.load())
            .field("closed", &self.is_closed())
            .field("owns", &self.owns)
            .finish()
    }
}
