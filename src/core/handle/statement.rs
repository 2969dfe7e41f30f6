//! Prepared statement handle

use super::child::ChildCore;
use super::connection::{step_status, ConnectionHandle};
use super::{HandleKind, NativeHandle, ReleaseOutcome};
use crate::core::api::RawPtr;
use crate::error::{InteropError, Result};

/// Owns one prepared statement
#[derive(Debug)]
pub struct StatementHandle {
    core: ChildCore,
}

impl StatementHandle {
    /// Adopt a raw statement prepared on `connection`
    pub fn new(connection: &ConnectionHandle, raw: RawPtr) -> Self {
        Self {
            core: ChildCore::new(connection, raw),
        }
    }

    /// Advance one step: `true` when a row is available, `false` when done
    pub fn step(&self) -> Result<bool> {
        let raw = self.core.live_raw(HandleKind::Statement)?;
        // SAFETY: live statement whose connection is still at our generation
        let rc = unsafe { self.core.api().step(raw) };
        step_status(rc).ok_or_else(|| InteropError::native(rc, "statement step failed"))
    }

    /// Connection generation captured at creation
    pub fn connection_generation(&self) -> u64 {
        self.core.parent_generation()
    }

    /// Whether the owning connection has been closed since creation
    pub fn is_stale(&self) -> bool {
        self.core.is_stale()
    }
}

impl NativeHandle for StatementHandle {
    fn kind(&self) -> HandleKind {
        HandleKind::Statement
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
            .release(HandleKind::Statement, |api, raw| unsafe { api.finalize(raw) })
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handle::testing::CountingApi;
    use std::sync::Arc;

    fn setup() -> (Arc<CountingApi>, ConnectionHandle) {
        let api = Arc::new(CountingApi::new());
        let conn = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        (api, conn)
    }

    #[test]
    fn test_finalize_once() {
        let (api, conn) = setup();
        let stmt = conn.prepare("SELECT 1").unwrap();
        let raw = stmt.as_raw();

        assert_eq!(stmt.release(), ReleaseOutcome::Released);
        assert_eq!(stmt.release(), ReleaseOutcome::AlreadyClosed);
        drop(stmt);

        assert_eq!(api.released("finalize", raw), 1);
    }

    #[test]
    fn test_parent_closed_first_skips_finalize() {
        let (api, conn) = setup();
        let stmt = conn.prepare("SELECT 1").unwrap();

        conn.close();
        assert!(stmt.is_stale());
        assert_eq!(stmt.release(), ReleaseOutcome::Stale);
        assert!(stmt.is_closed());
        assert!(stmt.is_invalid());
        drop(stmt);

        assert_eq!(api.count("finalize"), 0);
        assert_eq!(api.count("close"), 1);
    }

    #[test]
    fn test_parent_dropped_first_skips_finalize() {
        let (api, conn) = setup();
        let stmt = conn.prepare("SELECT 1").unwrap();
        drop(conn);
        drop(stmt);
        assert_eq!(api.count("finalize"), 0);
    }

    #[test]
    fn test_statement_created_after_bump_is_current() {
        let (api, conn) = setup();
        let old = conn.prepare("SELECT 1").unwrap();
        conn.bump_generation();
        let fresh = conn.prepare("SELECT 2").unwrap();

        assert_eq!(old.connection_generation(), 0);
        assert_eq!(fresh.connection_generation(), 1);
        assert_eq!(old.release(), ReleaseOutcome::Stale);
        assert_eq!(fresh.release(), ReleaseOutcome::Released);
        assert_eq!(api.count("finalize"), 1);
    }

    #[test]
    fn test_step_on_stale_statement_refused() {
        let (_api, conn) = setup();
        let stmt = conn.prepare("SELECT 1").unwrap();
        conn.close();
        assert!(matches!(
            stmt.step(),
            Err(InteropError::InvalidHandle("statement"))
        ));
    }

    #[test]
    fn test_alias_connection_children_still_finalize() {
        let api = Arc::new(CountingApi::new());
        let alias = ConnectionHandle::new(api.clone(), api.fabricate(), false);
        let stmt = alias.prepare("SELECT 1").unwrap();

        alias.release();
        assert!(!stmt.is_stale());
        assert_eq!(stmt.release(), ReleaseOutcome::Released);
    }

    #[test]
    fn test_dropped_alias_does_not_orphan_children() {
        let api = Arc::new(CountingApi::new());
        let raw = api.fabricate();
        let alias = ConnectionHandle::new(api.clone(), raw, false);
        let stmt = alias.prepare("SELECT 1").unwrap();
        let blob = alias.open_blob("main", "t", "c", 1, false).unwrap();

        drop(alias);

        assert!(!stmt.is_stale());
        assert_eq!(stmt.release(), ReleaseOutcome::Released);
        assert_eq!(blob.release(), ReleaseOutcome::Released);
        assert_eq!(api.count("finalize"), 1);
        assert_eq!(api.count("blob_close"), 1);
        assert_eq!(api.count("close"), 0);
    }

    #[test]
    fn test_panicking_finalize_contained() {
        let (api, conn) = setup();
        let stmt = conn.prepare("SELECT 1").unwrap();
        api.panic_on_release
            .store(true, std::sync::atomic::Ordering::Relaxed);

        assert_eq!(stmt.release(), ReleaseOutcome::Failed(crate::core::handle::PANICKED));
        assert!(stmt.is_closed());

        api.panic_on_release
            .store(false, std::sync::atomic::Ordering::Relaxed);
        drop(conn);
    }

    #[cfg(feature = "bundled")]
    #[test]
    fn test_bundled_statement_lifecycle() {
        use crate::core::api::{open_flags, BundledApi};

        let conn = ConnectionHandle::open(
            Arc::new(BundledApi),
            ":memory:",
            open_flags::READ_WRITE | open_flags::CREATE,
        )
        .unwrap();

        let stmt = conn.prepare("SELECT 1 UNION ALL SELECT 2").unwrap();
        assert!(stmt.step().unwrap());
        assert!(stmt.step().unwrap());
        assert!(!stmt.step().unwrap());
        assert_eq!(stmt.release(), ReleaseOutcome::Released);
    }

    #[cfg(feature = "bundled")]
    #[test]
    fn test_bundled_force_close_then_statement_drop() {
        use crate::core::api::{open_flags, BundledApi};

        let conn = ConnectionHandle::open(
            Arc::new(BundledApi),
            ":memory:",
            open_flags::READ_WRITE | open_flags::CREATE,
        )
        .unwrap();
        let stmt = conn.prepare("SELECT 1").unwrap();

        // Close finalizes the statement natively; the handle must not try again
        assert_eq!(conn.close(), ReleaseOutcome::Released);
        assert_eq!(stmt.release(), ReleaseOutcome::Stale);
    }
}
