//! Online backup handle

use super::child::{ChildCore, ParentRef};
use super::connection::ConnectionHandle;
use super::{HandleKind, NativeHandle, ReleaseOutcome};
use crate::core::api::{RawPtr, SQLITE_BUSY, SQLITE_DONE, SQLITE_ERROR, SQLITE_LOCKED, SQLITE_OK};
use crate::error::{InteropError, Result};
use std::ffi::CString;
use std::fmt;
use tracing::debug;

/// Owns one `sqlite3_backup`
///
/// Both connections track the backup. Whichever of them closes (or bumps its
/// generation) first finishes it, so neither is left open inside the library
/// waiting on a backup nobody will finish.
pub struct BackupHandle {
    core: ChildCore,
    source: Option<ParentRef>,
}

/// Result of one backup step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStep {
    /// Every page has been copied
    Done,
    /// More pages remain
    More,
    /// Source or destination is busy or locked; retry later
    Busy,
}

impl BackupHandle {
    /// Adopt a raw backup whose destination is `destination`
    pub fn new(destination: &ConnectionHandle, raw: RawPtr) -> Self {
        let core = ChildCore::new(destination, raw);
        destination.lineage().register_backup(core.slot());
        Self { core, source: None }
    }

    /// Start a backup from `source`'s `source_name` database into
    /// `destination`'s `destination_name` database
    pub fn init(
        destination: &ConnectionHandle,
        destination_name: &str,
        source: &ConnectionHandle,
        source_name: &str,
    ) -> Result<Self> {
        let dest_raw = destination.as_raw();
        let source_raw = source.as_raw();
        if dest_raw.is_null() || source_raw.is_null() {
            return Err(InteropError::InvalidHandle(HandleKind::Connection.as_str()));
        }

        let dest_name = CString::new(destination_name)
            .map_err(|_| InteropError::NulInPath(destination_name.to_string()))?;
        let source_name_c = CString::new(source_name)
            .map_err(|_| InteropError::NulInPath(source_name.to_string()))?;

        // SAFETY: both connections are live; names outlive the call
        let raw = unsafe {
            destination
                .api()
                .backup_init(dest_raw, &dest_name, source_raw, &source_name_c)
        };
        if raw.is_null() {
            return Err(InteropError::native(SQLITE_ERROR, destination.last_error()));
        }

        debug!(destination = destination_name, source = source_name, "Backup started");
        let mut backup = Self::new(destination, raw);
        source.lineage().register_backup(backup.core.slot());
        backup.source = Some(ParentRef::snapshot(source));
        Ok(backup)
    }

    /// Copy up to `pages` pages; a negative count copies everything remaining
    pub fn step(&self, pages: i32) -> Result<BackupStep> {
        let raw = self.core.live_raw(HandleKind::Backup)?;
        // SAFETY: live backup whose destination is still at our generation
        match unsafe { self.core.api().backup_step(raw, pages) } {
            SQLITE_DONE => Ok(BackupStep::Done),
            SQLITE_OK => Ok(BackupStep::More),
            SQLITE_BUSY | SQLITE_LOCKED => Ok(BackupStep::Busy),
            rc => Err(InteropError::native(rc, "backup step failed")),
        }
    }

    /// Step until done, then finish the backup
    pub fn run_to_completion(&self) -> Result<()> {
        loop {
            match self.step(-1)? {
                BackupStep::Done => break,
                BackupStep::More | BackupStep::Busy => std::thread::yield_now(),
            }
        }
        match self.release() {
            ReleaseOutcome::Failed(code) => Err(InteropError::native(code, "backup finish failed")),
            _ => Ok(()),
        }
    }

    /// Whether either connection has moved on since the backup started
    pub fn is_stale(&self) -> bool {
        self.core.is_stale() || self.source.as_ref().is_some_and(|s| !s.is_current())
    }
}

impl fmt::Debug for BackupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupHandle")
            .field("core", &self.core)
            .field("source_generation", &self.source.as_ref().map(ParentRef::generation))
            .finish()
    }
}

impl NativeHandle for BackupHandle {
    fn kind(&self) -> HandleKind {
        HandleKind::Backup
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
            .release(HandleKind::Backup, |api, raw| unsafe { api.backup_finish(raw) })
    }
}

impl Drop for BackupHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::handle::testing::CountingApi;
    use std::sync::Arc;

    #[test]
    fn test_finish_once() {
        let api = Arc::new(CountingApi::new());
        let dest = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let source = ConnectionHandle::new(api.clone(), api.fabricate(), true);

        let backup = BackupHandle::init(&dest, "main", &source, "main").unwrap();
        let raw = backup.as_raw();
        assert_eq!(backup.step(-1).unwrap(), BackupStep::Done);
        assert_eq!(backup.release(), ReleaseOutcome::Released);
        drop(backup);

        assert_eq!(api.released("backup_finish", raw), 1);
    }

    #[test]
    fn test_destination_closed_first_finishes_backup() {
        let api = Arc::new(CountingApi::new());
        let dest = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let source = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let backup = source.backup_into(&dest).unwrap();

        dest.close();
        assert!(backup.is_stale());
        assert!(backup.is_closed());
        assert_eq!(backup.release(), ReleaseOutcome::AlreadyClosed);
        drop(backup);
        assert_eq!(api.count("backup_finish"), 1);
    }

    #[test]
    fn test_source_closed_first_finishes_backup() {
        let api = Arc::new(CountingApi::new());
        let dest = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let source = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let backup = source.backup_into(&dest).unwrap();

        assert_eq!(source.close(), ReleaseOutcome::Released);
        assert!(backup.is_stale());
        assert!(matches!(
            backup.step(1),
            Err(InteropError::InvalidHandle("backup"))
        ));
        drop(backup);
        drop(dest);
        assert_eq!(api.count("backup_finish"), 1);
        assert_eq!(api.count("close"), 2);
    }

    #[test]
    fn test_bump_generation_finishes_backup() {
        let api = Arc::new(CountingApi::new());
        let dest = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let source = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let backup = source.backup_into(&dest).unwrap();

        dest.bump_generation();
        assert!(backup.is_closed());
        assert_eq!(api.count("backup_finish"), 1);
        assert_eq!(api.count("close"), 0);
    }

    #[test]
    fn test_finished_backup_not_finished_again_by_close() {
        let api = Arc::new(CountingApi::new());
        let dest = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let source = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let backup = source.backup_into(&dest).unwrap();

        assert_eq!(backup.release(), ReleaseOutcome::Released);
        dest.close();
        source.close();
        assert_eq!(api.count("backup_finish"), 1);
    }

    #[test]
    fn test_init_on_closed_connection() {
        let api = Arc::new(CountingApi::new());
        let dest = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        let source = ConnectionHandle::new(api.clone(), api.fabricate(), true);
        source.close();

        let err = BackupHandle::init(&dest, "main", &source, "main").err().unwrap();
        assert!(matches!(err, InteropError::InvalidHandle("connection")));
    }

    #[cfg(feature = "bundled")]
    #[test]
    fn test_bundled_backup_copies_rows() {
        use crate::core::api::{open_flags, BundledApi};

        let api: Arc<dyn crate::core::api::NativeApi> = Arc::new(BundledApi);
        let flags = open_flags::READ_WRITE | open_flags::CREATE;
        let source = ConnectionHandle::open(api.clone(), ":memory:", flags).unwrap();
        let dest = ConnectionHandle::open(api, ":memory:", flags).unwrap();

        source
            .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (42);")
            .unwrap();

        let backup = source.backup_into(&dest).unwrap();
        backup.run_to_completion().unwrap();
        assert!(backup.is_closed());

        assert!(dest.query_row_exists("SELECT x FROM t WHERE x = 42").unwrap());
    }
}
