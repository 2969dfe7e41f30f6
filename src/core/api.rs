//! Native call boundary
//!
//! Every native call goes through a [`NativeApi`]: raw handles in, a status
//! code or raw handle out. Status codes are only ever read as zero/success vs
//! non-zero/failure. Which implementation backs a process is decided once,
//! by [`select_api`], not at each call site.

use crate::core::loader::{DynamicLoader, LoadedModule};
use crate::core::resolver::ResolvedLibrary;
use crate::error::{InteropError, Result};
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw native pointer (connection, statement, backup or blob)
pub type RawPtr = *mut c_void;

/// Invalid sentinel
pub const INVALID: RawPtr = ptr::null_mut();

pub const SQLITE_OK: i32 = 0;
pub const SQLITE_ERROR: i32 = 1;
pub const SQLITE_BUSY: i32 = 5;
pub const SQLITE_LOCKED: i32 = 6;
pub const SQLITE_MISUSE: i32 = 21;
pub const SQLITE_ROW: i32 = 100;
pub const SQLITE_DONE: i32 = 101;

/// Open flags passed through to `sqlite3_open_v2`
pub mod open_flags {
    pub const READ_ONLY: i32 = 0x0000_0001;
    pub const READ_WRITE: i32 = 0x0000_0002;
    pub const CREATE: i32 = 0x0000_0004;
    pub const URI: i32 = 0x0000_0040;
    pub const MEMORY: i32 = 0x0000_0080;
    pub const FULL_MUTEX: i32 = 0x0001_0000;
}

/// The native entry points this crate uses
///
/// # Safety
///
/// Implementations forward raw pointers to native code. Callers must pass
/// pointers that are either [`INVALID`] or live resources of the right kind;
/// release functions must tolerate [`INVALID`].
pub trait NativeApi: Send + Sync {
    /// Short description of the backing implementation
    fn name(&self) -> &str;

    /// `sqlite3_libversion`
    fn libversion(&self) -> String;

    unsafe fn open_v2(&self, filename: &CStr, flags: i32, out: &mut RawPtr) -> i32;
    /// Force-close: outstanding statements are finalized by the library
    unsafe fn close(&self, db: RawPtr) -> i32;
    unsafe fn errmsg(&self, db: RawPtr) -> String;

    /// Compile the first statement of `sql`; `consumed` receives how many
    /// bytes of `sql` it used, so the caller can continue from the tail
    unsafe fn prepare_v2(
        &self,
        db: RawPtr,
        sql: &str,
        out: &mut RawPtr,
        consumed: &mut usize,
    ) -> i32;
    unsafe fn step(&self, stmt: RawPtr) -> i32;
    unsafe fn finalize(&self, stmt: RawPtr) -> i32;

    unsafe fn backup_init(
        &self,
        dest: RawPtr,
        dest_name: &CStr,
        source: RawPtr,
        source_name: &CStr,
    ) -> RawPtr;
    unsafe fn backup_step(&self, backup: RawPtr, pages: i32) -> i32;
    unsafe fn backup_finish(&self, backup: RawPtr) -> i32;

    #[allow(clippy::too_many_arguments)]
    unsafe fn blob_open(
        &self,
        db: RawPtr,
        db_name: &CStr,
        table: &CStr,
        column: &CStr,
        row: i64,
        writable: bool,
        out: &mut RawPtr,
    ) -> i32;
    unsafe fn blob_bytes(&self, blob: RawPtr) -> i32;
    unsafe fn blob_close(&self, blob: RawPtr) -> i32;
}

unsafe fn copy_message(message: *const c_char) -> String {
    if message.is_null() {
        String::new()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    }
}

fn clamp_len(len: usize) -> c_int {
    len.min(c_int::MAX as usize) as c_int
}

/// Byte offset of a `pzTail` pointer into `sql`
fn tail_offset(sql: &str, tail: *const c_char) -> usize {
    if tail.is_null() {
        return sql.len();
    }
    (tail as usize)
        .saturating_sub(sql.as_ptr() as usize)
        .min(sql.len())
}

type OpenV2Fn = unsafe extern "C" fn(*const c_char, *mut RawPtr, c_int, *const c_char) -> c_int;
type CloseFn = unsafe extern "C" fn(RawPtr) -> c_int;
type ErrMsgFn = unsafe extern "C" fn(RawPtr) -> *const c_char;
type PrepareV2Fn =
    unsafe extern "C" fn(RawPtr, *const c_char, c_int, *mut RawPtr, *mut *const c_char) -> c_int;
type StepFn = unsafe extern "C" fn(RawPtr) -> c_int;
type FinalizeFn = unsafe extern "C" fn(RawPtr) -> c_int;
type NextStmtFn = unsafe extern "C" fn(RawPtr, RawPtr) -> RawPtr;
type BackupInitFn = unsafe extern "C" fn(RawPtr, *const c_char, RawPtr, *const c_char) -> RawPtr;
type BackupStepFn = unsafe extern "C" fn(RawPtr, c_int) -> c_int;
type BackupFinishFn = unsafe extern "C" fn(RawPtr) -> c_int;
type BlobOpenFn = unsafe extern "C" fn(
    RawPtr,
    *const c_char,
    *const c_char,
    *const c_char,
    i64,
    c_int,
    *mut RawPtr,
) -> c_int;
type BlobBytesFn = unsafe extern "C" fn(RawPtr) -> c_int;
type BlobCloseFn = unsafe extern "C" fn(RawPtr) -> c_int;
type LibVersionFn = unsafe extern "C" fn() -> *const c_char;

/// How a connection is force-closed
#[derive(Clone, Copy)]
enum CloseStrategy {
    /// Interop build export that finalizes outstanding statements itself
    Interop(CloseFn),
    /// Finalize every statement via `sqlite3_next_stmt`, then `sqlite3_close_v2`
    Standard { next_stmt: NextStmtFn, close_v2: CloseFn },
}

/// Which family of exports a module provides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// Interop build (`sqlite3_close_interop`, `sqlite3_finalize_interop`)
    Interop,
    /// Stock SQLite exports
    Standard,
}

/// Entry points resolved from a dynamically loaded module
pub struct DynamicApi {
    flavor: ApiFlavor,
    open_v2: OpenV2Fn,
    close: CloseStrategy,
    errmsg: ErrMsgFn,
    prepare_v2: PrepareV2Fn,
    step: StepFn,
    finalize: FinalizeFn,
    backup_init: BackupInitFn,
    backup_step: BackupStepFn,
    backup_finish: BackupFinishFn,
    blob_open: BlobOpenFn,
    blob_bytes: BlobBytesFn,
    blob_close: BlobCloseFn,
    libversion: LibVersionFn,
    description: String,
    // Keeps the module mapped for as long as any function pointer above may be called
    _module: Arc<dyn LoadedModule>,
}

/// Look up a required symbol and reinterpret it as a function pointer
///
/// # Safety
///
/// `T` must be the function pointer type matching the export.
unsafe fn required<T: Copy>(module: &dyn LoadedModule, name: &'static CStr) -> Result<T> {
    optional(module, name).ok_or(InteropError::MissingSymbol(
        name.to_str().unwrap_or("<non-utf8>"),
    ))
}

unsafe fn optional<T: Copy>(module: &dyn LoadedModule, name: &CStr) -> Option<T> {
    debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<RawPtr>());
    module
        .symbol(name)
        .map(|address| std::mem::transmute_copy::<RawPtr, T>(&address))
}

impl DynamicApi {
    /// Resolve every entry point from a module, once
    pub fn bind(module: Arc<dyn LoadedModule>) -> Result<Self> {
        // SAFETY: each type alias matches the C prototype of the named export
        unsafe {
            let m = module.as_ref();

            let interop_close: Option<CloseFn> = optional(m, c"sqlite3_close_interop");
            let interop_finalize: Option<FinalizeFn> = optional(m, c"sqlite3_finalize_interop");

            let (flavor, close, finalize) = match (interop_close, interop_finalize) {
                (Some(close), Some(finalize)) => {
                    (ApiFlavor::Interop, CloseStrategy::Interop(close), finalize)
                }
                _ => (
                    ApiFlavor::Standard,
                    CloseStrategy::Standard {
                        next_stmt: required(m, c"sqlite3_next_stmt")?,
                        close_v2: required(m, c"sqlite3_close_v2")?,
                    },
                    required(m, c"sqlite3_finalize")?,
                ),
            };

            let api = DynamicApi {
                flavor,
                open_v2: required(m, c"sqlite3_open_v2")?,
                close,
                errmsg: required(m, c"sqlite3_errmsg")?,
                prepare_v2: required(m, c"sqlite3_prepare_v2")?,
                step: required(m, c"sqlite3_step")?,
                finalize,
                backup_init: required(m, c"sqlite3_backup_init")?,
                backup_step: required(m, c"sqlite3_backup_step")?,
                backup_finish: required(m, c"sqlite3_backup_finish")?,
                blob_open: required(m, c"sqlite3_blob_open")?,
                blob_bytes: required(m, c"sqlite3_blob_bytes")?,
                blob_close: required(m, c"sqlite3_blob_close")?,
                libversion: required(m, c"sqlite3_libversion")?,
                description: format!("dynamic:{}", module.path().display()),
                _module: Arc::clone(&module),
            };

            debug!(module = %module.path().display(), flavor = ?api.flavor, "Bound native entry points");
            Ok(api)
        }
    }

    pub fn flavor(&self) -> ApiFlavor {
        self.flavor
    }
}

impl NativeApi for DynamicApi {
    fn name(&self) -> &str {
        &self.description
    }

    fn libversion(&self) -> String {
        // SAFETY: returns a pointer to a static string
        unsafe { copy_message((self.libversion)()) }
    }

    unsafe fn open_v2(&self, filename: &CStr, flags: i32, out: &mut RawPtr) -> i32 {
        (self.open_v2)(filename.as_ptr(), out, flags, ptr::null())
    }

    unsafe fn close(&self, db: RawPtr) -> i32 {
        match self.close {
            CloseStrategy::Interop(close) => close(db),
            CloseStrategy::Standard { next_stmt, close_v2 } => {
                if !db.is_null() {
                    let mut stmt = next_stmt(db, INVALID);
                    while !stmt.is_null() {
                        (self.finalize)(stmt);
                        stmt = next_stmt(db, INVALID);
                    }
                }
                close_v2(db)
            }
        }
    }

    unsafe fn errmsg(&self, db: RawPtr) -> String {
        copy_message((self.errmsg)(db))
    }

    unsafe fn prepare_v2(
        &self,
        db: RawPtr,
        sql: &str,
        out: &mut RawPtr,
        consumed: &mut usize,
    ) -> i32 {
        let mut tail: *const c_char = ptr::null();
        let rc = (self.prepare_v2)(
            db,
            sql.as_ptr() as *const c_char,
            clamp_len(sql.len()),
            out,
            &mut tail,
        );
        *consumed = tail_offset(sql, tail);
        rc
    }

    unsafe fn step(&self, stmt: RawPtr) -> i32 {
        (self.step)(stmt)
    }

    unsafe fn finalize(&self, stmt: RawPtr) -> i32 {
        (self.finalize)(stmt)
    }

    unsafe fn backup_init(
        &self,
        dest: RawPtr,
        dest_name: &CStr,
        source: RawPtr,
        source_name: &CStr,
    ) -> RawPtr {
        (self.backup_init)(dest, dest_name.as_ptr(), source, source_name.as_ptr())
    }

    unsafe fn backup_step(&self, backup: RawPtr, pages: i32) -> i32 {
        (self.backup_step)(backup, pages)
    }

    unsafe fn backup_finish(&self, backup: RawPtr) -> i32 {
        (self.backup_finish)(backup)
    }

    unsafe fn blob_open(
        &self,
        db: RawPtr,
        db_name: &CStr,
        table: &CStr,
        column: &CStr,
        row: i64,
        writable: bool,
        out: &mut RawPtr,
    ) -> i32 {
        (self.blob_open)(
            db,
            db_name.as_ptr(),
            table.as_ptr(),
            column.as_ptr(),
            row,
            writable as c_int,
            out,
        )
    }

    unsafe fn blob_bytes(&self, blob: RawPtr) -> i32 {
        (self.blob_bytes)(blob)
    }

    unsafe fn blob_close(&self, blob: RawPtr) -> i32 {
        (self.blob_close)(blob)
    }
}

/// The SQLite build statically linked through `libsqlite3-sys`
#[cfg(feature = "bundled")]
#[derive(Debug, Default, Clone, Copy)]
pub struct BundledApi;

#[cfg(feature = "bundled")]
mod bundled {
    use super::*;
    use libsqlite3_sys as ffi;

    // libsqlite3-sys blocklists this symbol from its generated bindings
    extern "C" {
        fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
    }

    impl NativeApi for BundledApi {
        fn name(&self) -> &str {
            "bundled"
        }

        fn libversion(&self) -> String {
            // SAFETY: returns a pointer to a static string
            unsafe { copy_message(ffi::sqlite3_libversion()) }
        }

        unsafe fn open_v2(&self, filename: &CStr, flags: i32, out: &mut RawPtr) -> i32 {
            let mut db: *mut ffi::sqlite3 = ptr::null_mut();
            let rc = ffi::sqlite3_open_v2(filename.as_ptr(), &mut db, flags, ptr::null());
            *out = db as RawPtr;
            rc
        }

        unsafe fn close(&self, db: RawPtr) -> i32 {
            let db = db as *mut ffi::sqlite3;
            if !db.is_null() {
                let mut stmt = ffi::sqlite3_next_stmt(db, ptr::null_mut());
                while !stmt.is_null() {
                    ffi::sqlite3_finalize(stmt);
                    stmt = ffi::sqlite3_next_stmt(db, ptr::null_mut());
                }
            }
            sqlite3_close_v2(db)
        }

        unsafe fn errmsg(&self, db: RawPtr) -> String {
            copy_message(ffi::sqlite3_errmsg(db as *mut ffi::sqlite3))
        }

        unsafe fn prepare_v2(
            &self,
            db: RawPtr,
            sql: &str,
            out: &mut RawPtr,
            consumed: &mut usize,
        ) -> i32 {
            let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
            let mut tail: *const c_char = ptr::null();
            let rc = ffi::sqlite3_prepare_v2(
                db as *mut ffi::sqlite3,
                sql.as_ptr() as *const c_char,
                clamp_len(sql.len()),
                &mut stmt,
                &mut tail,
            );
            *out = stmt as RawPtr;
            *consumed = tail_offset(sql, tail);
            rc
        }

        unsafe fn step(&self, stmt: RawPtr) -> i32 {
            ffi::sqlite3_step(stmt as *mut ffi::sqlite3_stmt)
        }

        unsafe fn finalize(&self, stmt: RawPtr) -> i32 {
            ffi::sqlite3_finalize(stmt as *mut ffi::sqlite3_stmt)
        }

        unsafe fn backup_init(
            &self,
            dest: RawPtr,
            dest_name: &CStr,
            source: RawPtr,
            source_name: &CStr,
        ) -> RawPtr {
            ffi::sqlite3_backup_init(
                dest as *mut ffi::sqlite3,
                dest_name.as_ptr(),
                source as *mut ffi::sqlite3,
                source_name.as_ptr(),
            ) as RawPtr
        }

        unsafe fn backup_step(&self, backup: RawPtr, pages: i32) -> i32 {
            ffi::sqlite3_backup_step(backup as *mut ffi::sqlite3_backup, pages)
        }

        unsafe fn backup_finish(&self, backup: RawPtr) -> i32 {
            ffi::sqlite3_backup_finish(backup as *mut ffi::sqlite3_backup)
        }

        unsafe fn blob_open(
            &self,
            db: RawPtr,
            db_name: &CStr,
            table: &CStr,
            column: &CStr,
            row: i64,
            writable: bool,
            out: &mut RawPtr,
        ) -> i32 {
            let mut blob: *mut ffi::sqlite3_blob = ptr::null_mut();
            let rc = ffi::sqlite3_blob_open(
                db as *mut ffi::sqlite3,
                db_name.as_ptr(),
                table.as_ptr(),
                column.as_ptr(),
                row,
                writable as c_int,
                &mut blob,
            );
            *out = blob as RawPtr;
            rc
        }

        unsafe fn blob_bytes(&self, blob: RawPtr) -> i32 {
            ffi::sqlite3_blob_bytes(blob as *mut ffi::sqlite3_blob)
        }

        unsafe fn blob_close(&self, blob: RawPtr) -> i32 {
            ffi::sqlite3_blob_close(blob as *mut ffi::sqlite3_blob)
        }
    }
}

/// Pick the API for a resolution result
///
/// 1. the resolved module, when one was loaded and exports everything needed
/// 2. the resolved file name through the OS loader's own search path
/// 3. the statically linked build, when compiled in
pub fn select_api(
    resolved: &ResolvedLibrary,
    loader: &dyn DynamicLoader,
) -> Result<Arc<dyn NativeApi>> {
    if let Some(module) = resolved.module() {
        match DynamicApi::bind(Arc::clone(module)) {
            Ok(api) => return Ok(Arc::new(api)),
            Err(e) => warn!(error = %e, "Resolved module is missing entry points"),
        }
    }

    let deferred = match loader
        .load(resolved.file_path())
        .and_then(DynamicApi::bind)
    {
        Ok(api) => return Ok(Arc::new(api)),
        Err(e) => e,
    };

    #[cfg(feature = "bundled")]
    {
        debug!(error = %deferred, "Falling back to the bundled SQLite build");
        Ok(Arc::new(BundledApi))
    }

    #[cfg(not(feature = "bundled"))]
    {
        Err(InteropError::ApiUnavailable(deferred.to_string()))
    }
}
