//! Dynamic loading primitive
//!
//! `dlopen` on Unix, `LoadLibraryW` on Windows. A bare file name (no directory
//! component) is handed to the OS loader untouched so its own search path
//! applies.

use crate::error::{InteropError, Result};
use std::ffi::{c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A module mapped into the process
pub trait LoadedModule: Send + Sync {
    /// Path (or bare name) the module was loaded from
    fn path(&self) -> &Path;

    /// Address of an exported symbol, `None` when not exported
    fn symbol(&self, name: &CStr) -> Option<*mut c_void>;
}

/// Loads modules from disk
pub trait DynamicLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>>;
}

/// Module loaded through the platform loader; unloaded when the last
/// reference is dropped
#[derive(Debug)]
pub struct SystemModule {
    handle: *mut c_void,
    path: PathBuf,
}

// SAFETY: module handles are process-wide opaque values; dlsym/GetProcAddress
// and dlclose/FreeLibrary may be called from any thread.
unsafe impl Send for SystemModule {}
unsafe impl Sync for SystemModule {}

impl LoadedModule for SystemModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &CStr) -> Option<*mut c_void> {
        // SAFETY: handle came from a successful open and is still loaded
        let address = unsafe { sys::symbol(self.handle, name) };
        (!address.is_null()).then_some(address)
    }
}

impl Drop for SystemModule {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // SAFETY: handle came from a successful open and is closed once
            unsafe { sys::close(self.handle) };
            debug!(path = %self.path.display(), "Unloaded native module");
        }
    }
}

/// The platform loader
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl DynamicLoader for SystemLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>> {
        // SAFETY: loading a library runs its initialisers; the caller picked
        // the file, and a failed load leaves no handle behind.
        let handle = unsafe { sys::open(path)? };
        debug!(path = %path.display(), "Loaded native module");
        Ok(Arc::new(SystemModule {
            handle,
            path: path.to_path_buf(),
        }))
    }
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    pub unsafe fn open(path: &Path) -> Result<*mut c_void> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| InteropError::NulInPath(path.display().to_string()))?;

        let handle = libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
        if handle.is_null() {
            return Err(InteropError::Load {
                path: path.to_path_buf(),
                message: last_error(),
            });
        }
        Ok(handle)
    }

    pub unsafe fn symbol(handle: *mut c_void, name: &CStr) -> *mut c_void {
        libc::dlsym(handle, name.as_ptr())
    }

    pub unsafe fn close(handle: *mut c_void) {
        libc::dlclose(handle);
    }

    unsafe fn last_error() -> String {
        let message = libc::dlerror();
        if message.is_null() {
            "unknown dlopen failure".to_string()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use std::os::raw::c_char;
    use std::os::windows::ffi::OsStrExt;

    #[link(name = "kernel32")]
    extern "system" {
        fn LoadLibraryW(name: *const u16) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const c_char) -> *mut c_void;
        fn FreeLibrary(module: *mut c_void) -> i32;
        fn GetLastError() -> u32;
    }

    pub unsafe fn open(path: &Path) -> Result<*mut c_void> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        if wide[..wide.len() - 1].contains(&0) {
            return Err(InteropError::NulInPath(path.display().to_string()));
        }

        let handle = LoadLibraryW(wide.as_ptr());
        if handle.is_null() {
            return Err(InteropError::Load {
                path: path.to_path_buf(),
                message: format!("LoadLibraryW failed with error {}", GetLastError()),
            });
        }
        Ok(handle)
    }

    pub unsafe fn symbol(handle: *mut c_void, name: &CStr) -> *mut c_void {
        GetProcAddress(handle, name.as_ptr())
    }

    pub unsafe fn close(handle: *mut c_void) {
        FreeLibrary(handle);
    }
}
