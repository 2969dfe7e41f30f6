//! Processor architecture detection and the architecture→platform table

use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use tracing::debug;

/// Environment variable reporting the processor architecture (Windows convention)
pub const REPORTED_ARCH_VAR: &str = "PROCESSOR_ARCHITECTURE";

/// Base name of the native library, before width qualification
pub const LIBRARY_STEM: &str = "sqlite3-interop";

/// Plain library name handed to the OS loader when nothing else is known
pub const UNQUALIFIED_LIBRARY_NAME: &str = "sqlite3";

/// Architecture token → platform directory name (case-insensitive keys)
const PLATFORMS: &[(&str, &str)] = &[
    ("x86", "Win32"),
    ("i386", "Win32"),
    ("i486", "Win32"),
    ("i586", "Win32"),
    ("i686", "Win32"),
    ("x86_64", "x64"),
    ("amd64", "x64"),
    ("x64", "x64"),
    ("ia64", "Itanium"),
    ("arm", "WinCE"),
    ("arm64", "ARM64"),
    ("aarch64", "ARM64"),
];

/// 64-bit tokens and the 32-bit token they degrade to in a 32-bit process
const DOWNGRADES: &[(&str, &str)] = &[
    ("amd64", "x86"),
    ("x86_64", "x86"),
    ("ia64", "x86"),
    ("arm64", "ARM"),
    ("aarch64", "ARM"),
];

/// Platform directory name for an architecture token
pub fn platform_for(arch: &str) -> Option<&'static str> {
    PLATFORMS
        .iter()
        .find(|(token, _)| token.eq_ignore_ascii_case(arch.trim()))
        .map(|&(_, platform)| platform)
}

/// Degrade a reported 64-bit token when the process is 32-bit
///
/// Some environments report the machine's architecture (e.g. `AMD64`) to a
/// 32-bit process running under emulation.
pub fn correct_for_pointer_width(reported: &str, pointer_width: usize) -> String {
    if pointer_width == 4 {
        if let Some(&(_, narrow)) = DOWNGRADES
            .iter()
            .find(|(wide, _)| wide.eq_ignore_ascii_case(reported.trim()))
        {
            debug!(reported, corrected = narrow, "Downgraded 64-bit architecture token");
            return narrow.to_string();
        }
    }
    reported.trim().to_string()
}

/// Determine the architecture token
///
/// Order: explicit override (verbatim), then the environment-reported value
/// corrected for pointer width, then the native OS query.
pub fn detect_architecture<F>(
    override_value: Option<&str>,
    reported: Option<&str>,
    pointer_width: usize,
    native_query: F,
) -> Option<String>
where
    F: FnOnce() -> Option<String>,
{
    if let Some(value) = override_value.map(str::trim).filter(|v| !v.is_empty()) {
        return Some(value.to_string());
    }

    if let Some(value) = reported.map(str::trim).filter(|v| !v.is_empty()) {
        return Some(correct_for_pointer_width(value, pointer_width));
    }

    native_query().filter(|v| !v.trim().is_empty())
}

/// Ask the operating system for the machine architecture
#[cfg(unix)]
pub fn query_native_architecture() -> Option<String> {
    use std::ffi::CStr;

    // SAFETY: utsname is plain old data, uname fills it in place and the
    // machine field is NUL terminated on success.
    unsafe {
        let mut info: libc::utsname = std::mem::zeroed();
        if libc::uname(&mut info) != 0 {
            return None;
        }
        let machine = CStr::from_ptr(info.machine.as_ptr());
        machine.to_str().ok().map(str::to_string)
    }
}

/// Ask the operating system for the machine architecture
#[cfg(not(unix))]
pub fn query_native_architecture() -> Option<String> {
    Some(std::env::consts::ARCH.to_string())
}

/// Architecture-qualified default library file name
///
/// `libsqlite3-interop-64.so`, `sqlite3-interop-32.dll`, ...
pub fn default_library_file_name(pointer_width: usize) -> String {
    format!(
        "{}{}-{}{}",
        DLL_PREFIX,
        LIBRARY_STEM,
        pointer_width * 8,
        DLL_SUFFIX
    )
}

/// Unqualified library file name, e.g. `libsqlite3.so` or `sqlite3.dll`
pub fn unqualified_library_file_name() -> String {
    format!("{}{}{}", DLL_PREFIX, UNQUALIFIED_LIBRARY_NAME, DLL_SUFFIX)
}

/// Pointer width of this process in bytes
pub const fn process_pointer_width() -> usize {
    std::mem::size_of::<usize>()
}
