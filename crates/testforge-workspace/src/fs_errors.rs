use std::io::{Error as IoError, ErrorKind};

/// Windows `ERROR_SHARING_VIOLATION`.
#[cfg(windows)]
const SHARING_VIOLATION: i32 = 32;
/// Windows `ERROR_LOCK_VIOLATION`.
#[cfg(windows)]
const LOCK_VIOLATION: i32 = 33;
/// `EBUSY`.
#[cfg(unix)]
const BUSY: i32 = 16;
/// `ETXTBSY`.
#[cfg(unix)]
const TEXT_FILE_BUSY: i32 = 26;

/// Returns `true` when the error means another process holds the file.
///
/// Permission, busy and sharing-violation errors all count. "Not found"
/// never does.
pub fn is_lock_error(error: &IoError) -> bool {
    if matches!(
        error.kind(),
        ErrorKind::PermissionDenied | ErrorKind::ResourceBusy
    ) {
        return true;
    }
    error.raw_os_error().is_some_and(is_lock_code)
}

#[cfg(windows)]
fn is_lock_code(code: i32) -> bool {
    code == SHARING_VIOLATION || code == LOCK_VIOLATION
}

#[cfg(unix)]
fn is_lock_code(code: i32) -> bool {
    code == BUSY || code == TEXT_FILE_BUSY
}

#[cfg(not(any(unix, windows)))]
fn is_lock_code(_code: i32) -> bool {
    false
}

/// Returns `true` when the target simply does not exist.
pub fn is_not_found(error: &IoError) -> bool {
    error.kind() == ErrorKind::NotFound
}
