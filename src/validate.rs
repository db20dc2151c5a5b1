//! Local validation of paths, permissions and payload bytes.
//!
//! Everything here runs before any I/O, so a malformed argument never costs
//! a round trip.

use crate::error::{Result, XsError};

/// Longest path XenStore accepts.
pub const MAX_PATH_LEN: usize = 3072;

/// Watch paths that name domain lifecycle events instead of nodes.
pub const SPECIAL_WATCH_PATHS: [&[u8]; 2] = [b"@introduceDomain", b"@releaseDomain"];

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn is_path_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'/' | b'_' | b'@')
}

/// Check that `path` is a well-formed absolute node path.
///
/// Rules: starts with `/`, at most [`MAX_PATH_LEN`] bytes, only ASCII
/// alphanumerics and `-/_@`, no trailing `/` except the root, no `//`.
pub fn validate_path(path: &[u8]) -> Result<()> {
    if path.first() != Some(&b'/') {
        return Err(XsError::invalid_path(format!(
            "{:?} is not an absolute path",
            lossy(path)
        )));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(XsError::invalid_path(format!(
            "path of {} bytes exceeds {} byte limit",
            path.len(),
            MAX_PATH_LEN
        )));
    }
    if !path.iter().copied().all(is_path_byte) {
        return Err(XsError::invalid_path(format!(
            "{:?} contains invalid characters",
            lossy(path)
        )));
    }
    if path.len() > 1 && path.ends_with(b"/") {
        return Err(XsError::invalid_path(format!(
            "{:?} has a trailing slash",
            lossy(path)
        )));
    }
    if path.windows(2).any(|w| w == b"//") {
        return Err(XsError::invalid_path(format!(
            "{:?} contains an empty component",
            lossy(path)
        )));
    }
    Ok(())
}

/// Check a watch path: a special `@` name or a regular node path.
pub fn validate_watch_path(path: &[u8]) -> Result<()> {
    if path.first() == Some(&b'@') {
        if SPECIAL_WATCH_PATHS.contains(&path) {
            return Ok(());
        }
        return Err(XsError::invalid_path(format!(
            "{:?} is not a known special watch path",
            lossy(path)
        )));
    }
    validate_path(path)
}

/// Check permission strings of the form `[wrbn]<domid>`.
pub fn validate_permissions<P: AsRef<[u8]>>(perms: &[P]) -> Result<()> {
    for perm in perms {
        let perm = perm.as_ref();
        let valid = match perm.split_first() {
            Some((mode, domid)) => {
                matches!(*mode, b'w' | b'r' | b'b' | b'n')
                    && !domid.is_empty()
                    && domid.iter().all(u8::is_ascii_digit)
            }
            None => false,
        };
        if !valid {
            return Err(XsError::invalid_permission(format!(
                "{:?} does not match [wrbn]<domid>",
                lossy(perm)
            )));
        }
    }
    Ok(())
}

/// Reject bytes outside 7-bit printable ASCII (NUL separators allowed).
pub fn validate_payload_bytes(arg: &[u8]) -> Result<()> {
    match arg.iter().position(|&b| b != 0 && !(0x20..=0x7f).contains(&b)) {
        Some(pos) => Err(XsError::InvalidPayload(format!(
            "byte 0x{:02x} at offset {} is not 7-bit ASCII",
            arg[pos], pos
        ))),
        None => Ok(()),
    }
}
