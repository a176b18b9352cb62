//! Switching the calling process's effective identity to that of a connected peer.

use std::ffi::CString;

use crate::error::Error;
use crate::error::Result;

/// Switches the process's real, effective, and saved uid/gid to `uid`/`gid`, optionally
/// initializing the supplementary group list for the named user first.
///
/// Group switching must happen before uid switching (dropping uid privilege first would make
/// `initgroups(3)` fail), matching `russ_switch_userinitgroups`'s ordering.
pub fn switch_user(uid: libc::uid_t, gid: libc::gid_t, username: Option<&str>) -> Result<()> {
    if let Some(name) = username {
        let cname = CString::new(name).map_err(|_| {
            Error::UserSwitch(std::io::Error::from_raw_os_error(libc::EINVAL))
        })?;
        // SAFETY: `cname` is a valid, NUL-terminated C string for the duration of the call.
        let ret = unsafe { libc::initgroups(cname.as_ptr(), gid) };
        if ret != 0 {
            return Err(Error::UserSwitch(std::io::Error::last_os_error()));
        }
    } else {
        // SAFETY: a one-element array containing only the primary group is always a valid
        // argument to `setgroups`.
        let ret = unsafe { libc::setgroups(1, &gid) };
        if ret != 0 {
            return Err(Error::UserSwitch(std::io::Error::last_os_error()));
        }
    }

    // SAFETY: `setresgid`/`setresuid` take plain integer arguments; return value is checked.
    let ret = unsafe { libc::setresgid(gid, gid, gid) };
    if ret != 0 {
        return Err(Error::UserSwitch(std::io::Error::last_os_error()));
    }
    // SAFETY: same as above.
    let ret = unsafe { libc::setresuid(uid, uid, uid) };
    if ret != 0 {
        return Err(Error::UserSwitch(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Looks up a uid's home directory, the way `++`-prefixed service paths resolve to
/// `$HOME/.russ`.
pub fn home_dir(uid: libc::uid_t) -> Result<std::path::PathBuf> {
    // SAFETY: `getpwuid` returns either null or a pointer to a `static`-lifetime libc-owned
    // buffer; we copy what we need out of it before the next libc call can overwrite it.
    let pw = unsafe { libc::getpwuid(uid) };
    if pw.is_null() {
        return Err(Error::Sys(std::io::Error::from_raw_os_error(libc::ENOENT)));
    }
    // SAFETY: a non-null `passwd*` returned by `getpwuid` has a valid, NUL-terminated
    // `pw_dir` for the lifetime of this call.
    let home = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) };
    Ok(std::path::PathBuf::from(home.to_string_lossy().into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_dir_resolves_current_user() {
        // SAFETY: trivially safe.
        let uid = unsafe { libc::getuid() };
        let dir = home_dir(uid).unwrap();
        assert!(!dir.as_os_str().is_empty());
    }
}
