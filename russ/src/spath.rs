//! Service path resolution: `+`/`++` prefix expansion, symlink following, and the
//! socket-boundary split (spec.md §4.3).

use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::path::PathBuf;

use russ_base::creds::Uid;

use crate::error::Error;
use crate::error::Result;
use crate::wire::sarray::SArray;

/// Maximum length, in bytes, of a service path (spec.md §3).
pub const MAX_SPATH_LEN: usize = 65536;

/// Bound on symlink expansions during resolution, to break cycles (spec.md §3, §8).
pub const MAX_SYMLINK_HOPS: usize = 32;

/// The `(saddr, spath')` pair produced by [`split`]: the socket address a resolved service path
/// names, and the remainder of the path below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub saddr: PathBuf,
    pub spath: String,
}

/// Resolves `spath` to an absolute path with no `+`/`++` prefixes and no intermediate symlinks,
/// per the fixed-point algorithm in spec.md §4.3. `uid` is required only if `spath` (or a
/// symlink target reached while resolving it) uses the `++` (per-user services) prefix.
pub fn resolve(spath: &str, uid: Option<Uid>, services_dir: &Path) -> Result<String> {
    if spath.len() > MAX_SPATH_LEN {
        return Err(Error::LimitExceeded {
            what: "spath",
            got: spath.len(),
            limit: MAX_SPATH_LEN,
        });
    }

    let mut current = spath.to_string();
    let mut hops = 0usize;
    loop {
        let (next, changed) = resolve_pass(&current, uid, services_dir)?;
        if !changed {
            return Ok(next);
        }
        if next.len() > MAX_SPATH_LEN {
            return Err(Error::LimitExceeded {
                what: "spath",
                got: next.len(),
                limit: MAX_SPATH_LEN,
            });
        }
        current = next;
        hops += 1;
        if hops > MAX_SYMLINK_HOPS {
            return Err(Error::SymlinkLoop(MAX_SYMLINK_HOPS));
        }
    }
}

/// Idempotence check used by tests and callers that want to assert a spath is already
/// resolved: `resolve(resolve(p)) == resolve(p)` (spec.md §8).
pub fn is_resolved(spath: &str, uid: Option<Uid>, services_dir: &Path) -> Result<bool> {
    let once = resolve(spath, uid, services_dir)?;
    let twice = resolve(&once, uid, services_dir)?;
    Ok(once == twice)
}

/// Runs a single step of the algorithm (one prefix expansion or one symlink substitution) and
/// reports whether anything changed.
fn resolve_pass(spath: &str, uid: Option<Uid>, services_dir: &Path) -> Result<(String, bool)> {
    // Step 1: bare `+`/`++` become `+/`/`++/` and fall through to the next pass.
    if spath == "+" || spath == "++" {
        return Ok((format!("{spath}/"), true));
    }

    // Step 2: services-directory prefix.
    for prefix in ["+/", "/+/"] {
        if let Some(rest) = spath.strip_prefix(prefix) {
            return Ok((join_dir(services_dir, rest), true));
        }
    }

    // Step 3: per-user services directory prefix.
    for prefix in ["++/", "/++/"] {
        if let Some(rest) = spath.strip_prefix(prefix) {
            let uid = uid.ok_or_else(|| Error::SpathNoUser(spath.to_string()))?;
            let home = russ_base::user::home_dir(uid)
                .map_err(|_| Error::SpathNoUser(spath.to_string()))?;
            let russ_home = home.join(".russ");
            return Ok((join_dir(&russ_home, rest), true));
        }
    }

    // Step 4: walk left to right looking for a symlink to substitute.
    walk_and_substitute_symlink(spath)
}

fn join_dir(dir: &Path, rest: &str) -> String {
    let mut out = dir.to_string_lossy().into_owned();
    if !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(rest);
    out
}

/// Walks `spath`'s components left to right (including the full path itself), substituting the
/// first symlink found and reporting the new string, or reports no change if every existing
/// prefix is a plain directory (or the walk runs off the end / hits something nonexistent).
fn walk_and_substitute_symlink(spath: &str) -> Result<(String, bool)> {
    if !spath.starts_with('/') {
        return Ok((spath.to_string(), false));
    }

    let boundaries = component_boundaries(spath);
    for prefix_end in boundaries {
        let prefix = &spath[..prefix_end];
        let meta = match std::fs::symlink_metadata(prefix) {
            Ok(m) => m,
            Err(_) => break,
        };
        let ft = meta.file_type();
        if ft.is_dir() {
            continue;
        }
        if ft.is_symlink() {
            let target = std::fs::read_link(prefix).map_err(Error::Sys)?;
            let target_str = target.to_string_lossy().into_owned();
            let rest = &spath[prefix_end..];
            let substituted = if target_str.starts_with('/') || target_str.starts_with("+/") {
                format!("{target_str}{rest}")
            } else {
                let parent = Path::new(prefix).parent().unwrap_or_else(|| Path::new("/"));
                format!("{}/{}{}", parent.display(), target_str, rest)
            };
            return Ok((substituted, true));
        }
        // Regular file, socket, or anything else is terminal: stop the walk without error.
        break;
    }
    Ok((spath.to_string(), false))
}

/// Byte offsets of every component boundary in an absolute path: each `/` after the leading one,
/// plus the end of the string (so the final component, e.g. a socket file, is itself checked).
fn component_boundaries(spath: &str) -> Vec<usize> {
    let mut boundaries: Vec<usize> = spath
        .char_indices()
        .filter(|&(i, c)| c == '/' && i > 0)
        .map(|(i, _)| i)
        .collect();
    boundaries.push(spath.len());
    boundaries
}

/// Splits a resolved spath at the first socket boundary: walks components left to right,
/// stopping at the first one that is a Unix socket. Directories are transparent; anything else
/// (including a nonexistent component) fails (spec.md §4.3 "Split").
pub fn split(resolved_spath: &str) -> Result<Target> {
    if !resolved_spath.starts_with('/') {
        return Err(Error::SpathNoSocket(resolved_spath.to_string()));
    }

    for prefix_end in component_boundaries(resolved_spath) {
        let prefix = &resolved_spath[..prefix_end];
        let meta = std::fs::metadata(prefix)
            .map_err(|_| Error::SpathNoSocket(resolved_spath.to_string()))?;
        if meta.file_type().is_socket() {
            let remainder = &resolved_spath[prefix_end..];
            let spath = if remainder.is_empty() {
                "/".to_string()
            } else {
                remainder.to_string()
            };
            return Ok(Target {
                saddr: PathBuf::from(prefix),
                spath,
            });
        }
        if meta.is_dir() {
            continue;
        }
        return Err(Error::SpathNoSocket(resolved_spath.to_string()));
    }
    Err(Error::SpathNoSocket(resolved_spath.to_string()))
}

/// Splits a single path component of the form `name?k1=v1?k2=v2` into its bare name and an
/// ordered options vector (spec.md §4.3 "Option parsing", §11).
pub fn split_component_options(component: &str) -> (String, SArray) {
    let mut parts = component.split('?');
    let name = parts.next().unwrap_or("").to_string();
    let options = SArray::from_vec(parts.map(str::to_string).collect());
    (name, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plus_prefix_expands_to_services_dir() {
        let dir = Path::new("/var/run/russ/services");
        let (resolved, changed) = resolve_pass("/+/echo", None, dir).unwrap();
        assert!(changed);
        assert_eq!(resolved, "/var/run/russ/services/echo");
    }

    #[test]
    fn bare_plus_becomes_slash_then_expands() {
        let dir = Path::new("/svc");
        let resolved = resolve("+", None, dir).unwrap();
        assert_eq!(resolved, "/svc/");
    }

    #[test]
    fn plain_absolute_path_is_unchanged_without_filesystem_state() {
        let dir = Path::new("/svc");
        // /tmp exists and is a directory on any Unix system, and /tmp/nonexistent-child-xyz does
        // not exist, so the walk stops without a symlink substitution: resolve is a no-op here.
        let resolved = resolve("/tmp/nonexistent-child-xyz", None, dir).unwrap();
        assert_eq!(resolved, "/tmp/nonexistent-child-xyz");
    }

    #[test]
    fn resolution_is_idempotent_for_a_plain_path() {
        let dir = Path::new("/svc");
        assert!(is_resolved("/tmp/nonexistent-child-xyz", None, dir).unwrap());
    }

    #[test]
    fn symlink_chain_beyond_bound_fails() {
        let tmp = tempfile::tempdir().unwrap();
        // Build a cycle of 33 symlinks: link0 -> link1 -> ... -> link32 -> link0.
        let n = MAX_SYMLINK_HOPS + 1;
        for i in 0..n {
            let from = tmp.path().join(format!("link{i}"));
            let to = tmp.path().join(format!("link{}", (i + 1) % n));
            std::os::unix::fs::symlink(&to, &from).unwrap();
        }
        let spath = tmp.path().join("link0").to_string_lossy().into_owned();
        let err = resolve(&spath, None, Path::new("/svc")).unwrap_err();
        assert!(matches!(err, Error::SymlinkLoop(_)));
    }

    #[test]
    fn split_stops_at_socket() {
        let tmp = tempfile::tempdir().unwrap();
        let sock_path = tmp.path().join("svc.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();

        let spath = format!("{}/sub/path", sock_path.display());
        let target = split(&spath).unwrap();
        assert_eq!(target.saddr, sock_path);
        assert_eq!(target.spath, "/sub/path");
    }

    #[test]
    fn split_with_no_remainder_returns_root() {
        let tmp = tempfile::tempdir().unwrap();
        let sock_path = tmp.path().join("svc.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&sock_path).unwrap();

        let target = split(&sock_path.to_string_lossy()).unwrap();
        assert_eq!(target.spath, "/");
    }

    #[test]
    fn split_fails_without_a_socket_component() {
        let tmp = tempfile::tempdir().unwrap();
        let err = split(&tmp.path().join("ghost").to_string_lossy()).unwrap_err();
        assert!(matches!(err, Error::SpathNoSocket(_)));
    }

    #[test]
    fn component_options_are_split_from_the_bare_name() {
        let (name, opts) = split_component_options("ssh?controlpersist=60?controltag=a");
        assert_eq!(name, "ssh");
        assert_eq!(opts.find("controlpersist"), Some("60"));
        assert_eq!(opts.find("controltag"), Some("a"));
    }

    #[test]
    fn component_without_options_has_empty_vector() {
        let (name, opts) = split_component_options("plain");
        assert_eq!(name, "plain");
        assert!(opts.is_empty());
    }
}
