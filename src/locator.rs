// SPDX-License-Identifier: Apache-2.0

//! Bounded-depth filesystem walk that maps service names to sockets across
//! a workspace, composing `prefix:base` names from nested `.tap` directories.

use std::path::{Path, PathBuf};

use crate::error::LocatorError;
use crate::types::DiscoveredService;
use crate::validate::{validate_base_name, validate_service_name};

const DEFAULT_MAX_DEPTH: usize = 5;
const TAP_DIR_NAME: &str = ".tap";
const SOCK_SUFFIX: &str = ".sock";

fn skip_entry(name: &str) -> bool {
    name == "node_modules" || (name.starts_with('.') && name != TAP_DIR_NAME)
}

/// Walks `base_dir` to `max_depth`, collecting every discovered service.
/// Filesystem errors are swallowed per-directory; discovery is best-effort.
pub fn discover_services(base_dir: &Path, max_depth: usize) -> Vec<DiscoveredService> {
    let mut found = Vec::new();
    walk(base_dir, base_dir, "", max_depth, &mut found);
    found
}

fn walk(
    base_dir: &Path,
    dir: &Path,
    prefix: &str,
    depth_remaining: usize,
    found: &mut Vec<DiscoveredService>,
) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };
        if skip_entry(name) {
            continue;
        }
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        if !file_type.is_dir() {
            continue;
        }

        let path = entry.path();
        if name == TAP_DIR_NAME {
            collect_sockets(&path, prefix, found);
            continue;
        }

        if depth_remaining == 0 {
            continue;
        }
        let child_prefix = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        walk(base_dir, &path, &child_prefix, depth_remaining - 1, found);
    }
}

fn collect_sockets(tap_dir: &Path, prefix: &str, found: &mut Vec<DiscoveredService>) {
    let entries = match std::fs::read_dir(tap_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = match file_name.to_str() {
            Some(s) => s,
            None => continue,
        };
        let Some(base_name) = file_name.strip_suffix(SOCK_SUFFIX) else {
            continue;
        };
        if validate_base_name(base_name).is_err() {
            continue;
        }
        let name = if prefix.is_empty() {
            base_name.to_string()
        } else {
            format!("{prefix}:{base_name}")
        };
        found.push(DiscoveredService {
            name,
            socket_path: entry.path(),
            tap_dir: tap_dir.to_path_buf(),
            prefix: prefix.to_string(),
            base_name: base_name.to_string(),
        });
    }
}

/// Resolves a user-supplied `name` to a socket path.
///
/// If `tap_dir` is given explicitly, the walk is skipped entirely and the
/// socket is composed directly from it and the name's base component. Else
/// the full workspace is walked: an exact name match wins, falling back (for
/// unqualified names) to a unique-basename match. If nothing matches, the
/// expected default path is returned so callers can report "no runner" with
/// a concrete path.
pub fn resolve(
    base_dir: &Path,
    name: &str,
    tap_dir: Option<&Path>,
) -> Result<PathBuf, LocatorError> {
    validate_service_name(name)?;

    if let Some(tap_dir) = tap_dir {
        let base_name = name.rsplit_once(':').map(|(_, b)| b).unwrap_or(name);
        validate_base_name(base_name)?;
        return Ok(tap_dir.join(format!("{base_name}{SOCK_SUFFIX}")));
    }

    let services = discover_services(base_dir, DEFAULT_MAX_DEPTH);

    if let Some(service) = services.iter().find(|s| s.name == name) {
        return Ok(service.socket_path.clone());
    }

    if !name.contains(':') {
        let matches: Vec<&DiscoveredService> =
            services.iter().filter(|s| s.base_name == name).collect();
        if matches.len() == 1 {
            return Ok(matches[0].socket_path.clone());
        }
    }

    Ok(base_dir
        .join(TAP_DIR_NAME)
        .join(format!("{name}{SOCK_SUFFIX}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn discovers_nested_and_root_services() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".tap")).unwrap();
        fs::write(dir.path().join(".tap/worker.sock"), b"").unwrap();
        fs::create_dir_all(dir.path().join("frontend/.tap")).unwrap();
        fs::write(dir.path().join("frontend/.tap/api.sock"), b"").unwrap();

        let services = discover_services(dir.path(), DEFAULT_MAX_DEPTH);
        let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"worker"));
        assert!(names.contains(&"frontend:api"));
    }

    #[test]
    fn resolve_exact_and_unique_basename_fallback() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".tap")).unwrap();
        fs::write(dir.path().join(".tap/worker.sock"), b"").unwrap();
        fs::create_dir_all(dir.path().join("frontend/.tap")).unwrap();
        fs::write(dir.path().join("frontend/.tap/api.sock"), b"").unwrap();

        let exact = resolve(dir.path(), "frontend:api", None).unwrap();
        assert_eq!(exact, dir.path().join("frontend/.tap/api.sock"));

        let fallback = resolve(dir.path(), "api", None).unwrap();
        assert_eq!(fallback, dir.path().join("frontend/.tap/api.sock"));

        let root = resolve(dir.path(), "worker", None).unwrap();
        assert_eq!(root, dir.path().join(".tap/worker.sock"));
    }

    #[test]
    fn resolve_missing_returns_expected_default_path() {
        let dir = tempdir().unwrap();
        let path = resolve(dir.path(), "ghost", None).unwrap();
        assert_eq!(path, dir.path().join(".tap/ghost.sock"));
    }

    #[test]
    fn ignores_node_modules_and_dot_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules/.tap")).unwrap();
        fs::write(dir.path().join("node_modules/.tap/evil.sock"), b"").unwrap();
        fs::create_dir_all(dir.path().join(".git/.tap")).unwrap();
        fs::write(dir.path().join(".git/.tap/evil.sock"), b"").unwrap();

        let services = discover_services(dir.path(), DEFAULT_MAX_DEPTH);
        assert!(services.is_empty());
    }

    #[test]
    fn rejects_path_traversal_in_name() {
        let dir = tempdir().unwrap();
        assert!(resolve(dir.path(), "../etc/passwd", None).is_err());
    }
}
