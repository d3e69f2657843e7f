// SPDX-License-Identifier: Apache-2.0

//! Client-side cache of "last seen cursor" per tap dir/service, so `tap logs
//! --follow` can resume across invocations. A small JSON map at a
//! platform-appropriate cache path, written `0600` inside a `0700` directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::CursorCacheError;

const CACHE_FILE_NAME: &str = "cursors.json";

fn cache_file_path() -> Result<PathBuf, CursorCacheError> {
    let dir = dirs::cache_dir().ok_or(CursorCacheError::NoCacheDir)?;
    Ok(dir.join("tap").join(CACHE_FILE_NAME))
}

fn cache_key(tap_dir: &Path, service_name: &str) -> String {
    format!("{}:{}", tap_dir.display(), service_name)
}

/// Ensures a non-regular file at `path` (e.g. a planted symlink) is removed
/// and treated as absent, rather than followed or read.
fn evict_if_irregular(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if !meta.file_type().is_file() => {
            std::fs::remove_file(path)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn load_map(path: &Path) -> HashMap<String, u64> {
    evict_if_irregular(path).ok();
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

#[cfg(unix)]
fn write_private_file(path: &Path, contents: &str) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let parent = path.parent().expect("cache path always has a parent");
    std::fs::create_dir_all(parent)?;
    std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Reads the cursor recorded for `(tap_dir, service_name)`, if any. Corrupt
/// JSON and a missing file are both treated as "no cursor recorded".
pub fn read_cursor(tap_dir: &Path, service_name: &str) -> Result<Option<u64>, CursorCacheError> {
    let path = cache_file_path()?;
    let map = load_map(&path);
    Ok(map.get(&cache_key(tap_dir, service_name)).copied())
}

/// Records `cursor` for `(tap_dir, service_name)`, merging into the existing
/// map so other services' entries are preserved.
pub fn write_cursor(
    tap_dir: &Path,
    service_name: &str,
    cursor: u64,
) -> Result<(), CursorCacheError> {
    let path = cache_file_path()?;
    let mut map = load_map(&path);
    map.insert(cache_key(tap_dir, service_name), cursor);
    let contents = serde_json::to_string(&map).map_err(|e| {
        CursorCacheError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    write_private_file(&path, &contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn with_cache_home<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        // SAFETY: tests run serially enough within this module; this mirrors
        // the pattern other example repos use to redirect `dirs::cache_dir()`.
        unsafe { std::env::set_var("XDG_CACHE_HOME", dir) };
        let result = f();
        unsafe { std::env::remove_var("XDG_CACHE_HOME") };
        result
    }

    #[test]
    fn write_then_read_round_trip() {
        let home = tempdir().unwrap();
        with_cache_home(home.path(), || {
            let tap_dir = PathBuf::from("/work/.tap");
            write_cursor(&tap_dir, "svc", 42).unwrap();
            assert_eq!(read_cursor(&tap_dir, "svc").unwrap(), Some(42));
        });
    }

    #[test]
    fn symlink_at_cache_path_is_unlinked_and_treated_as_empty() {
        let home = tempdir().unwrap();
        with_cache_home(home.path(), || {
            let path = cache_file_path().unwrap();
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let target = home.path().join("elsewhere");
            std::fs::write(&target, "not json").unwrap();
            std::os::unix::fs::symlink(&target, &path).unwrap();

            let tap_dir = PathBuf::from("/work/.tap");
            assert_eq!(read_cursor(&tap_dir, "svc").unwrap(), None);
            assert!(!path.is_symlink());
        });
    }

    #[test]
    fn corrupt_json_is_treated_as_empty() {
        let home = tempdir().unwrap();
        with_cache_home(home.path(), || {
            let path = cache_file_path().unwrap();
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "{not json").unwrap();

            let tap_dir = PathBuf::from("/work/.tap");
            assert_eq!(read_cursor(&tap_dir, "svc").unwrap(), None);
        });
    }

    #[test]
    fn cache_file_is_mode_0600() {
        let home = tempdir().unwrap();
        with_cache_home(home.path(), || {
            let tap_dir = PathBuf::from("/work/.tap");
            write_cursor(&tap_dir, "svc", 1).unwrap();
            let path = cache_file_path().unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        });
    }
}
