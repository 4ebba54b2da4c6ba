// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Error, Result};
use std::io::Write;
use std::path::Path;

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))
}

/// A file counts as present when it exists and is non-empty.
///
/// Zero-byte leftovers from an interrupted run are regenerated.
pub fn is_present(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

pub fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| Error::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| Error::CreateDir {
            path: dir.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
/// Returns true if a file was actually deleted.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Write `contents` to `path` through a sibling temp file and a rename, so a
/// reader never sees a half-written artifact.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    replace_with(path, |temp| {
        let mut file = std::fs::File::create(temp).map_err(|e| write_error(temp, e))?;
        file.write_all(contents).map_err(|e| write_error(temp, e))?;
        file.sync_all().map_err(|e| write_error(temp, e))
    })
}

/// [`atomic_write`] for key material: the file is owner-only from creation.
pub fn atomic_write_secret(path: &Path, contents: &[u8]) -> Result<()> {
    replace_with(path, |temp| write_secret_file(temp, contents))
}

fn replace_with<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    // Same directory, same filesystem: the rename stays atomic.
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidPath(path.to_path_buf()))?;
    let suffix: u64 = rand::Rng::random(&mut rand::rng());
    let temp = parent.join(format!(".certforge-{:x}.tmp", suffix));

    let result = write(&temp).and_then(|()| {
        std::fs::rename(&temp, path).map_err(|e| write_error(path, e))
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

fn write_error(path: &Path, source: std::io::Error) -> Error {
    Error::WriteFile {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| write_error(path, e))?;
    file.write_all(contents).map_err(|e| write_error(path, e))
}

#[cfg(not(unix))]
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<()> {
    // Keys are password-encrypted at rest; ACLs come from the certs directory.
    std::fs::write(path, contents).map_err(|e| write_error(path, e))
}

/// Names reserved for CA artifacts (cannot be used as certificate names).
pub const RESERVED_NAMES: &[&str] = &["ca"];

pub fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name.to_lowercase().as_str())
}

/// Check that a certificate name is safe to use as a file stem.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.contains("..") {
        return Err(invalid("name contains path traversal sequence"));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("name cannot start with '.' or '-'"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(invalid(&format!("name contains invalid character: '{}'", c)));
    }
    if is_reserved_name(name) {
        return Err(invalid("name is reserved for the root CA"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved_name("ca"));
        assert!(is_reserved_name("CA"));
        assert!(!is_reserved_name("api"));
        assert!(!is_reserved_name("api_client"));
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("api").is_ok());
        assert!(validate_name("web_client").is_ok());
        assert!(validate_name("my-app.internal").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("ca").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("foo/bar").is_err());
        assert!(validate_name("foo bar").is_err());
        assert!(validate_name("-rf").is_err());
    }

    #[test]
    fn test_is_present_ignores_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.crt");
        let full = dir.path().join("full.crt");
        std::fs::write(&empty, b"").unwrap();
        std::fs::write(&full, b"data").unwrap();

        assert!(!is_present(&empty));
        assert!(is_present(&full));
        assert!(!is_present(&dir.path().join("missing.crt")));
    }

    #[test]
    fn test_atomic_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pem");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_failed_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // renaming a file over a directory fails
        let target = dir.path().join("occupied");
        std::fs::create_dir_all(target.join("inner")).unwrap();

        assert!(matches!(
            atomic_write(&target, b"data"),
            Err(Error::WriteFile { .. })
        ));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        atomic_write_secret(&path, b"key").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
