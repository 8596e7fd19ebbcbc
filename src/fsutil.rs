//! Filesystem helpers shared by the on-disk stores
//!
//! Every JSON record is written through a temp file and a rename, so a
//! concurrent reader sees either the old or the new content.

use crate::error::{KcacheError, KcacheResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// Read and parse a JSON file, returning `None` when it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> KcacheResult<Option<T>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KcacheError::io(format!("reading {}", path.display()), e)),
    };

    Ok(Some(serde_json::from_str(&content)?))
}

/// Serialize `value` to `path` atomically, creating parent directories
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> KcacheResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| KcacheError::Internal(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| KcacheError::io(format!("creating directory {}", parent.display()), e))?;

    let content = serde_json::to_string_pretty(value)?;
    let tmp = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, content)
        .await
        .map_err(|e| KcacheError::io(format!("writing {}", tmp.display()), e))?;

    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(KcacheError::io(format!("replacing {}", path.display()), e));
    }
    Ok(())
}

/// Remove a file, treating a missing file as success
pub async fn remove_file_if_exists(path: &Path) -> KcacheResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(KcacheError::io(format!("deleting {}", path.display()), e)),
    }
}

/// Remove a directory tree, treating a missing directory as success
pub async fn remove_tree_if_exists(path: &Path) -> KcacheResult<bool> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(KcacheError::io(format!("deleting {}", path.display()), e)),
    }
}

/// Names of the visible entries in a directory
///
/// Dot-prefixed entries (lock files, staging directories, temp files) are
/// skipped. A missing directory lists as empty.
pub async fn list_dir_names(path: &Path) -> KcacheResult<Vec<String>> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(KcacheError::io(format!("reading directory {}", path.display()), e)),
    };

    let mut names = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| KcacheError::io(format!("reading entry of {}", path.display()), e))?
    {
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }

    names.sort();
    Ok(names)
}

/// Sub-directories of `path`, by name, excluding dot-entries
pub async fn list_subdirs(path: &Path) -> KcacheResult<Vec<String>> {
    let mut dirs = vec![];
    for name in list_dir_names(path).await? {
        let child = path.join(&name);
        let meta = fs::metadata(&child)
            .await
            .map_err(|e| KcacheError::io(format!("stat {}", child.display()), e))?;
        if meta.is_dir() {
            dirs.push(name);
        }
    }
    Ok(dirs)
}

/// Delete `path` if it is an empty directory; returns whether it was removed
pub async fn remove_dir_if_empty(path: &Path) -> KcacheResult<bool> {
    let mut entries = match fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(KcacheError::io(format!("reading directory {}", path.display()), e)),
    };

    let has_entry = entries
        .next_entry()
        .await
        .map_err(|e| KcacheError::io(format!("reading entry of {}", path.display()), e))?
        .is_some();
    if has_entry {
        return Ok(false);
    }

    fs::remove_dir(path)
        .await
        .map_err(|e| KcacheError::io(format!("deleting directory {}", path.display()), e))?;
    Ok(true)
}

/// Total size in bytes of all regular files below `root`
pub async fn dir_size(root: &Path) -> KcacheResult<u64> {
    let mut total = 0u64;
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| KcacheError::io(format!("reading directory {}", dir.display()), e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KcacheError::io(format!("reading entry of {}", dir.display()), e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| KcacheError::io(format!("stat {}", entry.path().display()), e))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let meta = entry
                    .metadata()
                    .await
                    .map_err(|e| KcacheError::io(format!("stat {}", entry.path().display()), e))?;
                total += meta.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        value: u32,
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let got: Option<Sample> = read_json(&dir.path().join("nope.json")).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/sample.json");

        write_json_atomic(&path, &Sample { value: 1 }).await.unwrap();
        write_json_atomic(&path, &Sample { value: 2 }).await.unwrap();

        let got: Sample = read_json(&path).await.unwrap().unwrap();
        assert_eq!(got, Sample { value: 2 });

        let mut raw = std::fs::read_dir(dir.path().join("a/b")).unwrap();
        assert_eq!(raw.next().unwrap().unwrap().file_name(), "sample.json");
        assert!(raw.next().is_none());
    }

    #[tokio::test]
    async fn listing_skips_dot_entries() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("visible")).unwrap();
        std::fs::create_dir(dir.path().join(".staging")).unwrap();
        std::fs::write(dir.path().join(".lock"), "").unwrap();
        std::fs::write(dir.path().join("file.json"), "{}").unwrap();

        assert_eq!(
            list_dir_names(dir.path()).await.unwrap(),
            vec!["file.json", "visible"]
        );
        assert_eq!(list_subdirs(dir.path()).await.unwrap(), vec!["visible"]);
    }

    #[tokio::test]
    async fn remove_dir_only_when_empty() {
        let dir = TempDir::new().unwrap();
        let full = dir.path().join("full");
        std::fs::create_dir(&full).unwrap();
        std::fs::write(full.join("x"), "x").unwrap();
        let empty = dir.path().join("empty");
        std::fs::create_dir(&empty).unwrap();

        assert!(!remove_dir_if_empty(&full).await.unwrap());
        assert!(remove_dir_if_empty(&empty).await.unwrap());
        assert!(!empty.exists());
        assert!(!remove_dir_if_empty(&empty).await.unwrap());
    }

    #[tokio::test]
    async fn dir_size_sums_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a/b/deep"), vec![0u8; 32]).unwrap();

        assert_eq!(dir_size(dir.path()).await.unwrap(), 42);
    }
}
