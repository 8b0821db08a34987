/*
 * Copyright 2025 hive-compaction
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Filesystem client contract and a local implementation.
//!
//! Paths are plain strings so that `hdfs://` and local paths flow through the
//! same code. Only [`LocalFileSystem`] interprets them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{CompactionError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: String,
    pub is_directory: bool,
    pub len: u64,
}

#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    /// Direct children of `path`.
    async fn list_directory(&self, path: &str) -> Result<Vec<FileStatus>>;

    /// `None` when the path does not exist.
    async fn get_status(&self, path: &str) -> Result<Option<FileStatus>>;

    /// Renames `src` to `dst`. Fails when `dst` already exists.
    async fn move_path(&self, src: &str, dst: &str) -> Result<()>;

    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;

    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get_status(path).await?.is_some())
    }
}

/// Splits `a/b/c` into (`a/b`, `c`). Trailing slashes are ignored.
pub fn parent_and_name(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = &trimmed[..idx];
    // Keep the root and `scheme://authority/` prefixes intact.
    let parent = if parent.is_empty() || parent.ends_with(':') || parent.ends_with("//") {
        &trimmed[..=idx]
    } else {
        parent
    };
    Some((parent, name))
}

pub fn join_path(base: &str, child: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        child.trim_start_matches('/')
    )
}

/// Last non-empty path segment.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
}

/// [`FileSystem`] over the local disk. Accepts bare paths and `file://` URIs.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    fn local_path(path: &str) -> PathBuf {
        PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
    }

    fn status_of(path: &Path, metadata: &std::fs::Metadata) -> FileStatus {
        FileStatus {
            path: path.to_string_lossy().into_owned(),
            is_directory: metadata.is_dir(),
            len: if metadata.is_dir() { 0 } else { metadata.len() },
        }
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn list_directory(&self, path: &str) -> Result<Vec<FileStatus>> {
        let dir = Self::local_path(path);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            CompactionError::FileSystem(format!("failed to list {}: {}", dir.display(), e))
        })?;
        let mut statuses = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            statuses.push(Self::status_of(&entry.path(), &metadata));
        }
        statuses.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(statuses)
    }

    async fn get_status(&self, path: &str) -> Result<Option<FileStatus>> {
        let local = Self::local_path(path);
        match tokio::fs::metadata(&local).await {
            Ok(metadata) => Ok(Some(Self::status_of(&local, &metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn move_path(&self, src: &str, dst: &str) -> Result<()> {
        let src_path = Self::local_path(src);
        let dst_path = Self::local_path(dst);
        if tokio::fs::try_exists(&dst_path).await? {
            return Err(CompactionError::FileSystem(format!(
                "cannot move {} to {}: destination exists",
                src, dst
            )));
        }
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src_path, &dst_path).await.map_err(|e| {
            CompactionError::FileSystem(format!("failed to move {} to {}: {}", src, dst, e))
        })
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let local = Self::local_path(path);
        let metadata = match tokio::fs::metadata(&local).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let res = if metadata.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&local).await
            } else {
                tokio::fs::remove_dir(&local).await
            }
        } else {
            tokio::fs::remove_file(&local).await
        };
        res.map_err(|e| CompactionError::FileSystem(format!("failed to delete {}: {}", path, e)))
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(Self::local_path(path)).await?;
        Ok(())
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let local = Self::local_path(path);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parent_and_name() {
        assert_eq!(
            parent_and_name("/wh/sales.db/orders"),
            Some(("/wh/sales.db", "orders"))
        );
        assert_eq!(
            parent_and_name("/wh/sales.db/orders/"),
            Some(("/wh/sales.db", "orders"))
        );
        assert_eq!(
            parent_and_name("hdfs://nn:8020/wh/t"),
            Some(("hdfs://nn:8020/wh", "t"))
        );
        assert_eq!(parent_and_name("/orders"), Some(("/", "orders")));
        assert_eq!(parent_and_name("orders"), None);
    }

    #[test]
    fn test_join_and_file_name() {
        assert_eq!(join_path("/wh/t/", "dt=1"), "/wh/t/dt=1");
        assert_eq!(file_name("/wh/t/dt=1/"), "dt=1");
    }

    #[tokio::test]
    async fn test_local_move_refuses_existing_destination() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().to_str().unwrap().to_owned();
        let fs = LocalFileSystem::new();
        let src = join_path(&base, "a");
        let dst = join_path(&base, "b");
        fs.write_file(&join_path(&src, "f1"), b"x").await.unwrap();
        fs.create_directory(&dst).await.unwrap();

        assert!(fs.move_path(&src, &dst).await.is_err());
        fs.delete(&dst, true).await.unwrap();
        fs.move_path(&src, &dst).await.unwrap();

        assert!(!fs.exists(&src).await.unwrap());
        let listed = fs.list_directory(&dst).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].len, 1);
        assert!(!listed[0].is_directory);
    }

    #[tokio::test]
    async fn test_local_missing_paths() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let missing = join_path(dir.path().to_str().unwrap(), "missing");
        assert!(fs.get_status(&missing).await.unwrap().is_none());
        assert!(fs.list_directory(&missing).await.is_err());
        fs.delete(&missing, true).await.unwrap();
    }
}
