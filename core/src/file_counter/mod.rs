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

use std::sync::Arc;

use crate::Result;
use crate::fs::{FileSystem, file_name};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Exact file statistics by recursive listing. Hidden entries (leading `.`
/// or `_`, e.g. `_SUCCESS` or staging directories) are not data and are
/// skipped.
pub struct FileCounter {
    fs: Arc<dyn FileSystem>,
}

impl FileCounter {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// A missing path counts as empty.
    pub async fn count(&self, path: &str) -> Result<FileStats> {
        let mut stats = FileStats::default();
        let Some(root) = self.fs.get_status(path).await? else {
            return Ok(stats);
        };
        if !root.is_directory {
            stats.file_count = 1;
            stats.total_bytes = root.len;
            return Ok(stats);
        }

        let mut pending = vec![path.to_owned()];
        while let Some(dir) = pending.pop() {
            for entry in self.fs.list_directory(&dir).await? {
                let name = file_name(&entry.path);
                if name.starts_with('.') || name.starts_with('_') {
                    continue;
                }
                if entry.is_directory {
                    pending.push(entry.path);
                } else {
                    stats.file_count += 1;
                    stats.total_bytes += entry.len;
                }
            }
        }
        Ok(stats)
    }
}
