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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unresolvable location or unreachable query engine. Not retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Hudi/Iceberg/Delta/ACID tables, or a strategy the table format cannot run.
    #[error("Unsupported table: {0}")]
    UnsupportedTable(String),

    /// The live table is untouched when this is raised.
    #[error("Shadow write failed: {0}")]
    ShadowWrite(String),

    #[error("Atomic swap failed: {0}")]
    AtomicSwap(String),

    #[error("Table is locked by task {holder}, retry later")]
    LockConflict { holder: String },

    #[error("Filesystem error: {0}")]
    FileSystem(String),

    #[error("Query engine error: {0}")]
    QueryEngine(String),

    #[error("Task store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Invalid task state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl CompactionError {
    /// Whether a fresh attempt on the same target can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompactionError::ShadowWrite(_) | CompactionError::LockConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, CompactionError>;
