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


pub mod common;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod file_counter;
pub mod fs;
pub mod lock;
pub mod metadata;
pub mod model;
pub mod partition;
pub mod store;
pub mod task_log;
pub mod test_utils;
pub mod validation;

pub use compaction::CompactionRunner;
pub use config::MergeConfig;
pub use error::{CompactionError, Result};
pub use executor::{MergeExecutor, MergeOutcome, MergeTaskExecutor};
pub use lock::TableLockManager;
pub use metadata::MetadataManager;
pub use model::{MergeStrategy, MergeTask, StorageFormat, TableKey, TaskSpec, TaskStatus};
pub use store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
