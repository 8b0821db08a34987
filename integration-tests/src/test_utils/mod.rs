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


//! End-to-end fixtures: a temp-dir warehouse, a scripted query engine and a
//! runner persisting to in-memory SQLite.

use std::sync::Arc;

use hive_compaction_core::file_counter::{FileCounter, FileStats};
use hive_compaction_core::fs::{FileSystem, LocalFileSystem, file_name, join_path};
use hive_compaction_core::test_utils::ScriptedQueryEngine;
use hive_compaction_core::{
    CompactionRunner, MergeConfig, MergeTaskExecutor, MetadataManager, Result, SqliteTaskStore,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    _dir: TempDir,
    pub root: String,
    pub engine: Arc<ScriptedQueryEngine>,
    pub metadata: Arc<MetadataManager>,
    pub store: Arc<SqliteTaskStore>,
    pub runner: Arc<CompactionRunner>,
}

impl Harness {
    /// `engine` receives the warehouse root so table locations point into it.
    pub async fn new(
        config: MergeConfig,
        engine: impl FnOnce(&str) -> ScriptedQueryEngine,
    ) -> Result<Self> {
        init_tracing();
        let dir = TempDir::new()?;
        let root = dir.path().to_string_lossy().into_owned();
        let engine = Arc::new(engine(&root));
        let metadata = Arc::new(MetadataManager::new(engine.clone()));
        let store = Arc::new(SqliteTaskStore::connect("sqlite::memory:").await?);
        let config = Arc::new(config);
        let executor = MergeTaskExecutor::new(
            config.clone(),
            metadata.clone(),
            Arc::new(LocalFileSystem::new()),
        );
        let runner = Arc::new(CompactionRunner::new(
            config,
            store.clone(),
            Arc::new(executor),
        ));
        Ok(Self {
            _dir: dir,
            root,
            engine,
            metadata,
            store,
            runner,
        })
    }

    pub fn path(&self, rel: &str) -> String {
        join_path(&self.root, rel)
    }

    pub async fn seed(&self, rel: &str, files: usize, len: usize) -> Result<()> {
        let fs = LocalFileSystem::new();
        let contents = vec![b'r'; len];
        for i in 0..files {
            fs.write_file(&join_path(&self.path(rel), &format!("{:06}_0", i)), &contents)
                .await?;
        }
        Ok(())
    }

    pub async fn count(&self, rel: &str) -> Result<FileStats> {
        FileCounter::new(Arc::new(LocalFileSystem::new()))
            .count(&self.path(rel))
            .await
    }

    /// Entry names directly under `rel`, hidden ones included.
    pub async fn entries(&self, rel: &str) -> Result<Vec<String>> {
        Ok(LocalFileSystem::new()
            .list_directory(&self.path(rel))
            .await?
            .iter()
            .map(|status| file_name(&status.path).to_owned())
            .collect())
    }
}
