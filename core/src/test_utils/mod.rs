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

//! In-process doubles for the query engine, filesystem and task log.
//!
//! `ScriptedQueryEngine` answers the metadata statements the way Hive's
//! `DESCRIBE FORMATTED` does and materializes `INSERT OVERWRITE DIRECTORY`
//! output on the local disk, so merges run end to end against a temp dir.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::{QueryEngine, Row};
use crate::fs::{FileStatus, FileSystem, LocalFileSystem, join_path};
use crate::model::{MergePhase, StorageFormat};
use crate::task_log::{LogLevel, TaskLogger};
use crate::{CompactionError, Result};

fn row(cells: [&str; 3]) -> Row {
    cells.iter().map(|c| (*c).to_owned()).collect()
}

fn format_classes(format: StorageFormat) -> (&'static str, &'static str, &'static str) {
    match format {
        StorageFormat::Parquet => (
            "org.apache.hadoop.hive.ql.io.parquet.serde.ParquetHiveSerDe",
            "org.apache.hadoop.hive.ql.io.parquet.MapredParquetInputFormat",
            "org.apache.hadoop.hive.ql.io.parquet.MapredParquetOutputFormat",
        ),
        StorageFormat::Orc => (
            "org.apache.hadoop.hive.ql.io.orc.OrcSerde",
            "org.apache.hadoop.hive.ql.io.orc.OrcInputFormat",
            "org.apache.hadoop.hive.ql.io.orc.OrcOutputFormat",
        ),
        StorageFormat::Avro => (
            "org.apache.hadoop.hive.serde2.avro.AvroSerDe",
            "org.apache.hadoop.hive.ql.io.avro.AvroContainerInputFormat",
            "org.apache.hadoop.hive.ql.io.avro.AvroContainerOutputFormat",
        ),
        StorageFormat::RcFile => (
            "org.apache.hadoop.hive.serde2.columnar.ColumnarSerDe",
            "org.apache.hadoop.hive.ql.io.RCFileInputFormat",
            "org.apache.hadoop.hive.ql.io.RCFileOutputFormat",
        ),
        StorageFormat::TextFile => (
            "org.apache.hadoop.hive.serde2.lazy.LazySimpleSerDe",
            "org.apache.hadoop.mapred.TextInputFormat",
            "org.apache.hadoop.hive.ql.io.HiveIgnoreKeyTextOutputFormat",
        ),
    }
}

/// `DESCRIBE FORMATTED` output of a managed table.
pub fn describe_rows(
    columns: &[&str],
    partition_columns: &[&str],
    location: &str,
    format: StorageFormat,
    parameters: &[(&str, &str)],
) -> Vec<Row> {
    let mut rows = vec![row(["# col_name", "data_type", "comment"]), row(["", "", ""])];
    rows.extend(columns.iter().map(|c| row([*c, "string", ""])));
    if !partition_columns.is_empty() {
        rows.push(row(["", "", ""]));
        rows.push(row(["# Partition Information", "", ""]));
        rows.push(row(["# col_name", "data_type", "comment"]));
        rows.push(row(["", "", ""]));
        rows.extend(partition_columns.iter().map(|c| row([*c, "string", ""])));
    }

    let (serde, input_format, output_format) = format_classes(format);
    rows.push(row(["", "", ""]));
    rows.push(row(["# Detailed Table Information", "", ""]));
    rows.push(row(["Database:", "default", ""]));
    rows.push(row(["Location:", location, ""]));
    rows.push(row(["Table Type:", "MANAGED_TABLE", ""]));
    rows.push(row(["Table Parameters:", "", ""]));
    rows.extend(parameters.iter().map(|(k, v)| row(["", *k, *v])));
    rows.push(row(["", "", ""]));
    rows.push(row(["# Storage Information", "", ""]));
    rows.push(row(["SerDe Library:", serde, ""]));
    rows.push(row(["InputFormat:", input_format, ""]));
    rows.push(row(["OutputFormat:", output_format, ""]));
    rows
}

struct ScriptedTable {
    describe: Vec<Row>,
    partitions: Vec<String>,
    properties: Vec<Row>,
}

#[derive(Debug, Clone)]
enum RewriteBehavior {
    /// Writes `files` data files of `file_len` bytes into the target directory.
    Write { files: usize, file_len: usize },
    /// Optionally leaves a partial directory behind, then errors.
    Fail { message: String, partial: bool },
}

/// Query engine double answering the statements issued by the metadata layer
/// and the executor.
pub struct ScriptedQueryEngine {
    tables: HashMap<(String, String), ScriptedTable>,
    reachable: bool,
    properties_readable: bool,
    rewrite: RewriteBehavior,
    fs: LocalFileSystem,
    statements: Mutex<Vec<String>>,
}

impl Default for ScriptedQueryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedQueryEngine {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            reachable: true,
            properties_readable: true,
            rewrite: RewriteBehavior::Write {
                files: 1,
                file_len: 1024,
            },
            fs: LocalFileSystem::new(),
            statements: Mutex::new(vec![]),
        }
    }

    pub fn with_table(
        mut self,
        database: &str,
        table: &str,
        describe: Vec<Row>,
        partitions: Vec<String>,
    ) -> Self {
        self.tables.insert(
            (database.to_owned(), table.to_owned()),
            ScriptedTable {
                describe,
                partitions,
                properties: vec![],
            },
        );
        self
    }

    /// Rows returned by `SHOW TBLPROPERTIES` for a table added earlier.
    pub fn with_properties(mut self, database: &str, table: &str, properties: Vec<Row>) -> Self {
        if let Some(scripted) = self.tables.get_mut(&(database.to_owned(), table.to_owned())) {
            scripted.properties = properties;
        }
        self
    }

    /// `SHOW TBLPROPERTIES` fails for every table.
    pub fn failing_properties(mut self) -> Self {
        self.properties_readable = false;
        self
    }

    /// Every statement fails as if the server were down.
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Rewrites produce `files` files of `file_len` bytes. Zero files leaves
    /// an empty directory.
    pub fn with_output_files(mut self, files: usize, file_len: usize) -> Self {
        self.rewrite = RewriteBehavior::Write { files, file_len };
        self
    }

    pub fn failing_rewrite(mut self, message: impl Into<String>, partial: bool) -> Self {
        self.rewrite = RewriteBehavior::Fail {
            message: message.into(),
            partial,
        };
        self
    }

    pub async fn statements(&self) -> Vec<String> {
        self.statements.lock().await.clone()
    }

    fn table(&self, qualified: &str) -> Result<&ScriptedTable> {
        let (database, table) = parse_qualified(qualified);
        self.tables.get(&(database, table)).ok_or_else(|| {
            CompactionError::QueryEngine(format!("Table or view not found: {}", qualified))
        })
    }

    async fn write_output(&self, directory: &str, files: usize, file_len: usize) -> Result<()> {
        self.fs.create_directory(directory).await?;
        let contents = vec![b'x'; file_len];
        for i in 0..files {
            let name = format!("part-{:05}-{}.c000", i, Uuid::new_v4());
            self.fs.write_file(&join_path(directory, &name), &contents).await?;
        }
        self.fs.write_file(&join_path(directory, "_SUCCESS"), b"").await
    }

    async fn rewrite(&self, statement: &str) -> Result<Vec<Row>> {
        let directory = quoted_after(statement, "DIRECTORY").ok_or_else(|| {
            CompactionError::QueryEngine(format!("no output directory in: {}", statement))
        })?;
        match &self.rewrite {
            RewriteBehavior::Write { files, file_len } => {
                self.write_output(&directory, *files, *file_len).await?;
                Ok(vec![])
            }
            RewriteBehavior::Fail { message, partial } => {
                if *partial {
                    self.fs.create_directory(&directory).await?;
                    self.fs
                        .write_file(&join_path(&directory, "part-00000.inprogress"), b"x")
                        .await?;
                }
                Err(CompactionError::QueryEngine(message.clone()))
            }
        }
    }
}

/// `` `db`.`t` `` or `db.t` into its parts.
fn parse_qualified(qualified: &str) -> (String, String) {
    let cleaned = qualified.trim().replace('`', "");
    match cleaned.split_once('.') {
        Some((db, table)) => (db.to_owned(), table.to_owned()),
        None => ("default".to_owned(), cleaned),
    }
}

/// First single-quoted literal following `keyword`.
fn quoted_after(statement: &str, keyword: &str) -> Option<String> {
    let rest = &statement[statement.find(keyword)? + keyword.len()..];
    let start = rest.find('\'')? + 1;
    let len = rest[start..].find('\'')?;
    Some(rest[start..start + len].to_owned())
}

#[async_trait]
impl QueryEngine for ScriptedQueryEngine {
    async fn execute(&self, database: &str, statement: &str) -> Result<Vec<Row>> {
        self.statements.lock().await.push(statement.to_owned());
        if !self.reachable {
            return Err(CompactionError::QueryEngine(
                "connection refused".to_owned(),
            ));
        }

        let trimmed = statement.trim();
        let upper = trimmed.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("SHOW TABLES IN ") {
            let db = rest.split_whitespace().next().unwrap_or(database).to_ascii_lowercase();
            let pattern = quoted_after(trimmed, "LIKE").unwrap_or_default();
            return Ok(self
                .tables
                .keys()
                .filter(|(d, t)| d.eq_ignore_ascii_case(&db) && t.eq_ignore_ascii_case(&pattern))
                .map(|(_, t)| vec![t.clone()])
                .collect());
        }
        if upper.starts_with("DESCRIBE FORMATTED ") {
            let table = self.table(&trimmed["DESCRIBE FORMATTED ".len()..])?;
            return Ok(table.describe.clone());
        }
        if upper.starts_with("SHOW PARTITIONS ") {
            let table = self.table(&trimmed["SHOW PARTITIONS ".len()..])?;
            return Ok(table.partitions.iter().map(|p| vec![p.clone()]).collect());
        }
        if upper.starts_with("SHOW TBLPROPERTIES ") {
            let table = self.table(&trimmed["SHOW TBLPROPERTIES ".len()..])?;
            if !self.properties_readable {
                return Err(CompactionError::QueryEngine(
                    "permission denied reading table properties".to_owned(),
                ));
            }
            return Ok(table.properties.clone());
        }
        if upper.starts_with("INSERT OVERWRITE DIRECTORY") {
            return self.rewrite(trimmed).await;
        }
        if upper.starts_with("SELECT 1") {
            return Ok(vec![vec!["1".to_owned()]]);
        }
        Ok(vec![])
    }
}

/// [`LocalFileSystem`] whose chosen `move_path` calls fail.
pub struct FaultyFileSystem {
    inner: LocalFileSystem,
    failing_moves: Vec<usize>,
    moves: AtomicUsize,
}

impl Default for FaultyFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultyFileSystem {
    pub fn new() -> Self {
        Self {
            inner: LocalFileSystem::new(),
            failing_moves: vec![],
            moves: AtomicUsize::new(0),
        }
    }

    /// Fails the `nth` move (1-based) without touching the disk.
    pub fn fail_move(mut self, nth: usize) -> Self {
        self.failing_moves.push(nth);
        self
    }

    pub fn moves(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileSystem for FaultyFileSystem {
    async fn list_directory(&self, path: &str) -> Result<Vec<FileStatus>> {
        self.inner.list_directory(path).await
    }

    async fn get_status(&self, path: &str) -> Result<Option<FileStatus>> {
        self.inner.get_status(path).await
    }

    async fn move_path(&self, src: &str, dst: &str) -> Result<()> {
        let nth = self.moves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_moves.contains(&nth) {
            return Err(CompactionError::FileSystem(format!(
                "injected failure moving {} to {}",
                src, dst
            )));
        }
        self.inner.move_path(src, dst).await
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.inner.delete(path, recursive).await
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.inner.create_directory(path).await
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        self.inner.write_file(path, contents).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub task_id: Uuid,
    pub phase: MergePhase,
    pub level: LogLevel,
    pub message: String,
}

/// Keeps every entry in memory.
#[derive(Default)]
pub struct RecordingTaskLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingTaskLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().await.clone()
    }

    /// Distinct phases in the order they were first logged.
    pub async fn phases(&self) -> Vec<MergePhase> {
        let mut phases = vec![];
        for entry in self.entries.lock().await.iter() {
            if !phases.contains(&entry.phase) {
                phases.push(entry.phase);
            }
        }
        phases
    }
}

#[async_trait]
impl TaskLogger for RecordingTaskLogger {
    async fn log(&self, task_id: Uuid, phase: MergePhase, level: LogLevel, message: &str) {
        self.entries.lock().await.push(LogEntry {
            task_id,
            phase,
            level,
            message: message.to_owned(),
        });
    }
}
