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

//! Merge task row and the ephemeral values derived while running it.
//!
//! A [`MergeTask`] is stored as one row but its fields are split into three
//! groups with a single writer each: [`TaskSpec`] is fixed at creation,
//! [`LockState`] belongs to the table lock manager and [`TaskProgress`]
//! belongs to the executor path.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CompactionError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub cluster: String,
    pub database: String,
    pub table: String,
}

impl TableKey {
    pub fn new(
        cluster: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            database: database.into(),
            table: table.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.cluster, self.database, self.table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Pending or running: the states in which a lock flag is meaningful.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Forward-only transitions; cancel is allowed from any non-terminal state
    /// and terminal states never change again.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, TaskStatus::Cancelled) => true,
            (TaskStatus::Pending, TaskStatus::Running) => true,
            // A pending task may be failed directly (e.g. validation before start).
            (TaskStatus::Pending, TaskStatus::Failed) => true,
            (TaskStatus::Running, TaskStatus::Success | TaskStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CompactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(CompactionError::Unexpected(format!(
                "unknown task status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Rewrite into a hidden sibling directory, then swap it into place.
    #[default]
    ShadowSwap,
    /// In-place `ALTER TABLE .. CONCATENATE`; ORC and RCFILE only.
    Concatenate,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::ShadowSwap => "shadow_swap",
            MergeStrategy::Concatenate => "concatenate",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = CompactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shadow_swap" => Ok(MergeStrategy::ShadowSwap),
            "concatenate" => Ok(MergeStrategy::Concatenate),
            other => Err(CompactionError::Unexpected(format!(
                "unknown merge strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageFormat {
    Parquet,
    Orc,
    Avro,
    RcFile,
    TextFile,
}

impl StorageFormat {
    /// Name as used in `STORED AS`.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFormat::Parquet => "PARQUET",
            StorageFormat::Orc => "ORC",
            StorageFormat::Avro => "AVRO",
            StorageFormat::RcFile => "RCFILE",
            StorageFormat::TextFile => "TEXTFILE",
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageFormat {
    type Err = CompactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PARQUET" => Ok(StorageFormat::Parquet),
            "ORC" => Ok(StorageFormat::Orc),
            "AVRO" => Ok(StorageFormat::Avro),
            "RCFILE" => Ok(StorageFormat::RcFile),
            "TEXTFILE" | "TEXT" => Ok(StorageFormat::TextFile),
            other => Err(CompactionError::UnsupportedTable(format!(
                "unknown storage format '{}'",
                other
            ))),
        }
    }
}

/// Identity and configuration of a task. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: Uuid,
    pub key: TableKey,
    /// `None` compacts the whole table.
    pub partition_filter: Option<String>,
    pub strategy: MergeStrategy,
    /// `<= 0` forces a single output file.
    pub target_file_size_bytes: i64,
    /// Falls back to the table's current format when unset.
    pub target_format: Option<StorageFormat>,
    pub target_compression: Option<String>,
    /// Rows imported from older stores may lack it.
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new(key: TableKey, target_file_size_bytes: i64) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            key,
            partition_filter: None,
            strategy: MergeStrategy::default(),
            target_file_size_bytes,
            target_format: None,
            target_compression: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn with_partition_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.partition_filter = if filter.trim().is_empty() {
            None
        } else {
            Some(filter)
        };
        self
    }

    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_target_format(mut self, format: StorageFormat) -> Self {
        self.target_format = Some(format);
        self
    }

    pub fn with_target_compression(mut self, compression: impl Into<String>) -> Self {
        self.target_compression = Some(compression.into().to_ascii_uppercase());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Copy of this spec for a different partition filter, with a new task id.
    pub fn for_filter(&self, filter: impl Into<String>) -> Self {
        let mut spec = self.clone().with_partition_filter(filter);
        spec.task_id = Uuid::new_v4();
        spec
    }

    pub fn force_single_file(&self) -> bool {
        self.target_file_size_bytes <= 0
    }
}

/// Lock fields of a task row. Written only by the table lock manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub acquired: bool,
    pub holder: Option<String>,
}

impl LockState {
    pub fn held_by(holder: impl Into<String>) -> Self {
        Self {
            acquired: true,
            holder: Some(holder.into()),
        }
    }

    pub fn released() -> Self {
        Self::default()
    }
}

/// Status, progress and result fields of a task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub files_before: Option<i64>,
    pub files_after: Option<i64>,
    pub bytes_saved: Option<i64>,
    pub error_message: Option<String>,
}

impl Default for TaskProgress {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            files_before: None,
            files_after: None,
            bytes_saved: None,
            error_message: None,
        }
    }
}

impl TaskProgress {
    /// Moves to `next`, rejecting backward moves and changes to terminal rows.
    pub fn transition(&mut self, next: TaskStatus) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(CompactionError::InvalidState(format!(
                "cannot move task from {} to {}",
                self.status, next
            )));
        }
        let now = Utc::now();
        match next {
            TaskStatus::Running => self.started_at = Some(now),
            status if status.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> crate::Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTask {
    pub spec: TaskSpec,
    pub lock: LockState,
    pub progress: TaskProgress,
}

impl MergeTask {
    /// A freshly created task is pending and unlocked.
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            lock: LockState::default(),
            progress: TaskProgress::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.spec.task_id
    }

    pub fn key(&self) -> &TableKey {
        &self.spec.key
    }

    pub fn status(&self) -> TaskStatus {
        self.progress.status
    }

    /// Holder id recorded by the lock manager for this task.
    pub fn holder_id(&self) -> String {
        self.spec.task_id.to_string()
    }

    /// Start of the lease: when the task started, or when it was created.
    pub fn lease_start(&self) -> Option<DateTime<Utc>> {
        self.progress.started_at.or(self.spec.created_at)
    }
}

/// Storage description of a table, re-read on every call and never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFormatInfo {
    pub input_format: String,
    pub output_format: String,
    pub serde: String,
    pub storage_handler: String,
    pub table_type: String,
    pub properties: HashMap<String, String>,
}

impl TableFormatInfo {
    pub fn is_empty(&self) -> bool {
        self.input_format.is_empty()
            && self.output_format.is_empty()
            && self.serde.is_empty()
            && self.storage_handler.is_empty()
            && self.table_type.is_empty()
            && self.properties.is_empty()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Ordered `column = value` pairs naming one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSpec {
    entries: Vec<(String, String)>,
}

impl PartitionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a value while keeping first-insertion order.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Directory form, e.g. `dt=2024-01-01/hour=00`.
    pub fn to_path(&self) -> String {
        self.entries
            .iter()
            .map(|(c, v)| format!("{}={}", c, v))
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Paths of one attempt. Never reused across attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowWriteContext {
    pub shadow_path: String,
    pub backup_path: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePhase {
    Validating,
    AnalyzingTable,
    PlanningShadow,
    WritingShadow,
    ValidatingShadow,
    AtomicSwap,
    Completed,
    Failed,
    RolledBack,
}

impl MergePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergePhase::Validating => "VALIDATING",
            MergePhase::AnalyzingTable => "ANALYZING_TABLE",
            MergePhase::PlanningShadow => "PLANNING_SHADOW",
            MergePhase::WritingShadow => "WRITING_SHADOW",
            MergePhase::ValidatingShadow => "VALIDATING_SHADOW",
            MergePhase::AtomicSwap => "ATOMIC_SWAP",
            MergePhase::Completed => "COMPLETED",
            MergePhase::Failed => "FAILED",
            MergePhase::RolledBack => "ROLLED_BACK",
        }
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task() -> MergeTask {
        MergeTask::new(TaskSpec::new(TableKey::new("c1", "sales", "orders"), 0))
    }

    #[test]
    fn test_new_task_is_pending_and_unlocked() {
        let task = sample_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(!task.lock.acquired);
        assert!(task.lock.holder.is_none());
        assert!(task.spec.force_single_file());
    }

    #[test]
    fn test_status_transitions_are_forward_only() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Success.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Success.can_transition_to(Cancelled));
    }

    #[test]
    fn test_progress_transition_stamps_times() {
        let mut progress = TaskProgress::default();
        progress.transition(TaskStatus::Running).unwrap();
        assert!(progress.started_at.is_some());
        assert!(progress.completed_at.is_none());
        progress.fail("boom").unwrap();
        assert_eq!(progress.status, TaskStatus::Failed);
        assert!(progress.completed_at.is_some());
        assert_eq!(progress.error_message.as_deref(), Some("boom"));
        assert!(progress.transition(TaskStatus::Success).is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_empty_filter_means_whole_table() {
        let spec = TaskSpec::new(TableKey::new("c1", "db", "t"), 1).with_partition_filter("  ");
        assert!(spec.partition_filter.is_none());
    }

    #[test]
    fn test_for_filter_assigns_new_id() {
        let spec = TaskSpec::new(TableKey::new("c1", "db", "t"), 1);
        let split = spec.for_filter("dt='2024-01-01'");
        assert_ne!(spec.task_id, split.task_id);
        assert_eq!(split.partition_filter.as_deref(), Some("dt='2024-01-01'"));
        assert_eq!(split.key, spec.key);
    }

    #[test]
    fn test_partition_spec_keeps_order() {
        let mut spec = PartitionSpec::new();
        spec.insert("dt", "2024-01-01");
        spec.insert("hour", "00");
        spec.insert("dt", "2024-01-02");
        assert_eq!(spec.len(), 2);
        assert_eq!(spec.get("dt"), Some("2024-01-02"));
        assert_eq!(spec.to_path(), "dt=2024-01-02/hour=00");
    }
}
