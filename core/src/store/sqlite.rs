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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use super::TaskStore;
use crate::model::{
    LockState, MergeTask, StorageFormat, TableKey, TaskProgress, TaskSpec, TaskStatus,
};
use crate::{CompactionError, Result};

const CREATE_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS merge_task (
    task_id TEXT PRIMARY KEY NOT NULL,
    cluster TEXT NOT NULL,
    database_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    partition_filter TEXT,
    strategy TEXT NOT NULL,
    target_file_size_bytes INTEGER NOT NULL,
    target_format TEXT,
    target_compression TEXT,
    created_at TIMESTAMP,
    lock_acquired BOOLEAN NOT NULL DEFAULT FALSE,
    lock_holder TEXT,
    status TEXT NOT NULL,
    started_at TIMESTAMP,
    completed_at TIMESTAMP,
    files_before INTEGER,
    files_after INTEGER,
    bytes_saved INTEGER,
    error_message TEXT
)
"#;

const CREATE_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS merge_task_table_idx \
     ON merge_task (cluster, database_name, table_name, lock_acquired)";

const SELECT_COLUMNS: &str = "task_id, cluster, database_name, table_name, partition_filter, \
     strategy, target_file_size_bytes, target_format, target_compression, created_at, \
     lock_acquired, lock_holder, status, started_at, completed_at, files_before, files_after, \
     bytes_saved, error_message";

/// [`TaskStore`] over SQLite. Every update is a single statement, so a row is
/// committed atomically but no cross-row guarantees are made.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Connects and creates the `merge_task` table if needed.
    ///
    /// `sqlite::memory:` databases are per connection, so the pool is capped
    /// at one connection for them.
    pub async fn connect(url: &str) -> Result<Self> {
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX_SQL).execute(&self.pool).await?;
        Ok(())
    }

    fn task_from_row(row: &SqliteRow) -> Result<MergeTask> {
        let task_id: String = row.try_get("task_id")?;
        let task_id = Uuid::parse_str(&task_id)
            .map_err(|e| CompactionError::Unexpected(format!("bad task id {}: {}", task_id, e)))?;
        let strategy: String = row.try_get("strategy")?;
        let status: String = row.try_get("status")?;
        let target_format: Option<String> = row.try_get("target_format")?;

        let spec = TaskSpec {
            task_id,
            key: TableKey::new(
                row.try_get::<String, _>("cluster")?,
                row.try_get::<String, _>("database_name")?,
                row.try_get::<String, _>("table_name")?,
            ),
            partition_filter: row.try_get("partition_filter")?,
            strategy: strategy.parse()?,
            target_file_size_bytes: row.try_get("target_file_size_bytes")?,
            target_format: target_format
                .map(|f| f.parse::<StorageFormat>())
                .transpose()?,
            target_compression: row.try_get("target_compression")?,
            created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
        };
        let lock = LockState {
            acquired: row.try_get("lock_acquired")?,
            holder: row.try_get("lock_holder")?,
        };
        let progress = TaskProgress {
            status: status.parse::<TaskStatus>()?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            files_before: row.try_get("files_before")?,
            files_after: row.try_get("files_after")?,
            bytes_saved: row.try_get("bytes_saved")?,
            error_message: row.try_get("error_message")?,
        };
        Ok(MergeTask {
            spec,
            lock,
            progress,
        })
    }

    fn ensure_updated(task_id: Uuid, rows_affected: u64) -> Result<()> {
        if rows_affected == 0 {
            return Err(CompactionError::InvalidState(format!(
                "task {} not found",
                task_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &MergeTask) -> Result<()> {
        let spec = &task.spec;
        sqlx::query(
            "INSERT INTO merge_task (task_id, cluster, database_name, table_name, \
             partition_filter, strategy, target_file_size_bytes, target_format, \
             target_compression, created_at, lock_acquired, lock_holder, status, started_at, \
             completed_at, files_before, files_after, bytes_saved, error_message) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(spec.task_id.to_string())
        .bind(&spec.key.cluster)
        .bind(&spec.key.database)
        .bind(&spec.key.table)
        .bind(&spec.partition_filter)
        .bind(spec.strategy.as_str())
        .bind(spec.target_file_size_bytes)
        .bind(spec.target_format.map(|f| f.as_str()))
        .bind(&spec.target_compression)
        .bind(spec.created_at)
        .bind(task.lock.acquired)
        .bind(&task.lock.holder)
        .bind(task.progress.status.as_str())
        .bind(task.progress.started_at)
        .bind(task.progress.completed_at)
        .bind(task.progress.files_before)
        .bind(task.progress.files_after)
        .bind(task.progress.bytes_saved)
        .bind(&task.progress.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<MergeTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM merge_task WHERE task_id = ?",
            SELECT_COLUMNS
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::task_from_row).transpose()
    }

    async fn active_lock_holders(&self, key: &TableKey) -> Result<Vec<MergeTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM merge_task WHERE cluster = ? AND database_name = ? \
             AND table_name = ? AND lock_acquired = TRUE AND status IN ('pending', 'running')",
            SELECT_COLUMNS
        ))
        .bind(&key.cluster)
        .bind(&key.database)
        .bind(&key.table)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn locked_tasks(&self) -> Result<Vec<MergeTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM merge_task WHERE lock_acquired = TRUE",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::task_from_row).collect()
    }

    async fn update_lock(&self, task_id: Uuid, lock: &LockState) -> Result<()> {
        let res = sqlx::query(
            "UPDATE merge_task SET lock_acquired = ?, lock_holder = ? WHERE task_id = ?",
        )
        .bind(lock.acquired)
        .bind(&lock.holder)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(task_id, res.rows_affected())
    }

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
        let res = sqlx::query(
            "UPDATE merge_task SET status = ?, started_at = ?, completed_at = ?, \
             files_before = ?, files_after = ?, bytes_saved = ?, error_message = ? \
             WHERE task_id = ?",
        )
        .bind(progress.status.as_str())
        .bind(progress.started_at)
        .bind(progress.completed_at)
        .bind(progress.files_before)
        .bind(progress.files_after)
        .bind(progress.bytes_saved)
        .bind(&progress.error_message)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Self::ensure_updated(task_id, res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MergeStrategy;

    async fn memory_store() -> SqliteTaskStore {
        SqliteTaskStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_insert_and_get() {
        let store = memory_store().await;
        let spec = TaskSpec::new(TableKey::new("c1", "sales", "events"), 128)
            .with_partition_filter("dt='2024-01-01'")
            .with_strategy(MergeStrategy::Concatenate)
            .with_target_format(StorageFormat::Orc)
            .with_target_compression("zlib");
        let task = MergeTask::new(spec);
        store.insert(&task).await.unwrap();

        let loaded = store.get_required(task.id()).await.unwrap();
        assert_eq!(loaded.spec.key, task.spec.key);
        assert_eq!(loaded.spec.partition_filter.as_deref(), Some("dt='2024-01-01'"));
        assert_eq!(loaded.spec.strategy, MergeStrategy::Concatenate);
        assert_eq!(loaded.spec.target_format, Some(StorageFormat::Orc));
        assert_eq!(loaded.spec.target_compression.as_deref(), Some("ZLIB"));
        assert_eq!(loaded.status(), TaskStatus::Pending);
        assert!(loaded.spec.created_at.is_some());
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_lock_and_progress_updates() {
        let store = memory_store().await;
        let key = TableKey::new("c1", "sales", "orders");
        let task = MergeTask::new(TaskSpec::new(key.clone(), 0));
        store.insert(&task).await.unwrap();
        assert!(store.active_lock_holders(&key).await.unwrap().is_empty());

        store
            .update_lock(task.id(), &LockState::held_by(task.holder_id()))
            .await
            .unwrap();
        let holders = store.active_lock_holders(&key).await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].lock.holder, Some(task.holder_id()));

        let mut progress = TaskProgress::default();
        progress.transition(TaskStatus::Running).unwrap();
        progress.transition(TaskStatus::Success).unwrap();
        progress.files_before = Some(500);
        progress.files_after = Some(2);
        store.update_progress(task.id(), &progress).await.unwrap();

        // Terminal tasks no longer count as holders even with the flag set.
        assert!(store.active_lock_holders(&key).await.unwrap().is_empty());
        assert_eq!(store.locked_tasks().await.unwrap().len(), 1);

        let loaded = store.get_required(task.id()).await.unwrap();
        assert_eq!(loaded.progress.files_before, Some(500));
        assert_eq!(loaded.progress.files_after, Some(2));
        assert!(loaded.progress.completed_at.is_some());

        assert!(
            store
                .update_progress(Uuid::new_v4(), &progress)
                .await
                .is_err()
        );
    }
}
