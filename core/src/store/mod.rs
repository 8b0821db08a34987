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

//! Persistence of merge task rows.
//!
//! Writes are split by field group: [`TaskStore::update_lock`] for the lock
//! manager and [`TaskStore::update_progress`] for the executor path. Neither
//! touches the other group or the immutable [`TaskSpec`](crate::model::TaskSpec).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{LockState, MergeTask, TableKey, TaskProgress};
use crate::{CompactionError, Result};

pub mod sqlite;
pub use sqlite::SqliteTaskStore;

#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    async fn insert(&self, task: &MergeTask) -> Result<()>;

    async fn get(&self, task_id: Uuid) -> Result<Option<MergeTask>>;

    /// Tasks on `key` that hold the lock flag and are pending or running.
    async fn active_lock_holders(&self, key: &TableKey) -> Result<Vec<MergeTask>>;

    /// Every task holding the lock flag, whatever its status.
    async fn locked_tasks(&self) -> Result<Vec<MergeTask>>;

    async fn update_lock(&self, task_id: Uuid, lock: &LockState) -> Result<()>;

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()>;

    async fn get_required(&self, task_id: Uuid) -> Result<MergeTask> {
        self.get(task_id)
            .await?
            .ok_or_else(|| CompactionError::InvalidState(format!("task {} not found", task_id)))
    }
}

/// Store backed by a map, for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<Uuid, MergeTask>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &MergeTask) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id()) {
            return Err(CompactionError::InvalidState(format!(
                "task {} already exists",
                task.id()
            )));
        }
        tasks.insert(task.id(), task.clone());
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<MergeTask>> {
        Ok(self.tasks.read().await.get(&task_id).cloned())
    }

    async fn active_lock_holders(&self, key: &TableKey) -> Result<Vec<MergeTask>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.lock.acquired && t.status().is_active() && t.key() == key)
            .cloned()
            .collect())
    }

    async fn locked_tasks(&self) -> Result<Vec<MergeTask>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.lock.acquired)
            .cloned()
            .collect())
    }

    async fn update_lock(&self, task_id: Uuid, lock: &LockState) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| CompactionError::InvalidState(format!("task {} not found", task_id)))?;
        task.lock = lock.clone();
        Ok(())
    }

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| CompactionError::InvalidState(format!("task {} not found", task_id)))?;
        task.progress = progress.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TaskSpec, TaskStatus};

    #[tokio::test]
    async fn test_in_memory_lock_holders_filter_by_key_and_status() {
        let store = InMemoryTaskStore::new();
        let key = TableKey::new("c1", "sales", "orders");
        let other = TableKey::new("c1", "sales", "items");

        let mut locked = MergeTask::new(TaskSpec::new(key.clone(), 0));
        locked.lock = LockState::held_by(locked.holder_id());
        let mut finished = MergeTask::new(TaskSpec::new(key.clone(), 0));
        finished.lock = LockState::held_by(finished.holder_id());
        finished.progress.status = TaskStatus::Success;
        let mut elsewhere = MergeTask::new(TaskSpec::new(other, 0));
        elsewhere.lock = LockState::held_by(elsewhere.holder_id());
        let unlocked = MergeTask::new(TaskSpec::new(key.clone(), 0));

        for task in [&locked, &finished, &elsewhere, &unlocked] {
            store.insert(task).await.unwrap();
        }

        let holders = store.active_lock_holders(&key).await.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].id(), locked.id());
        assert_eq!(store.locked_tasks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_updates_touch_one_field_group() {
        let store = InMemoryTaskStore::new();
        let task = MergeTask::new(TaskSpec::new(TableKey::new("c1", "db", "t"), 0));
        store.insert(&task).await.unwrap();
        assert!(store.insert(&task).await.is_err());

        store
            .update_lock(task.id(), &LockState::held_by("x"))
            .await
            .unwrap();
        let mut progress = TaskProgress::default();
        progress.transition(TaskStatus::Running).unwrap();
        store.update_progress(task.id(), &progress).await.unwrap();

        let loaded = store.get_required(task.id()).await.unwrap();
        assert_eq!(loaded.lock, LockState::held_by("x"));
        assert_eq!(loaded.status(), TaskStatus::Running);
        assert_eq!(loaded.spec, task.spec);

        assert!(
            store
                .update_lock(Uuid::new_v4(), &LockState::released())
                .await
                .is_err()
        );
    }
}
