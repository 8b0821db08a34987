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

//! Advisory, lease-based table lock stored on the task rows themselves.
//!
//! `acquire` reads the current holders and then writes the flag in a
//! separate statement. Two callers racing between those steps can both be
//! granted the lock; the lease and the executor's non-destructive shadow
//! write bound the damage. Failures are reported in [`LockResult`], never
//! raised, so contention reads as "retry later".

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{LockState, MergeTask, TaskStatus};
use crate::store::TaskStore;

pub const LOCK_EXPIRED_MESSAGE: &str = "table lock lease expired; task presumed dead";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub granted: bool,
    /// Current holder when the lock was refused.
    pub holder: Option<String>,
    pub message: String,
}

impl LockResult {
    fn granted(message: impl Into<String>) -> Self {
        Self {
            granted: true,
            holder: None,
            message: message.into(),
        }
    }

    fn refused(holder: Option<String>, message: impl Into<String>) -> Self {
        Self {
            granted: false,
            holder,
            message: message.into(),
        }
    }
}

pub struct TableLockManager {
    store: Arc<dyn TaskStore>,
    lease_minutes: i64,
}

impl TableLockManager {
    pub fn new(store: Arc<dyn TaskStore>, lease_minutes: i64) -> Self {
        Self {
            store,
            lease_minutes,
        }
    }

    pub fn lease_minutes(&self) -> i64 {
        self.lease_minutes
    }

    /// Grants the lock on the task's table unless another unexpired active
    /// task holds it. Expired holders are force-released first.
    ///
    /// The holder check and the flag write are separate store calls, so two
    /// callers racing on one table can both be granted.
    pub async fn acquire(&self, task_id: Uuid) -> LockResult {
        self.acquire_with_lease(task_id, self.lease_minutes).await
    }

    pub async fn acquire_with_lease(&self, task_id: Uuid, lease_minutes: i64) -> LockResult {
        let task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return LockResult::refused(None, format!("task {} not found", task_id)),
            Err(e) => {
                error!(%task_id, error = %e, "failed to load task for locking");
                return LockResult::refused(None, format!("failed to load task: {}", e));
            }
        };
        if task.status().is_terminal() {
            return LockResult::refused(
                None,
                format!("task {} is {} and cannot take a lock", task_id, task.status()),
            );
        }

        let holders = match self.store.active_lock_holders(task.key()).await {
            Ok(holders) => holders,
            Err(e) => {
                error!(%task_id, error = %e, "failed to read lock holders");
                return LockResult::refused(None, format!("failed to read lock holders: {}", e));
            }
        };

        let now = Utc::now();
        for holder in holders.iter().filter(|h| h.id() != task_id) {
            if !is_expired_at(holder, lease_minutes, now) {
                let holder_id = holder.lock.holder.clone().unwrap_or_else(|| holder.holder_id());
                info!(
                    %task_id,
                    table = %task.key(),
                    holder = %holder_id,
                    "table lock held by another task"
                );
                return LockResult::refused(
                    Some(holder_id.clone()),
                    format!("table {} is locked by task {}", task.key(), holder_id),
                );
            }
            warn!(%task_id, expired = %holder.id(), "reclaiming expired table lock");
            if let Err(e) = self.force_release(holder).await {
                return LockResult::refused(
                    holder.lock.holder.clone(),
                    format!("failed to reclaim expired lock of {}: {}", holder.id(), e),
                );
            }
        }

        if let Err(e) = self
            .store
            .update_lock(task_id, &LockState::held_by(task.holder_id()))
            .await
        {
            error!(%task_id, error = %e, "failed to record table lock");
            return LockResult::refused(None, format!("failed to record lock: {}", e));
        }
        info!(%task_id, table = %task.key(), "table lock acquired");
        LockResult::granted(format!("lock on {} granted to {}", task.key(), task_id))
    }

    /// Clears the lock fields. Releasing an unlocked task is a no-op.
    pub async fn release(&self, task_id: Uuid) -> LockResult {
        match self.store.get(task_id).await {
            Ok(Some(task)) if !task.lock.acquired && task.lock.holder.is_none() => {
                LockResult::granted(format!("task {} held no lock", task_id))
            }
            Ok(Some(_)) => match self.store.update_lock(task_id, &LockState::released()).await {
                Ok(()) => {
                    info!(%task_id, "table lock released");
                    LockResult::granted(format!("lock of {} released", task_id))
                }
                Err(e) => {
                    error!(%task_id, error = %e, "failed to release table lock");
                    LockResult::refused(None, format!("failed to release lock: {}", e))
                }
            },
            Ok(None) => LockResult::refused(None, format!("task {} not found", task_id)),
            Err(e) => LockResult::refused(None, format!("failed to load task: {}", e)),
        }
    }

    /// Clears the lock of a presumed-dead holder. A running holder is marked
    /// failed; a pending one stays pending.
    pub async fn force_release(&self, task: &MergeTask) -> crate::Result<()> {
        self.store
            .update_lock(task.id(), &LockState::released())
            .await?;
        if task.status() == TaskStatus::Running {
            let mut progress = task.progress.clone();
            progress.fail(LOCK_EXPIRED_MESSAGE)?;
            self.store.update_progress(task.id(), &progress).await?;
        }
        info!(task_id = %task.id(), status = %task.status(), "table lock force-released");
        Ok(())
    }

    /// Force-releases every expired lock. Returns how many were released.
    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_with_lease(self.lease_minutes).await
    }

    pub async fn sweep_expired_with_lease(&self, lease_minutes: i64) -> usize {
        let locked = match self.store.locked_tasks().await {
            Ok(locked) => locked,
            Err(e) => {
                error!(error = %e, "failed to list locked tasks");
                return 0;
            }
        };
        let now = Utc::now();
        let mut released = 0;
        for task in locked {
            // Terminal rows keeping the flag are leftovers of a missed release.
            if task.status().is_terminal() || is_expired_at(&task, lease_minutes, now) {
                match self.force_release(&task).await {
                    Ok(()) => released += 1,
                    Err(e) => warn!(task_id = %task.id(), error = %e, "failed to sweep lock"),
                }
            }
        }
        if released > 0 {
            info!(released, "swept expired table locks");
        }
        released
    }
}

/// True iff the task is locked and its lease started more than
/// `lease_minutes` ago. A task with no timestamps never expires.
pub fn is_expired(task: &MergeTask, lease_minutes: i64) -> bool {
    is_expired_at(task, lease_minutes, Utc::now())
}

fn is_expired_at(task: &MergeTask, lease_minutes: i64, now: DateTime<Utc>) -> bool {
    if !task.lock.acquired {
        return false;
    }
    match task.lease_start() {
        Some(start) => now - start > Duration::minutes(lease_minutes),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TableKey, TaskProgress, TaskSpec};
    use crate::store::InMemoryTaskStore;

    fn key() -> TableKey {
        TableKey::new("c1", "sales", "orders")
    }

    async fn setup() -> (Arc<InMemoryTaskStore>, TableLockManager) {
        let store = Arc::new(InMemoryTaskStore::new());
        let manager = TableLockManager::new(store.clone(), 120);
        (store, manager)
    }

    async fn insert(store: &InMemoryTaskStore, task: MergeTask) -> MergeTask {
        store.insert(&task).await.unwrap();
        task
    }

    fn started_minutes_ago(minutes: i64) -> MergeTask {
        let mut task = MergeTask::new(TaskSpec::new(key(), 0));
        task.lock = LockState::held_by(task.holder_id());
        task.progress = TaskProgress {
            status: TaskStatus::Running,
            started_at: Some(Utc::now() - Duration::minutes(minutes)),
            ..Default::default()
        };
        task
    }

    #[test]
    fn test_expiry() {
        assert!(is_expired(&started_minutes_ago(180), 120));
        assert!(!is_expired(&started_minutes_ago(10), 120));

        let mut unlocked = started_minutes_ago(180);
        unlocked.lock = LockState::released();
        assert!(!is_expired(&unlocked, 120));

        let mut no_times = started_minutes_ago(180);
        no_times.progress.started_at = None;
        no_times.spec.created_at = None;
        assert!(!is_expired(&no_times, 120));

        // Falls back to creation time when the task never started.
        let mut pending = MergeTask::new(
            TaskSpec::new(key(), 0).with_created_at(Utc::now() - Duration::minutes(200)),
        );
        pending.lock = LockState::held_by(pending.holder_id());
        assert!(is_expired(&pending, 120));
    }

    #[tokio::test]
    async fn test_mutual_exclusion_and_release() {
        let (store, manager) = setup().await;
        let t1 = insert(&store, MergeTask::new(TaskSpec::new(key(), 0))).await;
        let t2 = insert(&store, MergeTask::new(TaskSpec::new(key(), 0))).await;

        assert!(manager.acquire(t1.id()).await.granted);
        let refused = manager.acquire(t2.id()).await;
        assert!(!refused.granted);
        assert_eq!(refused.holder, Some(t1.id().to_string()));

        assert!(manager.release(t1.id()).await.granted);
        assert!(manager.acquire(t2.id()).await.granted);
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_is_granted() {
        let (store, manager) = setup().await;
        let t1 = insert(&store, MergeTask::new(TaskSpec::new(key(), 0))).await;
        assert!(manager.acquire(t1.id()).await.granted);
        assert!(manager.acquire(t1.id()).await.granted);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, manager) = setup().await;
        let t1 = insert(&store, MergeTask::new(TaskSpec::new(key(), 0))).await;
        assert!(manager.acquire(t1.id()).await.granted);

        let first = manager.release(t1.id()).await;
        let second = manager.release(t1.id()).await;
        assert!(first.granted);
        assert!(second.granted);
        assert!(second.message.contains("no lock"));
        assert!(!store.get_required(t1.id()).await.unwrap().lock.acquired);
    }

    #[tokio::test]
    async fn test_expired_running_holder_is_failed_and_replaced() {
        let (store, manager) = setup().await;
        let stale = insert(&store, started_minutes_ago(180)).await;
        let fresh = insert(&store, MergeTask::new(TaskSpec::new(key(), 0))).await;

        assert!(manager.acquire(fresh.id()).await.granted);

        let stale = store.get_required(stale.id()).await.unwrap();
        assert!(!stale.lock.acquired);
        assert_eq!(stale.status(), TaskStatus::Failed);
        assert_eq!(stale.progress.error_message.as_deref(), Some(LOCK_EXPIRED_MESSAGE));
        assert!(stale.progress.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_force_release_leaves_pending_pending() {
        let (store, manager) = setup().await;
        let mut pending = MergeTask::new(TaskSpec::new(key(), 0));
        pending.lock = LockState::held_by(pending.holder_id());
        let pending = insert(&store, pending).await;

        manager.force_release(&pending).await.unwrap();
        let pending = store.get_required(pending.id()).await.unwrap();
        assert!(!pending.lock.acquired);
        assert_eq!(pending.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (store, manager) = setup().await;
        let stale = insert(&store, started_minutes_ago(300)).await;
        let live = insert(&store, started_minutes_ago(5)).await;

        assert_eq!(manager.sweep_expired().await, 1);
        assert!(!store.get_required(stale.id()).await.unwrap().lock.acquired);
        assert!(store.get_required(live.id()).await.unwrap().lock.acquired);
        assert_eq!(manager.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn test_terminal_task_cannot_lock() {
        let (store, manager) = setup().await;
        let mut done = MergeTask::new(TaskSpec::new(key(), 0));
        done.progress.status = TaskStatus::Success;
        let done = insert(&store, done).await;
        assert!(!manager.acquire(done.id()).await.granted);
        assert!(!manager.acquire(Uuid::new_v4()).await.granted);
    }

    /// Both holders pass the read before either writes: the documented race.
    struct RacyStore {
        inner: InMemoryTaskStore,
        barrier: tokio::sync::Barrier,
    }

    #[async_trait::async_trait]
    impl TaskStore for RacyStore {
        async fn insert(&self, task: &MergeTask) -> crate::Result<()> {
            self.inner.insert(task).await
        }

        async fn get(&self, task_id: Uuid) -> crate::Result<Option<MergeTask>> {
            self.inner.get(task_id).await
        }

        async fn active_lock_holders(&self, key: &TableKey) -> crate::Result<Vec<MergeTask>> {
            let holders = self.inner.active_lock_holders(key).await;
            self.barrier.wait().await;
            holders
        }

        async fn locked_tasks(&self) -> crate::Result<Vec<MergeTask>> {
            self.inner.locked_tasks().await
        }

        async fn update_lock(&self, task_id: Uuid, lock: &LockState) -> crate::Result<()> {
            self.inner.update_lock(task_id, lock).await
        }

        async fn update_progress(
            &self,
            task_id: Uuid,
            progress: &TaskProgress,
        ) -> crate::Result<()> {
            self.inner.update_progress(task_id, progress).await
        }
    }

    #[tokio::test]
    async fn test_read_then_write_race_window() {
        let store = Arc::new(RacyStore {
            inner: InMemoryTaskStore::new(),
            barrier: tokio::sync::Barrier::new(2),
        });
        let t1 = MergeTask::new(TaskSpec::new(key(), 0));
        let t2 = MergeTask::new(TaskSpec::new(key(), 0));
        store.insert(&t1).await.unwrap();
        store.insert(&t2).await.unwrap();

        let manager = TableLockManager::new(store.clone(), 120);
        let (r1, r2) = tokio::join!(manager.acquire(t1.id()), manager.acquire(t2.id()));
        assert!(r1.granted && r2.granted);
        assert_eq!(store.inner.active_lock_holders(&key()).await.unwrap().len(), 2);
    }
}
