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

//! Caller side of a merge: task submission, lock handling and persistence
//! of results around [`MergeExecutor::execute`].

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use futures::future::join_all;
use mixtrics::registry::noop::NoopMetricsRegistry;
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::{MergeMetricsRecorder, Metrics};
use crate::config::MergeConfig;
use crate::executor::{MergeExecutor, MergeOutcome, apply_outcome};
use crate::lock::TableLockManager;
use crate::model::{MergeTask, TableKey, TaskSpec, TaskStatus};
use crate::partition::split_or_filter;
use crate::store::TaskStore;
use crate::{CompactionError, Result};

pub struct CompactionRunner {
    config: Arc<MergeConfig>,
    store: Arc<dyn TaskStore>,
    locks: TableLockManager,
    executor: Arc<dyn MergeExecutor>,
    metrics: Arc<Metrics>,
}

impl CompactionRunner {
    pub fn new(
        config: Arc<MergeConfig>,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn MergeExecutor>,
    ) -> Self {
        Self {
            locks: TableLockManager::new(store.clone(), config.lease_minutes),
            config,
            store,
            executor,
            metrics: Arc::new(Metrics::new(Box::new(NoopMetricsRegistry))),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn lock_manager(&self) -> &TableLockManager {
        &self.locks
    }

    /// Whole-table spec with the configured default target size.
    pub fn new_spec(&self, key: TableKey) -> TaskSpec {
        TaskSpec::new(key, self.config.default_target_file_size_bytes)
    }

    /// Stores `spec` as pending. An `OR` filter is split into one task per
    /// disjunct; each task still rewrites a single directory.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Vec<MergeTask>> {
        let spec = if spec.created_at.is_some() {
            spec
        } else {
            spec.with_created_at(Utc::now())
        };
        let specs = match spec.partition_filter.as_deref().map(split_or_filter) {
            Some(parts) if parts.len() > 1 => parts.iter().map(|p| spec.for_filter(p)).collect(),
            _ => vec![spec],
        };

        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = MergeTask::new(spec);
            self.store.insert(&task).await?;
            info!(
                task_id = %task.id(),
                table = %task.key(),
                filter = ?task.spec.partition_filter,
                "merge task submitted"
            );
            tasks.push(task);
        }
        Ok(tasks)
    }

    async fn acquire_once(&self, task_id: Uuid) -> Result<()> {
        let res = self.locks.acquire(task_id).await;
        match (res.granted, res.holder) {
            (true, _) => Ok(()),
            (false, Some(holder)) => Err(CompactionError::LockConflict { holder }),
            (false, None) => Err(CompactionError::InvalidState(res.message)),
        }
    }

    async fn acquire(&self, task_id: Uuid) -> Result<()> {
        let retry = &self.config.lock_retry;
        if retry.max_retries == 0 {
            return self.acquire_once(task_id).await;
        }
        let backoff = ExponentialBuilder::default()
            .with_min_delay(retry.initial_delay)
            .with_max_delay(retry.max_delay)
            .with_max_times(retry.max_retries as usize);

        (|| self.acquire_once(task_id))
            .retry(backoff)
            .when(|e: &CompactionError| matches!(e, CompactionError::LockConflict { .. }))
            .notify(|e: &CompactionError, delay: Duration| {
                info!(%task_id, error = %e, ?delay, "table busy, retrying lock");
            })
            .await
    }

    /// Runs one pending task to a terminal state. The lock is released on
    /// every path once it was granted.
    pub async fn run(&self, task_id: Uuid) -> Result<MergeOutcome> {
        let task = self.store.get_required(task_id).await?;
        if task.status() != TaskStatus::Pending {
            return Err(CompactionError::InvalidState(format!(
                "task {} is {}; only pending tasks can run",
                task_id,
                task.status()
            )));
        }

        if let Err(e) = self.acquire(task_id).await {
            if matches!(e, CompactionError::LockConflict { .. }) {
                MergeMetricsRecorder::new(self.metrics.clone(), task.key()).record_lock_conflict();
            }
            return Err(e);
        }

        let result = self.run_locked(task_id).await;

        let released = self.locks.release(task_id).await;
        if !released.granted {
            warn!(%task_id, message = %released.message, "failed to release table lock");
        }
        result
    }

    async fn run_locked(&self, task_id: Uuid) -> Result<MergeOutcome> {
        // Re-read: the task may have been cancelled while waiting for the lock.
        let mut task = self.store.get_required(task_id).await?;
        if task.status() != TaskStatus::Pending {
            return Err(CompactionError::InvalidState(format!(
                "task {} became {} before it started",
                task_id,
                task.status()
            )));
        }
        task.progress.transition(TaskStatus::Running)?;
        self.store.update_progress(task_id, &task.progress).await?;

        let result = self.executor.execute(&task).await;

        let current = self.store.get_required(task_id).await?;
        if current.status().is_terminal() {
            warn!(
                %task_id,
                status = %current.status(),
                "task finished elsewhere; result not recorded"
            );
            return result;
        }
        let mut progress = task.progress.clone();
        apply_outcome(&mut progress, &result)?;
        self.store.update_progress(task_id, &progress).await?;
        match &result {
            Ok(outcome) => info!(
                %task_id,
                files_before = outcome.files_before.file_count,
                files_after = outcome.files_after.file_count,
                bytes_saved = outcome.bytes_saved(),
                "merge task succeeded"
            ),
            Err(e) => warn!(%task_id, error = %e, "merge task failed"),
        }
        result
    }

    /// Runs each task on its own tokio task. Tasks on the same table contend
    /// for its lock and the losers fail with [`CompactionError::LockConflict`].
    pub async fn run_all(self: &Arc<Self>, task_ids: &[Uuid]) -> Vec<Result<MergeOutcome>> {
        let handles = task_ids.iter().map(|&task_id| {
            let runner = self.clone();
            tokio::spawn(async move { runner.run(task_id).await })
        });
        join_all(handles)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    Err(CompactionError::Unexpected(format!("merge task panicked: {}", e)))
                })
            })
            .collect()
    }

    /// Marks a non-terminal task cancelled. An attempt already in flight is
    /// not interrupted; its result is then discarded.
    pub async fn cancel(&self, task_id: Uuid) -> Result<MergeTask> {
        let mut task = self.store.get_required(task_id).await?;
        task.progress.transition(TaskStatus::Cancelled)?;
        self.store.update_progress(task_id, &task.progress).await?;
        info!(%task_id, "merge task cancelled");
        Ok(task)
    }

    pub async fn sweep_expired(&self) -> usize {
        self.locks.sweep_expired().await
    }
}
