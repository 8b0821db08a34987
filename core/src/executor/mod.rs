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

//! Merge task execution: validate, plan, write a shadow copy, verify it and
//! swap it into place.
//!
//! The live target is touched only in [`MergePhase::AtomicSwap`]. Every
//! failure before that point leaves the target intact and at most an
//! orphaned shadow directory behind. The caller must hold the table lock;
//! two executions against the same target path must not overlap.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use mixtrics::registry::noop::NoopMetricsRegistry;
use tracing::{error, info, warn};

use crate::common::{MergeMetricsRecorder, Metrics};
use crate::config::MergeConfig;
use crate::file_counter::{FileCounter, FileStats};
use crate::fs::{FileSystem, join_path, parent_and_name};
use crate::metadata::{MetadataManager, infer_compression, infer_storage_format};
use crate::model::{
    MergePhase, MergeStrategy, MergeTask, ShadowWriteContext, StorageFormat, TaskProgress,
    TaskStatus,
};
use crate::partition::{PartitionPathResolver, filter_to_partition_spec_clause};
use crate::task_log::{LogLevel, TaskLogger, TracingTaskLogger};
use crate::validation::{ValidationFailure, ValidationService};
use crate::{CompactionError, Result};

pub mod mock;
pub mod sql_builder;

pub use mock::MockMergeExecutor;
pub use sql_builder::RewriteStatementBuilder;

#[async_trait]
pub trait MergeExecutor: Send + Sync + 'static {
    async fn execute(&self, task: &MergeTask) -> Result<MergeOutcome>;
}

/// Result of a completed merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// `None` for in-place strategies.
    pub shadow_path: Option<String>,
    /// Left in place after success for manual audit.
    pub backup_path: Option<String>,
    pub target_path: String,
    pub statement_executed: String,
    pub files_before: FileStats,
    pub files_after: FileStats,
}

impl MergeOutcome {
    pub fn bytes_saved(&self) -> u64 {
        self.files_before
            .total_bytes
            .saturating_sub(self.files_after.total_bytes)
    }
}

/// Writes the outcome of an execution into the progress fields of a task.
pub fn apply_outcome(progress: &mut TaskProgress, result: &Result<MergeOutcome>) -> Result<()> {
    match result {
        Ok(outcome) => {
            progress.transition(TaskStatus::Success)?;
            progress.files_before = Some(outcome.files_before.file_count as i64);
            progress.files_after = Some(outcome.files_after.file_count as i64);
            progress.bytes_saved = Some(outcome.bytes_saved() as i64);
            progress.error_message = None;
        }
        Err(e) => progress.fail(e.to_string())?,
    }
    Ok(())
}

/// Table being analyzed: where it lives and how it is stored.
struct TableAnalysis {
    location: String,
    format: StorageFormat,
    compression: String,
}

pub struct MergeTaskExecutor {
    config: Arc<MergeConfig>,
    metadata: Arc<MetadataManager>,
    fs: Arc<dyn FileSystem>,
    resolver: PartitionPathResolver,
    validator: ValidationService,
    counter: FileCounter,
    logger: Arc<dyn TaskLogger>,
    metrics: Arc<Metrics>,
}

impl MergeTaskExecutor {
    pub fn new(
        config: Arc<MergeConfig>,
        metadata: Arc<MetadataManager>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            resolver: PartitionPathResolver::new(metadata.clone(), fs.clone()),
            validator: ValidationService::new(metadata.clone()),
            counter: FileCounter::new(fs.clone()),
            config,
            metadata,
            fs,
            logger: Arc::new(TracingTaskLogger),
            metrics: Arc::new(Metrics::new(Box::new(NoopMetricsRegistry))),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TaskLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn log(&self, task: &MergeTask, phase: MergePhase, level: LogLevel, message: &str) {
        self.logger.log(task.id(), phase, level, message).await;
    }

    /// Logs the failure under [`MergePhase::Failed`] and hands the error back.
    async fn fail(&self, task: &MergeTask, err: CompactionError) -> CompactionError {
        self.log(task, MergePhase::Failed, LogLevel::Error, &err.to_string())
            .await;
        err
    }

    async fn validate(&self, task: &MergeTask) -> Result<()> {
        self.log(task, MergePhase::Validating, LogLevel::Info, "running pre-flight checks")
            .await;
        let (result, failure) = self.validator.validate_detailed(task).await;
        for warning in &result.warnings {
            self.log(task, MergePhase::Validating, LogLevel::Warn, warning)
                .await;
        }
        if result.valid {
            return Ok(());
        }
        Err(match failure {
            Some(ValidationFailure::Unsupported) => {
                CompactionError::UnsupportedTable(result.message)
            }
            _ => CompactionError::Configuration(result.message),
        })
    }

    async fn analyze(&self, task: &MergeTask) -> Result<TableAnalysis> {
        let key = task.key();
        self.log(
            task,
            MergePhase::AnalyzingTable,
            LogLevel::Info,
            "resolving location and storage format",
        )
        .await;
        let location = self
            .metadata
            .get_table_location(&key.database, &key.table)
            .await
            .ok_or_else(|| {
                CompactionError::Configuration(format!(
                    "cannot resolve location of table {}",
                    key.qualified_name()
                ))
            })?;
        let info = self.metadata.get_format_info(&key.database, &key.table).await;
        let format = task
            .spec
            .target_format
            .unwrap_or_else(|| infer_storage_format(&info));
        let compression = task
            .spec
            .target_compression
            .clone()
            .unwrap_or_else(|| infer_compression(&info, format));
        Ok(TableAnalysis {
            location,
            format,
            compression,
        })
    }

    /// Table location, or the resolved partition directory.
    async fn resolve_target(&self, task: &MergeTask, location: &str) -> Result<String> {
        let key = task.key();
        let Some(filter) = task.spec.partition_filter.as_deref() else {
            // A flat rewrite swapped over the table root would drop every
            // partition directory.
            if self.metadata.is_partitioned(&key.database, &key.table).await {
                return Err(CompactionError::Configuration(format!(
                    "partition filter required: table {} is partitioned",
                    key.qualified_name()
                )));
            }
            return Ok(location.to_owned());
        };
        let resolved = self
            .resolver
            .resolve_partition_path(&key.database, &key.table, filter)
            .await
            .ok_or_else(|| {
                CompactionError::Configuration(format!(
                    "cannot resolve partition path of {} for filter {}",
                    key.qualified_name(),
                    filter
                ))
            })?;
        if !resolved.verified()
            && self.config.verify_partition_path
            && !self.fs.exists(&resolved.path).await?
        {
            return Err(CompactionError::Configuration(format!(
                "partition path {} for filter {} does not exist",
                resolved.path, filter
            )));
        }
        Ok(resolved.path)
    }

    /// Hidden sibling paths of `target_path`. No I/O.
    pub fn plan_shadow(&self, target_path: &str, ts: i64) -> Result<ShadowWriteContext> {
        let (parent, name) = parent_and_name(target_path).ok_or_else(|| {
            CompactionError::Configuration(format!(
                "target path {} has no parent directory",
                target_path
            ))
        })?;
        Ok(ShadowWriteContext {
            shadow_path: join_path(
                parent,
                &format!("{}{}_{}", self.config.shadow_prefix, name, ts),
            ),
            backup_path: join_path(
                parent,
                &format!("{}{}_{}", self.config.backup_prefix, name, ts),
            ),
            target_path: target_path.to_owned(),
        })
    }

    /// Shadow must exist, be a directory and hold at least one data file.
    async fn verify_shadow(&self, ctx: &ShadowWriteContext) -> Result<FileStats> {
        let status = self.fs.get_status(&ctx.shadow_path).await?.ok_or_else(|| {
            CompactionError::ShadowWrite(format!("shadow {} was not created", ctx.shadow_path))
        })?;
        if !status.is_directory {
            return Err(CompactionError::ShadowWrite(format!(
                "shadow {} is not a directory",
                ctx.shadow_path
            )));
        }
        if self.fs.list_directory(&ctx.shadow_path).await?.is_empty() {
            return Err(CompactionError::ShadowWrite(format!(
                "shadow {} is empty",
                ctx.shadow_path
            )));
        }
        let stats = self.counter.count(&ctx.shadow_path).await?;
        if stats.file_count == 0 {
            return Err(CompactionError::ShadowWrite(format!(
                "shadow {} holds no data files",
                ctx.shadow_path
            )));
        }
        Ok(stats)
    }

    /// target -> backup, then shadow -> target. A failed second move is
    /// compensated by moving the backup back.
    async fn atomic_swap(
        &self,
        task: &MergeTask,
        ctx: &ShadowWriteContext,
        recorder: &MergeMetricsRecorder,
    ) -> Result<()> {
        self.log(
            task,
            MergePhase::AtomicSwap,
            LogLevel::Info,
            &format!("moving {} to {}", ctx.target_path, ctx.backup_path),
        )
        .await;
        if let Err(e) = self.fs.move_path(&ctx.target_path, &ctx.backup_path).await {
            self.rollback(task, ctx).await;
            return Err(CompactionError::AtomicSwap(format!(
                "failed to move {} to backup {}: {}; nothing was moved",
                ctx.target_path, ctx.backup_path, e
            )));
        }

        self.log(
            task,
            MergePhase::AtomicSwap,
            LogLevel::Info,
            &format!("moving {} to {}", ctx.shadow_path, ctx.target_path),
        )
        .await;
        let Err(swap_err) = self.fs.move_path(&ctx.shadow_path, &ctx.target_path).await else {
            return Ok(());
        };

        warn!(task_id = %task.id(), error = %swap_err, "shadow move failed, restoring backup");
        match self.fs.move_path(&ctx.backup_path, &ctx.target_path).await {
            Ok(()) => {
                recorder.record_swap_restored();
                self.log(
                    task,
                    MergePhase::AtomicSwap,
                    LogLevel::Warn,
                    &format!("restored {} from {}", ctx.target_path, ctx.backup_path),
                )
                .await;
                self.rollback(task, ctx).await;
                Err(CompactionError::AtomicSwap(format!(
                    "failed to move shadow {} to {}: {}; original data restored",
                    ctx.shadow_path, ctx.target_path, swap_err
                )))
            }
            Err(restore_err) => {
                recorder.record_swap_unresolved();
                error!(
                    task_id = %task.id(),
                    target = %ctx.target_path,
                    backup = %ctx.backup_path,
                    shadow = %ctx.shadow_path,
                    "swap failed and backup could not be restored"
                );
                // The shadow is kept: it may be the only complete copy besides the backup.
                Err(CompactionError::AtomicSwap(format!(
                    "table may be inconsistent: {} is missing, original data is in {} \
                     and the rewritten data in {}; manual intervention required \
                     (swap error: {}; restore error: {})",
                    ctx.target_path, ctx.backup_path, ctx.shadow_path, swap_err, restore_err
                )))
            }
        }
    }

    /// Best-effort delete of the shadow directory.
    async fn rollback(&self, task: &MergeTask, ctx: &ShadowWriteContext) {
        match self.fs.delete(&ctx.shadow_path, true).await {
            Ok(()) => {
                self.log(
                    task,
                    MergePhase::RolledBack,
                    LogLevel::Info,
                    &format!("removed shadow {}", ctx.shadow_path),
                )
                .await
            }
            Err(e) => {
                self.log(
                    task,
                    MergePhase::RolledBack,
                    LogLevel::Warn,
                    &format!("failed to remove shadow {}: {}", ctx.shadow_path, e),
                )
                .await
            }
        }
    }

    async fn shadow_swap(
        &self,
        task: &MergeTask,
        analysis: TableAnalysis,
        recorder: &MergeMetricsRecorder,
    ) -> Result<MergeOutcome> {
        let key = task.key();
        let target_path = self.resolve_target(task, &analysis.location).await?;
        let ctx = self.plan_shadow(&target_path, Utc::now().timestamp_millis())?;
        self.log(
            task,
            MergePhase::PlanningShadow,
            LogLevel::Info,
            &format!(
                "target {} shadow {} backup {}",
                ctx.target_path, ctx.shadow_path, ctx.backup_path
            ),
        )
        .await;

        let files_before = self.counter.count(&ctx.target_path).await?;

        // Partition directories encode partition values in their path.
        let columns = match task.spec.partition_filter {
            Some(_) => {
                self.metadata
                    .get_columns(&key.database, &key.table)
                    .await
                    .columns
            }
            None => vec![],
        };
        let builder = RewriteStatementBuilder::new(
            &key.database,
            &key.table,
            analysis.format,
            &analysis.compression,
        )
        .with_columns(&columns)
        .with_partition_filter(task.spec.partition_filter.as_deref())
        .with_force_single_file(task.spec.force_single_file());
        let settings = builder.build_session_settings()?;
        let statement = builder.build_rewrite_sql(&ctx.shadow_path);

        for setting in settings.iter().chain(std::iter::once(&statement)) {
            self.log(task, MergePhase::WritingShadow, LogLevel::Info, setting)
                .await;
            if let Err(e) = self.metadata.engine().execute(&key.database, setting).await {
                self.rollback(task, &ctx).await;
                return Err(CompactionError::ShadowWrite(format!(
                    "rewrite into {} failed: {}",
                    ctx.shadow_path, e
                )));
            }
        }

        self.log(task, MergePhase::ValidatingShadow, LogLevel::Info, "checking shadow output")
            .await;
        let files_after = match self.verify_shadow(&ctx).await {
            Ok(stats) => stats,
            Err(e) => {
                self.rollback(task, &ctx).await;
                return Err(match e {
                    CompactionError::ShadowWrite(_) => e,
                    other => CompactionError::ShadowWrite(other.to_string()),
                });
            }
        };

        self.atomic_swap(task, &ctx, recorder).await?;

        Ok(MergeOutcome {
            shadow_path: Some(ctx.shadow_path),
            backup_path: Some(ctx.backup_path),
            target_path: ctx.target_path,
            statement_executed: statement,
            files_before,
            files_after,
        })
    }

    async fn concatenate(&self, task: &MergeTask, analysis: TableAnalysis) -> Result<MergeOutcome> {
        let key = task.key();
        let target_path = self.resolve_target(task, &analysis.location).await?;
        let clause = match task.spec.partition_filter.as_deref() {
            Some(filter) => Some(filter_to_partition_spec_clause(filter).ok_or_else(|| {
                CompactionError::Configuration(format!(
                    "filter {} cannot be expressed as a partition spec",
                    filter
                ))
            })?),
            None => None,
        };
        let files_before = self.counter.count(&target_path).await?;
        let statement = RewriteStatementBuilder::new(
            &key.database,
            &key.table,
            analysis.format,
            &analysis.compression,
        )
        .build_concatenate_sql(clause.as_deref());

        self.log(task, MergePhase::WritingShadow, LogLevel::Info, &statement)
            .await;
        self.metadata
            .engine()
            .execute(&key.database, &statement)
            .await
            .map_err(|e| CompactionError::Execution(format!("concatenate failed: {}", e)))?;
        let files_after = self.counter.count(&target_path).await?;

        Ok(MergeOutcome {
            shadow_path: None,
            backup_path: None,
            target_path,
            statement_executed: statement,
            files_before,
            files_after,
        })
    }

    async fn execute_inner(
        &self,
        task: &MergeTask,
        recorder: &MergeMetricsRecorder,
    ) -> Result<MergeOutcome> {
        self.validate(task).await?;
        let analysis = self.analyze(task).await?;
        match task.spec.strategy {
            MergeStrategy::ShadowSwap => self.shadow_swap(task, analysis, recorder).await,
            MergeStrategy::Concatenate => self.concatenate(task, analysis).await,
        }
    }
}

#[async_trait]
impl MergeExecutor for MergeTaskExecutor {
    async fn execute(&self, task: &MergeTask) -> Result<MergeOutcome> {
        let start = Instant::now();
        let recorder = MergeMetricsRecorder::new(self.metrics.clone(), task.key());
        info!(
            task_id = %task.id(),
            table = %task.key(),
            filter = ?task.spec.partition_filter,
            "merge started"
        );

        let result = self.execute_inner(task, &recorder).await;
        recorder.record_duration(start.elapsed().as_secs_f64());
        match result {
            Ok(outcome) => {
                self.log(
                    task,
                    MergePhase::Completed,
                    LogLevel::Info,
                    &format!(
                        "files {} -> {}, target {}",
                        outcome.files_before.file_count,
                        outcome.files_after.file_count,
                        outcome.target_path
                    ),
                )
                .await;
                recorder.record_success(outcome.files_before, outcome.files_after);
                Ok(outcome)
            }
            Err(e) => {
                recorder.record_failure();
                Err(self.fail(task, e).await)
            }
        }
    }
}
