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

//! Pre-flight checks run before anything destructive happens.

use std::sync::Arc;

use tracing::{info, warn};

use crate::metadata::{MetadataManager, infer_storage_format, unsupported_reason};
use crate::model::{MergeStrategy, MergeTask, StorageFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: String,
    /// Never block execution.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.into(),
            warnings: vec![],
        }
    }
}

/// Failure category of an invalid result, used to pick the error variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    Connectivity,
    MissingTable,
    Unsupported,
}

pub struct ValidationService {
    metadata: Arc<MetadataManager>,
}

impl ValidationService {
    pub fn new(metadata: Arc<MetadataManager>) -> Self {
        Self { metadata }
    }

    pub async fn validate(&self, task: &MergeTask) -> ValidationResult {
        self.validate_detailed(task).await.0
    }

    /// Like [`validate`](Self::validate), also naming the failed check.
    /// Stops at the first hard failure.
    pub async fn validate_detailed(
        &self,
        task: &MergeTask,
    ) -> (ValidationResult, Option<ValidationFailure>) {
        let key = task.key();
        let (database, table) = (key.database.as_str(), key.table.as_str());

        if let Err(e) = self.metadata.engine().ping().await {
            return (
                ValidationResult::invalid(format!("query engine unreachable: {}", e)),
                Some(ValidationFailure::Connectivity),
            );
        }

        if !self.metadata.table_exists(database, table).await {
            return (
                ValidationResult::invalid(format!("table {} does not exist", key.qualified_name())),
                Some(ValidationFailure::MissingTable),
            );
        }

        let info = self.metadata.get_format_info(database, table).await;
        if info.is_empty() {
            return (
                ValidationResult::invalid(format!(
                    "table {} metadata unavailable; cannot confirm it is safe to compact",
                    key.qualified_name()
                )),
                Some(ValidationFailure::Unsupported),
            );
        }
        if let Some(reason) = unsupported_reason(&info) {
            return (
                ValidationResult::invalid(format!(
                    "table {} is not supported: {}",
                    key.qualified_name(),
                    reason
                )),
                Some(ValidationFailure::Unsupported),
            );
        }

        let format = infer_storage_format(&info);
        if task.spec.strategy == MergeStrategy::Concatenate
            && !matches!(format, StorageFormat::Orc | StorageFormat::RcFile)
        {
            return (
                ValidationResult::invalid(format!(
                    "incompatible strategy: {} requires ORC or RCFILE, table {} is {}",
                    task.spec.strategy.as_str(),
                    key.qualified_name(),
                    format
                )),
                Some(ValidationFailure::Unsupported),
            );
        }

        let mut warnings = vec![];
        let partitioned = self.metadata.is_partitioned(database, table).await;
        match task.spec.partition_filter.as_deref() {
            None if partitioned => warnings.push(format!(
                "table {} is partitioned but no partition filter was given; \
                 the merge needs one per partition",
                key.qualified_name()
            )),
            Some(filter) => {
                let partitions = self.metadata.list_partitions(database, table).await;
                let needle = crate::partition::normalize_filter_to_path(filter);
                let found = partitions
                    .iter()
                    .any(|p| p.contains(&needle) || needle.contains(p.as_str()));
                if !found {
                    warnings.push(format!(
                        "partition filter '{}' matches no listed partition of {}",
                        filter,
                        key.qualified_name()
                    ));
                }
            }
            None => {}
        }

        for warning in &warnings {
            warn!(task_id = %task.id(), "{}", warning);
        }
        info!(task_id = %task.id(), table = %key, "validation passed");
        (
            ValidationResult {
                valid: true,
                message: "validation passed".to_owned(),
                warnings,
            },
            None,
        )
    }
}
