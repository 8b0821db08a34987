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

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::*;

/// Executor that never touches storage. Succeeds with an empty outcome, or
/// fails with the configured message.
#[derive(Default)]
pub struct MockMergeExecutor {
    failure: Option<String>,
    calls: AtomicUsize,
}

impl MockMergeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MergeExecutor for MockMergeExecutor {
    async fn execute(&self, task: &MergeTask) -> Result<MergeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(CompactionError::Execution(message.clone()));
        }
        Ok(MergeOutcome {
            shadow_path: None,
            backup_path: None,
            target_path: task.key().qualified_name(),
            statement_executed: String::new(),
            files_before: FileStats::default(),
            files_after: FileStats::default(),
        })
    }
}
