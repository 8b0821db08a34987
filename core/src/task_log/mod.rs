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

//! Phase-tagged task log entries for the external progress service.
//!
//! Logging is best effort: implementations swallow their own failures and
//! the signature leaves no way to abort a merge.

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::MergePhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[async_trait]
pub trait TaskLogger: Send + Sync + 'static {
    async fn log(&self, task_id: Uuid, phase: MergePhase, level: LogLevel, message: &str);
}

/// Forwards entries to `tracing`.
#[derive(Debug, Default, Clone)]
pub struct TracingTaskLogger;

#[async_trait]
impl TaskLogger for TracingTaskLogger {
    async fn log(&self, task_id: Uuid, phase: MergePhase, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(%task_id, %phase, "{}", message),
            LogLevel::Warn => tracing::warn!(%task_id, %phase, "{}", message),
            LogLevel::Error => tracing::error!(%task_id, %phase, "{}", message),
        }
    }
}
