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

use std::borrow::Cow;
use std::sync::Arc;

use mixtrics::metrics::{BoxedCounterVec, BoxedHistogramVec, BoxedRegistry, Buckets};

use crate::file_counter::FileStats;
use crate::model::TableKey;

pub struct Metrics {
    // outcome metrics
    pub merge_success_counter: BoxedCounterVec,
    pub merge_failed_counter: BoxedCounterVec,
    pub merge_duration: BoxedHistogramVec,
    pub lock_conflict_counter: BoxedCounterVec,

    // swap metrics
    pub swap_restored_counter: BoxedCounterVec,
    pub swap_unresolved_counter: BoxedCounterVec,

    // input/output metrics
    pub merge_files_before: BoxedCounterVec,
    pub merge_files_after: BoxedCounterVec,
    pub merge_bytes_saved: BoxedCounterVec,
}

impl Metrics {
    pub fn new(registry: BoxedRegistry) -> Self {
        let labels: &'static [&'static str] = &["cluster", "table_ident"];

        let merge_success_counter = registry.register_counter_vec(
            "hive_compaction_merge_success_counter".into(),
            "hive-compaction successful merge attempts".into(),
            labels,
        );

        let merge_failed_counter = registry.register_counter_vec(
            "hive_compaction_merge_failed_counter".into(),
            "hive-compaction failed merge attempts".into(),
            labels,
        );

        let merge_duration = registry.register_histogram_vec_with_buckets(
            "hive_compaction_merge_duration".into(),
            "hive-compaction merge duration in seconds".into(),
            labels,
            Buckets::exponential(
                1.0, 2.0, 16, // Start at 1s, double each bucket, up to 16 buckets
            ),
        );

        let lock_conflict_counter = registry.register_counter_vec(
            "hive_compaction_lock_conflict_counter".into(),
            "hive-compaction table lock conflicts".into(),
            labels,
        );

        let swap_restored_counter = registry.register_counter_vec(
            "hive_compaction_swap_restored_counter".into(),
            "hive-compaction failed swaps restored from backup".into(),
            labels,
        );

        let swap_unresolved_counter = registry.register_counter_vec(
            "hive_compaction_swap_unresolved_counter".into(),
            "hive-compaction failed swaps needing manual intervention".into(),
            labels,
        );

        let merge_files_before = registry.register_counter_vec(
            "hive_compaction_merge_files_before".into(),
            "hive-compaction files in merged targets before rewrite".into(),
            labels,
        );

        let merge_files_after = registry.register_counter_vec(
            "hive_compaction_merge_files_after".into(),
            "hive-compaction files in merged targets after rewrite".into(),
            labels,
        );

        let merge_bytes_saved = registry.register_counter_vec(
            "hive_compaction_merge_bytes_saved".into(),
            "hive-compaction bytes saved by rewrites".into(),
            labels,
        );

        Self {
            merge_success_counter,
            merge_failed_counter,
            merge_duration,
            lock_conflict_counter,
            swap_restored_counter,
            swap_unresolved_counter,
            merge_files_before,
            merge_files_after,
            merge_bytes_saved,
        }
    }
}

/// Records metrics for one table.
#[derive(Clone)]
pub struct MergeMetricsRecorder {
    metrics: Arc<Metrics>,
    cluster: String,
    table_ident: String,
}

impl MergeMetricsRecorder {
    pub fn new(metrics: Arc<Metrics>, key: &TableKey) -> Self {
        Self {
            metrics,
            cluster: key.cluster.clone(),
            table_ident: key.qualified_name(),
        }
    }

    fn label_vec(&self) -> [Cow<'static, str>; 2] {
        [self.cluster.clone().into(), self.table_ident.clone().into()]
    }

    pub fn record_duration(&self, duration_secs: f64) {
        self.metrics
            .merge_duration
            .histogram(&self.label_vec())
            .record(duration_secs);
    }

    pub fn record_success(&self, before: FileStats, after: FileStats) {
        let label_vec = self.label_vec();
        self.metrics
            .merge_success_counter
            .counter(&label_vec)
            .increase(1);
        self.metrics
            .merge_files_before
            .counter(&label_vec)
            .increase(before.file_count);
        self.metrics
            .merge_files_after
            .counter(&label_vec)
            .increase(after.file_count);
        self.metrics
            .merge_bytes_saved
            .counter(&label_vec)
            .increase(before.total_bytes.saturating_sub(after.total_bytes));
    }

    pub fn record_failure(&self) {
        self.metrics
            .merge_failed_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_lock_conflict(&self) {
        self.metrics
            .lock_conflict_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_swap_restored(&self) {
        self.metrics
            .swap_restored_counter
            .counter(&self.label_vec())
            .increase(1);
    }

    pub fn record_swap_unresolved(&self) {
        self.metrics
            .swap_unresolved_counter
            .counter(&self.label_vec())
            .increase(1);
    }
}
