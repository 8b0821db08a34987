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


use std::time::Duration;

use chrono::Utc;
use hive_compaction_core::config::LockRetryConfig;
use hive_compaction_core::lock::LOCK_EXPIRED_MESSAGE;
use hive_compaction_core::model::LockState;
use hive_compaction_core::test_utils::{ScriptedQueryEngine, describe_rows};
use hive_compaction_core::validation::ValidationService;
use hive_compaction_core::{
    CompactionError, MergeConfig, StorageFormat, TableKey, TaskStatus, TaskStore,
};

use crate::test_utils::Harness;

fn warehouse_tables(root: &str) -> ScriptedQueryEngine {
    ScriptedQueryEngine::new()
        .with_output_files(2, 4096)
        .with_table(
            "sales",
            "orders",
            describe_rows(
                &["id", "amount"],
                &[],
                &format!("{}/sales.db/orders", root),
                StorageFormat::TextFile,
                &[],
            ),
            vec![],
        )
        .with_table(
            "sales",
            "events",
            describe_rows(
                &["id", "kind"],
                &["dt"],
                &format!("{}/sales.db/events", root),
                StorageFormat::Orc,
                &[("orc.compress", "ZSTD")],
            ),
            vec![
                "dt=2024-01-01".to_owned(),
                "dt=2024-01-02".to_owned(),
                "dt=2024-01-03".to_owned(),
            ],
        )
        .with_table(
            "sales",
            "ledger",
            describe_rows(
                &["id"],
                &[],
                &format!("{}/sales.db/ledger", root),
                StorageFormat::Orc,
                &[("transactional", "true")],
            ),
            vec![],
        )
}

fn no_retry() -> MergeConfig {
    MergeConfig::builder()
        .lock_retry(LockRetryConfig {
            max_retries: 0,
            ..Default::default()
        })
        .build()
        .unwrap()
}

fn orders() -> TableKey {
    TableKey::new("c1", "sales", "orders")
}

#[tokio::test]
async fn test_merge_unpartitioned_text_table() {
    let h = Harness::new(no_retry(), warehouse_tables).await.unwrap();
    h.seed("sales.db/orders", 500, 128).await.unwrap();

    let task = h
        .runner
        .submit(h.runner.new_spec(orders()))
        .await
        .unwrap()
        .remove(0);
    let validation = ValidationService::new(h.metadata.clone())
        .validate(&task)
        .await;
    assert!(validation.valid, "{}", validation.message);
    assert!(validation.warnings.is_empty());

    let outcome = h.runner.run(task.id()).await.unwrap();

    let shadow = outcome.shadow_path.clone().unwrap();
    let backup = outcome.backup_path.clone().unwrap();
    assert!(shadow.starts_with(&h.path("sales.db/.shadow_orders_")));
    assert!(backup.starts_with(&h.path("sales.db/.backup_orders_")));
    assert_eq!(
        shadow.trim_start_matches(&h.path("sales.db/.shadow_orders_")),
        backup.trim_start_matches(&h.path("sales.db/.backup_orders_"))
    );
    assert_eq!(outcome.target_path, h.path("sales.db/orders"));

    assert_eq!(h.count("sales.db/orders").await.unwrap().file_count, 2);
    let backup_name = backup.rsplit('/').next().unwrap();
    assert_eq!(
        h.count(&format!("sales.db/{}", backup_name))
            .await
            .unwrap()
            .file_count,
        500
    );
    assert!(
        !h.entries("sales.db")
            .await
            .unwrap()
            .iter()
            .any(|e| e.starts_with(".shadow_"))
    );

    let stored = h.store.get_required(task.id()).await.unwrap();
    assert_eq!(stored.status(), TaskStatus::Success);
    assert_eq!(stored.progress.files_before, Some(500));
    assert_eq!(stored.progress.files_after, Some(2));
    assert_eq!(stored.progress.bytes_saved, Some(500 * 128 - 2 * 4096));
    assert_eq!(stored.lock, LockState::released());
    tracing::info!(statement = %outcome.statement_executed, "merged orders");
}

#[tokio::test]
async fn test_transactional_table_is_refused() {
    let h = Harness::new(no_retry(), warehouse_tables).await.unwrap();
    h.seed("sales.db/ledger", 10, 16).await.unwrap();

    let task = h
        .runner
        .submit(h.runner.new_spec(TableKey::new("c1", "sales", "ledger")))
        .await
        .unwrap()
        .remove(0);
    let validation = ValidationService::new(h.metadata.clone())
        .validate(&task)
        .await;
    assert!(!validation.valid);
    assert!(validation.message.contains("transactional"));

    let err = h.runner.run(task.id()).await.unwrap_err();
    assert!(matches!(err, CompactionError::UnsupportedTable(_)), "{}", err);

    let stored = h.store.get_required(task.id()).await.unwrap();
    assert_eq!(stored.status(), TaskStatus::Failed);
    assert!(
        stored
            .progress
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("transactional")
    );
    assert!(!stored.lock.acquired);
    assert!(
        !h.engine
            .statements()
            .await
            .iter()
            .any(|s| s.starts_with("INSERT OVERWRITE"))
    );
    assert_eq!(h.count("sales.db/ledger").await.unwrap().file_count, 10);
    assert_eq!(h.entries("sales.db").await.unwrap(), vec!["ledger".to_owned()]);
}

#[tokio::test]
async fn test_concurrent_attempts_serialize_on_table_lock() {
    let h = Harness::new(no_retry(), warehouse_tables).await.unwrap();
    let first = h.runner.submit(h.runner.new_spec(orders())).await.unwrap().remove(0);
    let second = h.runner.submit(h.runner.new_spec(orders())).await.unwrap().remove(0);
    let locks = h.runner.lock_manager();

    assert!(locks.acquire(first.id()).await.granted);
    let refused = locks.acquire(second.id()).await;
    assert!(!refused.granted);
    assert_eq!(refused.holder, Some(first.id().to_string()));

    // The runner reports the same conflict without touching the task.
    match h.runner.run(second.id()).await {
        Err(CompactionError::LockConflict { holder }) => assert_eq!(holder, first.id().to_string()),
        other => panic!("expected lock conflict, got {:?}", other.map(|o| o.target_path)),
    }
    assert_eq!(
        h.store.get_required(second.id()).await.unwrap().status(),
        TaskStatus::Pending
    );

    assert!(locks.release(first.id()).await.granted);
    assert!(locks.acquire(second.id()).await.granted);
    assert!(locks.release(second.id()).await.granted);
}

#[tokio::test]
async fn test_or_filter_merges_each_partition() {
    let config = MergeConfig::builder()
        .lock_retry(LockRetryConfig {
            max_retries: 20,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        })
        .build()
        .unwrap();
    let h = Harness::new(config, warehouse_tables).await.unwrap();
    for dt in ["2024-01-01", "2024-01-02", "2024-01-03"] {
        h.seed(&format!("sales.db/events/dt={}", dt), 20, 64)
            .await
            .unwrap();
    }

    let spec = h
        .runner
        .new_spec(TableKey::new("c1", "sales", "events"))
        .with_partition_filter("dt='2024-01-01' OR dt='2024-01-02'");
    let tasks = h.runner.submit(spec).await.unwrap();
    assert_eq!(tasks.len(), 2);

    let ids: Vec<_> = tasks.iter().map(|t| t.id()).collect();
    let results = h.runner.run_all(&ids).await;
    for result in &results {
        let outcome = result.as_ref().unwrap();
        assert!(outcome.statement_executed.contains("USING orc OPTIONS ('compression' = 'zstd')"));
        assert!(outcome.statement_executed.contains("`id`, `kind`"));
    }

    assert_eq!(h.count("sales.db/events/dt=2024-01-01").await.unwrap().file_count, 2);
    assert_eq!(h.count("sales.db/events/dt=2024-01-02").await.unwrap().file_count, 2);
    assert_eq!(h.count("sales.db/events/dt=2024-01-03").await.unwrap().file_count, 20);
    for id in ids {
        assert_eq!(
            h.store.get_required(id).await.unwrap().status(),
            TaskStatus::Success
        );
    }
    assert!(h.store.locked_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sweep_reclaims_dead_holder() {
    let h = Harness::new(no_retry(), warehouse_tables).await.unwrap();
    let stale = h
        .runner
        .submit(
            h.runner
                .new_spec(orders())
                .with_created_at(Utc::now() - chrono::Duration::hours(3)),
        )
        .await
        .unwrap()
        .remove(0);
    let mut progress = stale.progress.clone();
    progress.transition(TaskStatus::Running).unwrap();
    progress.started_at = Some(Utc::now() - chrono::Duration::hours(3));
    h.store.update_progress(stale.id(), &progress).await.unwrap();
    h.store
        .update_lock(stale.id(), &LockState::held_by(stale.holder_id()))
        .await
        .unwrap();

    assert_eq!(h.runner.sweep_expired().await, 1);

    let stored = h.store.get_required(stale.id()).await.unwrap();
    assert_eq!(stored.status(), TaskStatus::Failed);
    assert_eq!(stored.progress.error_message.as_deref(), Some(LOCK_EXPIRED_MESSAGE));
    assert!(!stored.lock.acquired);

    let next = h.runner.submit(h.runner.new_spec(orders())).await.unwrap().remove(0);
    assert!(h.runner.lock_manager().acquire(next.id()).await.granted);
}
