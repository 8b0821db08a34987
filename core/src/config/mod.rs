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

use derive_builder::Builder;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_LEASE_MINUTES: i64 = 120;
pub const DEFAULT_TARGET_FILE_SIZE_BYTES: i64 = 256 * 1024 * 1024; // 256MB
pub const DEFAULT_SHADOW_PREFIX: &str = ".shadow_";
pub const DEFAULT_BACKUP_PREFIX: &str = ".backup_";

const ENV_PREFIX: &str = "HIVE_COMPACTION_";

/// Backoff applied by the runner while a table lock is held by someone else.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct LockRetryConfig {
    /// Zero disables retrying: a conflict is reported immediately.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for LockRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into), default)]
#[serde(default)]
pub struct MergeConfig {
    /// Lock lease. A holder older than this is considered dead.
    pub lease_minutes: i64,
    /// Used when a task does not carry its own target size.
    pub default_target_file_size_bytes: i64,
    pub shadow_prefix: String,
    pub backup_prefix: String,
    /// Fail the attempt when the resolved partition directory does not exist.
    pub verify_partition_path: bool,
    pub lock_retry: LockRetryConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            lease_minutes: DEFAULT_LEASE_MINUTES,
            default_target_file_size_bytes: DEFAULT_TARGET_FILE_SIZE_BYTES,
            shadow_prefix: DEFAULT_SHADOW_PREFIX.to_owned(),
            backup_prefix: DEFAULT_BACKUP_PREFIX.to_owned(),
            verify_partition_path: true,
            lock_retry: LockRetryConfig::default(),
        }
    }
}

impl MergeConfig {
    pub fn builder() -> MergeConfigBuilder {
        MergeConfigBuilder::default()
    }

    /// Layers defaults, an optional TOML document and `HIVE_COMPACTION_*`
    /// environment variables (nested keys separated by `__`).
    pub fn load(toml: Option<&str>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(MergeConfig::default()));
        if let Some(toml) = toml {
            figment = figment.merge(Toml::string(toml));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Box::new(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MergeConfig::default();
        assert_eq!(config.lease_minutes, 120);
        assert_eq!(config.shadow_prefix, ".shadow_");
        assert_eq!(config.backup_prefix, ".backup_");
        assert!(config.verify_partition_path);
        assert_eq!(config.lock_retry.max_retries, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let config = MergeConfig::builder()
            .lease_minutes(30)
            .verify_partition_path(false)
            .build()
            .unwrap();
        assert_eq!(config.lease_minutes, 30);
        assert!(!config.verify_partition_path);
        assert_eq!(config.default_target_file_size_bytes, DEFAULT_TARGET_FILE_SIZE_BYTES);
    }

    #[test]
    fn test_load_from_toml() {
        let config = MergeConfig::load(Some(
            r#"
            lease_minutes = 45
            backup_prefix = ".bak_"

            [lock_retry]
            max_retries = 0
            initial_delay = "2s"
            max_delay = "500ms"
            "#,
        ))
        .unwrap();
        assert_eq!(config.lease_minutes, 45);
        assert_eq!(config.backup_prefix, ".bak_");
        assert_eq!(config.shadow_prefix, ".shadow_");
        assert_eq!(config.lock_retry.max_retries, 0);
        assert_eq!(config.lock_retry.initial_delay, Duration::from_secs(2));
        assert_eq!(config.lock_retry.max_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_load_rejects_bad_types() {
        assert!(MergeConfig::load(Some("lease_minutes = \"soon\"")).is_err());
    }
}
