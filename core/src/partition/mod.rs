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

//! Partition filter handling and physical partition path resolution.
//!
//! Filters are equality-only clauses such as `dt='2024-01-01' AND hour='00'`.
//! Disjunctions are split into independent filters before a merge runs,
//! since one swap moves exactly one directory.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};

use crate::fs::{FileSystem, file_name, join_path};
use crate::metadata::MetadataManager;
use crate::model::PartitionSpec;

static SPEC_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(?:'([^']*)'|"([^"]*)")"#)
        .expect("partition pair pattern is valid")
});

/// Splits `s` on a whitespace-delimited keyword, case-insensitively, ignoring
/// occurrences inside quotes or parentheses.
fn split_keyword<'a>(s: &'a str, keyword: &str) -> Vec<&'a str> {
    let bytes = s.as_bytes();
    let kw = keyword.as_bytes();
    let mut parts = vec![];
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ if depth == 0
                    && b.is_ascii_whitespace()
                    && bytes.len() > i + kw.len() + 1
                    && bytes[i + 1..=i + kw.len()].eq_ignore_ascii_case(kw)
                    && bytes[i + kw.len() + 1].is_ascii_whitespace() =>
                {
                    parts.push(s[start..i].trim());
                    i += kw.len() + 1;
                    start = i;
                    continue;
                }
                _ => {}
            },
        }
        i += 1;
    }
    parts.push(s[start..].trim());
    parts
}

/// Removes one pair of parentheses enclosing the whole string.
fn strip_enclosing_parens(s: &str) -> &str {
    let trimmed = s.trim();
    if !(trimmed.starts_with('(') && trimmed.ends_with(')')) {
        return trimmed;
    }
    // The opening paren must close at the very end, not earlier.
    let mut depth = 0;
    for (idx, ch) in trimmed.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 && idx != trimmed.len() - 1 {
                    return trimmed;
                }
            }
            _ => {}
        }
    }
    trimmed[1..trimmed.len() - 1].trim()
}

fn is_quoted(value: &str) -> bool {
    value.len() >= 2
        && ((value.starts_with('\'') && value.ends_with('\''))
            || (value.starts_with('"') && value.ends_with('"')))
}

/// Turns `k1='v1' AND k2=v2` into the `PARTITION (...)` body
/// `k1='v1', k2='v2'`. Bare numbers stay unquoted. `None` if a clause has
/// no `=`.
pub fn filter_to_partition_spec_clause(filter: &str) -> Option<String> {
    let clauses = split_keyword(strip_enclosing_parens(filter), "and");
    let mut rendered = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let (key, value) = clause.split_once('=')?;
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            return None;
        }
        let value = if is_quoted(value) || value.parse::<f64>().is_ok() {
            value.to_owned()
        } else {
            format!("'{}'", value.replace('\'', "\\'"))
        };
        rendered.push(format!("{}={}", key, value));
    }
    Some(rendered.join(", "))
}

/// Splits a disjunction into independent filters. A filter without `OR`
/// comes back unchanged as a single element.
pub fn split_or_filter(filter: &str) -> Vec<String> {
    let trimmed = filter.trim();
    let parts = split_keyword(strip_enclosing_parens(trimmed), "or");
    if parts.len() < 2 {
        return vec![trimmed.to_owned()];
    }
    parts
        .into_iter()
        .map(|p| strip_enclosing_parens(p).to_owned())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Extracts quoted `key='value'` / `key="value"` pairs.
pub fn parse_spec(filter: &str) -> PartitionSpec {
    let mut spec = PartitionSpec::new();
    for caps in SPEC_PAIR.captures_iter(filter) {
        let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
        spec.insert(&caps[1], value);
    }
    spec
}

/// Path-shaped form of a filter: `AND` becomes `/`, quotes, spaces and
/// parentheses are dropped.
pub fn normalize_filter_to_path(filter: &str) -> String {
    split_keyword(strip_enclosing_parens(filter), "and")
        .into_iter()
        .map(|clause| {
            clause
                .chars()
                .filter(|c| !matches!(c, '\'' | '"' | ' ' | '(' | ')'))
                .collect::<String>()
        })
        .filter(|clause| !clause.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Rewrites every value to `temp_{cleaned}_{ts}` for collision-free staging
/// of dynamic-partition rewrites.
pub fn generate_temp_partition_spec(spec: &PartitionSpec, ts: i64) -> PartitionSpec {
    let mut temp = PartitionSpec::new();
    for (column, value) in spec.iter() {
        let cleaned: String = value
            .strip_prefix("partition_")
            .unwrap_or(value)
            .chars()
            .filter(|c| !matches!(c, '-' | ':'))
            .collect();
        temp.insert(column, format!("temp_{}_{}", cleaned, ts));
    }
    temp
}

/// Which heuristic produced a [`ResolvedPartitionPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    /// A child directory named `key=value`.
    Canonical,
    /// A child directory named after the bare value.
    BareValue,
    /// Location joined with the normalized filter. May not exist.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPartitionPath {
    pub path: String,
    pub tier: ResolutionTier,
}

impl ResolvedPartitionPath {
    /// Only the fallback tier can name a directory that is not there.
    pub fn verified(&self) -> bool {
        self.tier != ResolutionTier::Fallback
    }
}

pub struct PartitionPathResolver {
    metadata: Arc<MetadataManager>,
    fs: Arc<dyn FileSystem>,
}

impl PartitionPathResolver {
    pub fn new(metadata: Arc<MetadataManager>, fs: Arc<dyn FileSystem>) -> Self {
        Self { metadata, fs }
    }

    /// Maps a partition filter to the directory holding its files.
    ///
    /// Returns `None` only when the table location itself is unknown.
    pub async fn resolve_partition_path(
        &self,
        database: &str,
        table: &str,
        filter: &str,
    ) -> Option<ResolvedPartitionPath> {
        let Some(base) = self.metadata.get_table_location(database, table).await else {
            warn!(database, table, "cannot resolve partition path without table location");
            return None;
        };
        let spec = parse_spec(filter);

        if !spec.is_empty() {
            match self.fs.list_directory(&base).await {
                Ok(children) => {
                    let dirs: Vec<String> = children
                        .into_iter()
                        .filter(|c| c.is_directory)
                        .map(|c| c.path)
                        .collect();
                    let pairs: Vec<(&str, &str)> = spec.iter().collect();
                    let canonical: Vec<String> =
                        pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                    let bare: Vec<String> = pairs.iter().map(|(_, v)| (*v).to_owned()).collect();

                    if let Some(path) = self.descend(&base, &dirs, &canonical).await {
                        info!(database, table, filter, path, "resolved canonical partition path");
                        return Some(ResolvedPartitionPath {
                            path,
                            tier: ResolutionTier::Canonical,
                        });
                    }
                    if let Some(path) = self.descend(&base, &dirs, &bare).await {
                        info!(
                            database,
                            table,
                            filter,
                            path,
                            "resolved partition path by bare value"
                        );
                        return Some(ResolvedPartitionPath {
                            path,
                            tier: ResolutionTier::BareValue,
                        });
                    }
                }
                Err(e) => warn!(database, table, base, error = %e, "failed to list table location"),
            }
        }

        let path = join_path(&base, &normalize_filter_to_path(filter));
        warn!(database, table, filter, path, "falling back to unverified partition path");
        Some(ResolvedPartitionPath {
            path,
            tier: ResolutionTier::Fallback,
        })
    }

    /// Matches the first segment against the listed children of `base`, then
    /// checks that the remaining segments exist below it.
    async fn descend(&self, base: &str, dirs: &[String], segments: &[String]) -> Option<String> {
        let (first, rest) = segments.split_first()?;
        let mut path = dirs
            .iter()
            .find(|dir| file_name(dir) == first.as_str())
            .map(|dir| join_path(base, file_name(dir)))?;
        for segment in rest {
            path = join_path(&path, segment);
            match self.fs.get_status(&path).await {
                Ok(Some(status)) if status.is_directory => {}
                _ => return None,
            }
        }
        Some(path)
    }
}
