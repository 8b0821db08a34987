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

//! Table metadata lookups and compaction-compatibility classification.
//!
//! Everything here is read-only and uncached: DDL can change between two
//! calls and a stale answer could let an unsupported table through. Lookups
//! never fail; unavailable metadata comes back empty and callers decide.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{MetastoreClient, QueryEngine, Row, qualified_table};
use crate::model::{StorageFormat, TableFormatInfo};

pub mod rules;
pub use rules::{UNSUPPORTED_RULES, UnsupportedRule, is_unsupported_type, unsupported_reason};

const PARTITION_INFO_MARKER: &str = "# Partition Information";
const DETAILED_INFO_MARKERS: [&str; 3] = [
    "# Detailed Table Information",
    "Detailed Table Information",
    "# Storage Information",
];
const HEADER_TOKENS: [&str; 4] = ["# col_name", "col_name", "data_type", "comment"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableColumns {
    pub columns: Vec<String>,
    pub partition_columns: Vec<String>,
}

pub struct MetadataManager {
    engine: Arc<dyn QueryEngine>,
    metastore: Option<Arc<dyn MetastoreClient>>,
}

impl MetadataManager {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self {
            engine,
            metastore: None,
        }
    }

    pub fn with_metastore(mut self, metastore: Arc<dyn MetastoreClient>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    pub fn engine(&self) -> &Arc<dyn QueryEngine> {
        &self.engine
    }

    /// Catalog API first, then the `Location` line of `DESCRIBE FORMATTED`.
    pub async fn get_table_location(&self, database: &str, table: &str) -> Option<String> {
        if let Some(metastore) = &self.metastore {
            match metastore.table_location(database, table).await {
                Ok(Some(location)) if !location.trim().is_empty() => {
                    return Some(location.trim().to_owned());
                }
                Ok(_) => debug!(database, table, "metastore returned no location"),
                Err(e) => warn!(database, table, error = %e, "metastore location lookup failed"),
            }
        }

        let rows = self.describe(database, table).await?;
        rows.iter()
            .map(|row| split_row(row))
            .find(|(key, _, _)| key == "Location")
            .map(|(_, value, _)| value)
            .filter(|value| !value.is_empty())
    }

    pub async fn table_exists(&self, database: &str, table: &str) -> bool {
        let statement = format!("SHOW TABLES IN {} LIKE '{}'", database, table);
        match self.engine.execute(database, &statement).await {
            Ok(rows) => rows
                .iter()
                .any(|row| row.iter().any(|cell| cell.trim().eq_ignore_ascii_case(table))),
            Err(e) => {
                warn!(database, table, error = %e, "table existence check failed");
                false
            }
        }
    }

    pub async fn is_partitioned(&self, database: &str, table: &str) -> bool {
        !self
            .get_columns(database, table)
            .await
            .partition_columns
            .is_empty()
    }

    /// Partition directory names such as `dt=2024-01-01`. Empty for
    /// unpartitioned tables and on failure.
    pub async fn list_partitions(&self, database: &str, table: &str) -> Vec<String> {
        let statement = format!("SHOW PARTITIONS {}", qualified_table(database, table));
        match self.engine.execute(database, &statement).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .map(|cell| cell.trim().to_owned())
                .filter(|cell| !cell.is_empty())
                .collect(),
            Err(e) => {
                debug!(database, table, error = %e, "no partitions listed");
                vec![]
            }
        }
    }

    /// Storage description plus table properties. Any failure yields an
    /// empty [`TableFormatInfo`].
    pub async fn get_format_info(&self, database: &str, table: &str) -> TableFormatInfo {
        let Some(rows) = self.describe(database, table).await else {
            return TableFormatInfo::default();
        };
        let mut info = parse_format_info(&rows);

        let statement = format!("SHOW TBLPROPERTIES {}", qualified_table(database, table));
        match self.engine.execute(database, &statement).await {
            Ok(rows) => {
                for (key, value) in rows.iter().filter_map(|row| split_property(row)) {
                    info.properties.insert(key, value);
                }
            }
            Err(e) => {
                warn!(database, table, error = %e, "failed to read table properties");
                return TableFormatInfo::default();
            }
        }
        info
    }

    /// Regular and partition columns from `DESCRIBE FORMATTED`.
    pub async fn get_columns(&self, database: &str, table: &str) -> TableColumns {
        match self.describe(database, table).await {
            Some(rows) => parse_columns(&rows),
            None => TableColumns::default(),
        }
    }

    async fn describe(&self, database: &str, table: &str) -> Option<Vec<Row>> {
        let statement = format!("DESCRIBE FORMATTED {}", qualified_table(database, table));
        match self.engine.execute(database, &statement).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(database, table, error = %e, "describe failed");
                None
            }
        }
    }
}

fn clean_cell(cell: &str) -> String {
    let cell = cell.trim();
    if cell.eq_ignore_ascii_case("null") {
        String::new()
    } else {
        cell.to_owned()
    }
}

/// Splits a describe row into (key, value, extra). Single-cell rows are split
/// on the first `:`.
fn split_row(row: &Row) -> (String, String, String) {
    let cells: Vec<String> = row.iter().map(|c| clean_cell(c)).collect();
    match cells.as_slice() {
        [] => (String::new(), String::new(), String::new()),
        [only] => match only.split_once(':') {
            Some((key, value)) => (key.trim().to_owned(), value.trim().to_owned(), String::new()),
            None => (only.clone(), String::new(), String::new()),
        },
        [key, value, rest @ ..] => (
            key.trim_end_matches(':').trim().to_owned(),
            value.clone(),
            rest.first().cloned().unwrap_or_default(),
        ),
    }
}

fn split_property(row: &Row) -> Option<(String, String)> {
    let cells: Vec<String> = row.iter().map(|c| clean_cell(c)).collect();
    let (key, value) = match cells.as_slice() {
        [only] => {
            let (key, value) = only.split_once('\t').or_else(|| only.split_once('='))?;
            (key.trim().to_owned(), value.trim().to_owned())
        }
        [key, value, ..] => (key.clone(), value.clone()),
        [] => return None,
    };
    (!key.is_empty()).then_some((key, value))
}

fn parse_format_info(rows: &[Row]) -> TableFormatInfo {
    let mut info = TableFormatInfo::default();
    let mut in_parameters = false;
    for row in rows {
        let (key, value, extra) = split_row(row);

        // Parameter rows are indented: empty first cell, then key and value.
        if in_parameters {
            if key.is_empty() {
                if !value.is_empty() {
                    info.properties.insert(value, extra);
                }
                continue;
            }
            in_parameters = false;
        }

        if key.contains("InputFormat") {
            info.input_format = value;
        } else if key.contains("OutputFormat") {
            info.output_format = value;
        } else if key.contains("SerDe Library") {
            info.serde = value;
        } else if key.contains("Storage Handler") {
            info.storage_handler = value;
        } else if key.contains("Table Type") {
            info.table_type = value;
        } else if key.contains("Table Parameters") {
            in_parameters = true;
        }
    }
    info
}

fn parse_columns(rows: &[Row]) -> TableColumns {
    let mut columns = vec![];
    let mut partition_columns = vec![];
    let mut in_partition_section = false;

    for row in rows {
        let (name, _, _) = split_row(row);
        if name.starts_with(PARTITION_INFO_MARKER) {
            in_partition_section = true;
            continue;
        }
        if DETAILED_INFO_MARKERS.iter().any(|m| name.starts_with(m)) {
            break;
        }
        if name.is_empty() || HEADER_TOKENS.contains(&name.as_str()) || name.starts_with('#') {
            continue;
        }
        if in_partition_section {
            partition_columns.push(name);
        } else {
            columns.push(name);
        }
    }

    // Plain DESCRIBE repeats partition columns in the main list.
    columns.retain(|c| !partition_columns.contains(c));
    TableColumns {
        columns,
        partition_columns,
    }
}

/// First keyword hit in the input format, then in the serde class.
pub fn infer_storage_format(info: &TableFormatInfo) -> StorageFormat {
    const KEYWORDS: [(&str, StorageFormat); 4] = [
        ("parquet", StorageFormat::Parquet),
        ("orc", StorageFormat::Orc),
        ("avro", StorageFormat::Avro),
        ("rcfile", StorageFormat::RcFile),
    ];
    for source in [&info.input_format, &info.serde] {
        let source = source.to_ascii_lowercase();
        if let Some((_, format)) = KEYWORDS.iter().find(|(kw, _)| source.contains(kw)) {
            return *format;
        }
    }
    StorageFormat::TextFile
}

/// Codec name (upper case) the table currently writes with.
pub fn infer_compression(info: &TableFormatInfo, format: StorageFormat) -> String {
    let first_property = |keys: &[&str]| {
        keys.iter()
            .find_map(|key| info.property(key))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_ascii_uppercase)
    };

    match format {
        StorageFormat::Orc => first_property(&["orc.compress", "orc.default.compress"])
            .unwrap_or_else(|| "ZLIB".to_owned()),
        StorageFormat::Parquet => {
            first_property(&["parquet.compression"]).unwrap_or_else(|| "SNAPPY".to_owned())
        }
        StorageFormat::TextFile => first_property(&["compression", "fileoutputformat.compress"])
            .or_else(|| {
                first_property(&[
                    "mapreduce.output.fileoutputformat.compress.codec",
                    "mapred.output.compression.codec",
                ])
                .and_then(|codec| {
                    codec
                        .rsplit('.')
                        .next()
                        .map(|class| class.trim_end_matches("CODEC").to_owned())
                })
                .filter(|codec| !codec.is_empty())
            })
            .unwrap_or_else(|| "NONE".to_owned()),
        StorageFormat::Avro | StorageFormat::RcFile => "DEFAULT".to_owned(),
    }
}
