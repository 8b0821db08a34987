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

use itertools::Itertools;

use crate::engine::{qualified_table, quote_ident};
use crate::model::StorageFormat;
use crate::{CompactionError, Result};

/// Hadoop codec class for a codec name. Names containing a `.` are taken as
/// class names already.
fn hadoop_codec_class(codec: &str) -> Option<String> {
    if codec.contains('.') {
        return Some(codec.to_owned());
    }
    let class = match codec.to_ascii_uppercase().as_str() {
        "GZIP" | "GZ" => "GzipCodec",
        "BZIP2" => "BZip2Codec",
        "SNAPPY" => "SnappyCodec",
        "LZ4" => "Lz4Codec",
        "DEFAULT" | "DEFLATE" | "ZLIB" => "DefaultCodec",
        "ZSTD" | "ZSTANDARD" => "ZStandardCodec",
        _ => return None,
    };
    Some(format!("org.apache.hadoop.io.compress.{}", class))
}

/// Builds the statements the executor hands to the query engine.
pub struct RewriteStatementBuilder<'a> {
    database: &'a str,
    table: &'a str,
    /// Projected columns. Empty selects `*`.
    columns: &'a [String],
    partition_filter: Option<&'a str>,
    format: StorageFormat,
    compression: &'a str,
    force_single_file: bool,
}

impl<'a> RewriteStatementBuilder<'a> {
    pub fn new(
        database: &'a str,
        table: &'a str,
        format: StorageFormat,
        compression: &'a str,
    ) -> Self {
        Self {
            database,
            table,
            columns: &[],
            partition_filter: None,
            format,
            compression,
            force_single_file: false,
        }
    }

    pub fn with_columns(mut self, columns: &'a [String]) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_partition_filter(mut self, filter: Option<&'a str>) -> Self {
        self.partition_filter = filter;
        self
    }

    pub fn with_force_single_file(mut self, force_single_file: bool) -> Self {
        self.force_single_file = force_single_file;
        self
    }

    /// Rewrites the matching rows into `directory`.
    ///
    /// Columnar formats use the datasource form so the codec can be set per
    /// statement; row formats use the Hive form and take the codec from the
    /// statements of [`Self::build_session_settings`].
    pub fn build_rewrite_sql(&self, directory: &str) -> String {
        let mut sql = format!(
            "INSERT OVERWRITE DIRECTORY '{}'",
            directory.replace('\'', "\\'")
        );

        match self.format {
            StorageFormat::Parquet | StorageFormat::Orc | StorageFormat::Avro => {
                sql.push_str(&format!(" USING {}", self.format.as_str().to_ascii_lowercase()));
                if !self.compression.is_empty()
                    && !self.compression.eq_ignore_ascii_case("DEFAULT")
                {
                    sql.push_str(&format!(
                        " OPTIONS ('compression' = '{}')",
                        self.compression.to_ascii_lowercase()
                    ));
                }
            }
            StorageFormat::TextFile | StorageFormat::RcFile => {
                sql.push_str(&format!(" STORED AS {}", self.format.as_str()));
            }
        }

        sql.push_str(" SELECT ");
        if self.force_single_file {
            sql.push_str("/*+ COALESCE(1) */ ");
        }
        if self.columns.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.columns.iter().map(|c| quote_ident(c)).join(", "));
        }
        sql.push_str(&format!(" FROM {}", qualified_table(self.database, self.table)));

        if let Some(filter) = self.partition_filter {
            sql.push_str(&format!(" WHERE {}", filter));
        }
        sql
    }

    /// `SET` statements issued before a row-format rewrite so the Hive writer
    /// compresses its output. Empty for columnar formats, and for RCFILE when
    /// the codec is `DEFAULT`.
    pub fn build_session_settings(&self) -> Result<Vec<String>> {
        let codec = self.compression.trim();
        match self.format {
            StorageFormat::Parquet | StorageFormat::Orc | StorageFormat::Avro => Ok(vec![]),
            StorageFormat::RcFile if codec.is_empty() || codec.eq_ignore_ascii_case("DEFAULT") => {
                Ok(vec![])
            }
            _ if codec.is_empty() || codec.eq_ignore_ascii_case("NONE") => {
                Ok(vec!["SET hive.exec.compress.output=false".to_owned()])
            }
            _ => {
                let class = hadoop_codec_class(codec).ok_or_else(|| {
                    CompactionError::Configuration(format!(
                        "compression {} cannot be applied to {} output",
                        codec,
                        self.format.as_str()
                    ))
                })?;
                Ok(vec![
                    "SET hive.exec.compress.output=true".to_owned(),
                    format!("SET mapreduce.output.fileoutputformat.compress.codec={}", class),
                ])
            }
        }
    }

    /// In-place `CONCATENATE`, optionally for one partition. `partition_clause`
    /// is the body of `PARTITION (...)`.
    pub fn build_concatenate_sql(&self, partition_clause: Option<&str>) -> String {
        match partition_clause {
            Some(clause) => format!(
                "ALTER TABLE {} PARTITION ({}) CONCATENATE",
                qualified_table(self.database, self.table),
                clause
            ),
            None => format!(
                "ALTER TABLE {} CONCATENATE",
                qualified_table(self.database, self.table)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_rewrite_sql_whole_text_table() {
        let builder =
            RewriteStatementBuilder::new("sales", "orders", StorageFormat::TextFile, "NONE");
        assert_eq!(
            builder.build_rewrite_sql("/wh/sales.db/.shadow_orders_1"),
            "INSERT OVERWRITE DIRECTORY '/wh/sales.db/.shadow_orders_1' STORED AS TEXTFILE \
             SELECT * FROM `sales`.`orders`"
        );
    }

    #[test]
    fn test_build_rewrite_sql_partition_with_codec_and_single_file() {
        let columns = vec!["id".to_owned(), "amount".to_owned()];
        let builder =
            RewriteStatementBuilder::new("sales", "events", StorageFormat::Parquet, "SNAPPY")
                .with_columns(&columns)
                .with_partition_filter(Some("dt='2024-01-01'"))
                .with_force_single_file(true);
        let sql = builder.build_rewrite_sql("/wh/events/.shadow_dt=2024-01-01_1");
        assert_eq!(
            sql,
            "INSERT OVERWRITE DIRECTORY '/wh/events/.shadow_dt=2024-01-01_1' USING parquet \
             OPTIONS ('compression' = 'snappy') SELECT /*+ COALESCE(1) */ `id`, `amount` \
             FROM `sales`.`events` WHERE dt='2024-01-01'"
        );
    }

    #[test]
    fn test_build_rewrite_sql_default_codec_has_no_options() {
        let builder = RewriteStatementBuilder::new("db", "t", StorageFormat::Avro, "DEFAULT");
        let sql = builder.build_rewrite_sql("/x");
        assert!(sql.contains("USING avro SELECT"));
        assert!(!sql.contains("OPTIONS"));
    }

    #[test]
    fn test_session_settings_carry_row_format_codec() {
        let gzip = RewriteStatementBuilder::new("db", "t", StorageFormat::TextFile, "gzip");
        assert_eq!(
            gzip.build_session_settings().unwrap(),
            vec![
                "SET hive.exec.compress.output=true".to_owned(),
                "SET mapreduce.output.fileoutputformat.compress.codec=\
                 org.apache.hadoop.io.compress.GzipCodec"
                    .to_owned(),
            ]
        );

        let plain = RewriteStatementBuilder::new("db", "t", StorageFormat::TextFile, "NONE");
        assert_eq!(
            plain.build_session_settings().unwrap(),
            vec!["SET hive.exec.compress.output=false".to_owned()]
        );

        let rc = RewriteStatementBuilder::new("db", "t", StorageFormat::RcFile, "DEFAULT");
        assert!(rc.build_session_settings().unwrap().is_empty());
        let rc_class = RewriteStatementBuilder::new(
            "db",
            "t",
            StorageFormat::RcFile,
            "com.example.CustomCodec",
        );
        let settings = rc_class.build_session_settings().unwrap();
        assert!(settings[1].ends_with("=com.example.CustomCodec"));

        let orc = RewriteStatementBuilder::new("db", "t", StorageFormat::Orc, "ZSTD");
        assert!(orc.build_session_settings().unwrap().is_empty());
    }

    #[test]
    fn test_session_settings_reject_unknown_codec() {
        let builder = RewriteStatementBuilder::new("db", "t", StorageFormat::TextFile, "brotli");
        let err = builder.build_session_settings().unwrap_err();
        assert!(matches!(err, CompactionError::Configuration(_)));
        assert!(err.to_string().contains("brotli"));
    }

    #[test]
    fn test_build_concatenate_sql() {
        let builder = RewriteStatementBuilder::new("db", "t", StorageFormat::Orc, "ZLIB");
        assert_eq!(
            builder.build_concatenate_sql(Some("dt='1', h=2")),
            "ALTER TABLE `db`.`t` PARTITION (dt='1', h=2) CONCATENATE"
        );
        assert_eq!(
            builder.build_concatenate_sql(None),
            "ALTER TABLE `db`.`t` CONCATENATE"
        );
    }
}
