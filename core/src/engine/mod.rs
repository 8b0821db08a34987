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

//! Contracts of the query engine and metastore the merge engine talks to.
//!
//! The engine is opaque: the crate only hands it statement text and reads
//! back rows of strings.

use async_trait::async_trait;

use crate::Result;

/// One result row, one string per column.
pub type Row = Vec<String>;

#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    /// Runs `statement` with `database` as the current database.
    async fn execute(&self, database: &str, statement: &str) -> Result<Vec<Row>>;

    /// Connectivity check.
    async fn ping(&self) -> Result<()> {
        self.execute("default", "SELECT 1").await.map(|_| ())
    }
}

/// Direct catalog API. Optional: metadata lookups fall back to parsing
/// `DESCRIBE FORMATTED` output when it is absent or fails.
#[async_trait]
pub trait MetastoreClient: Send + Sync + 'static {
    async fn table_location(&self, database: &str, table: &str) -> Result<Option<String>>;
}

/// Quotes an identifier with backticks, doubling embedded backticks.
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

pub fn qualified_table(database: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(database), quote_ident(table))
}
