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

//! Ordered table of formats the shadow-swap rewrite must never touch.
//!
//! Rules are evaluated top to bottom and the first match wins. New engines
//! are supported by appending a rule; control flow does not change.

use crate::model::TableFormatInfo;

pub struct UnsupportedRule {
    pub name: &'static str,
    pub matches: fn(&TableFormatInfo) -> bool,
    pub reason: &'static str,
}

fn class_fields_contain(info: &TableFormatInfo, needle: &str) -> bool {
    [&info.input_format, &info.serde, &info.storage_handler]
        .iter()
        .any(|field| field.to_ascii_lowercase().contains(needle))
}

fn is_hudi(info: &TableFormatInfo) -> bool {
    class_fields_contain(info, "hudi") || info.properties.keys().any(|k| k.starts_with("hoodie."))
}

fn is_iceberg(info: &TableFormatInfo) -> bool {
    class_fields_contain(info, "iceberg")
}

fn is_delta(info: &TableFormatInfo) -> bool {
    class_fields_contain(info, "delta")
}

fn is_transactional(info: &TableFormatInfo) -> bool {
    let flagged = info.properties.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("transactional") && v.trim().eq_ignore_ascii_case("true")
    });
    flagged || info.storage_handler.to_ascii_lowercase().contains("acid")
}

pub const UNSUPPORTED_RULES: &[UnsupportedRule] = &[
    UnsupportedRule {
        name: "hudi",
        matches: is_hudi,
        reason: "Hudi table; use Hudi's native compaction",
    },
    UnsupportedRule {
        name: "iceberg",
        matches: is_iceberg,
        reason: "Iceberg table; use Iceberg's rewrite_data_files",
    },
    UnsupportedRule {
        name: "delta",
        matches: is_delta,
        reason: "Delta Lake table; use Delta's OPTIMIZE",
    },
    UnsupportedRule {
        name: "acid",
        matches: is_transactional,
        reason: "ACID/transactional table; use the engine's native compaction",
    },
];

/// Reason of the first matching rule, `None` when the table is supported.
pub fn unsupported_reason(info: &TableFormatInfo) -> Option<&'static str> {
    UNSUPPORTED_RULES
        .iter()
        .find(|rule| (rule.matches)(info))
        .map(|rule| rule.reason)
}

pub fn is_unsupported_type(info: &TableFormatInfo) -> bool {
    unsupported_reason(info).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(input_format: &str, serde: &str, storage_handler: &str) -> TableFormatInfo {
        TableFormatInfo {
            input_format: input_format.to_owned(),
            serde: serde.to_owned(),
            storage_handler: storage_handler.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_hudi_detected_in_any_class_field() {
        let cases = [
            info_with("org.apache.hudi.hadoop.HoodieParquetInputFormat", "", ""),
            info_with("", "org.apache.hudi.SomeSerde", ""),
            info_with("", "", "org.apache.HUDI.Handler"),
        ];
        for info in &cases {
            assert!(is_unsupported_type(info));
            assert!(unsupported_reason(info).unwrap().contains("Hudi"));
        }
    }

    #[test]
    fn test_hudi_detected_by_property_prefix() {
        let mut info = info_with("org.apache.hadoop.mapred.TextInputFormat", "", "");
        info.properties
            .insert("hoodie.table.name".to_owned(), "t".to_owned());
        assert!(unsupported_reason(&info).unwrap().contains("Hudi"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        // Both hudi and transactional: hudi is listed first.
        let mut info = info_with("org.apache.hudi.X", "", "");
        info.properties
            .insert("transactional".to_owned(), "true".to_owned());
        assert!(unsupported_reason(&info).unwrap().contains("Hudi"));
    }

    #[test]
    fn test_iceberg_delta_and_acid() {
        let iceberg = info_with("", "", "org.apache.iceberg.mr.hive.HiveIcebergStorageHandler");
        assert!(unsupported_reason(&iceberg).unwrap().contains("Iceberg"));
        assert!(
            unsupported_reason(&info_with("io.delta.hive.DeltaInputFormat", "", ""))
                .unwrap()
                .contains("Delta")
        );
        assert!(
            unsupported_reason(&info_with("", "", "com.example.AcidStorageHandler"))
                .unwrap()
                .contains("transactional")
        );

        let mut info = TableFormatInfo::default();
        info.properties
            .insert("TRANSACTIONAL".to_owned(), "True".to_owned());
        assert!(unsupported_reason(&info).unwrap().contains("transactional"));
        info.properties
            .insert("TRANSACTIONAL".to_owned(), "false".to_owned());
        assert!(!is_unsupported_type(&info));
    }

    #[test]
    fn test_plain_formats_supported() {
        let info = info_with(
            "org.apache.hadoop.hive.ql.io.parquet.MapredParquetInputFormat",
            "org.apache.hadoop.hive.ql.io.parquet.serde.ParquetHiveSerDe",
            "",
        );
        assert!(!is_unsupported_type(&info));
    }
}
