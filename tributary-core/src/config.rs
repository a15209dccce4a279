// Copyright 2025 Tributary Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Bridge configuration.
//!
//! A [`BridgeConfig`] is deserialized from a JSON document declaring the
//! upstream connection, the watermark backend, session tuning, and the
//! table mappings. Filters, projections and pipelines are written as
//! plain JSON in the file and converted to BSON when the registry is
//! built, so a configuration error surfaces at startup with the table
//! name attached, never mid-stream.
//!
//! ```json
//! {
//!   "source": { "uri": "mongodb://localhost:27017", "database": "app" },
//!   "watermarks": { "type": "sqlite", "path": "/var/lib/tributary/wm.db" },
//!   "tables": {
//!     "channels": {
//!       "collection": "rooms",
//!       "filter": { "t": "c" },
//!       "projection": { "_id": 1, "name": 1 }
//!     }
//!   }
//! }
//! ```

use crate::mapping::{MappingError, MappingRegistry, TableMapping};
use crate::source::SourceConfig;
use bson::{Bson, Document};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Errors loading or validating a bridge configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration document is not valid JSON.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A JSON expression could not be converted to BSON.
    #[error("table {table}: {field} is not convertible to BSON: {message}")]
    InvalidExpression {
        /// Table whose declaration failed
        table: String,
        /// Which field failed (`filter`, `projection`, `pipeline`)
        field: &'static str,
        /// Conversion error detail
        message: String,
    },

    /// A mapping failed validation.
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// The configuration declares no tables.
    #[error("configuration declares no tables")]
    NoTables,
}

/// Upstream connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// MongoDB connection string
    pub uri: String,
    /// Database to watch
    pub database: String,
    /// Initial reconnect backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Reconnect backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Reconnect attempts before giving up (0 = infinite)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Cursor batch size
    #[serde(default)]
    pub batch_size: Option<u32>,
}

fn default_initial_backoff_ms() -> u64 {
    100
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Watermark backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WatermarkBackend {
    /// Redis-backed store for multi-instance deployments.
    Redis {
        /// Redis connection URL
        url: String,
        /// Key namespace, defaults to `tributary`
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
    /// SQLite-backed store for single-process deployments.
    Sqlite {
        /// Database file path
        path: String,
    },
    /// Identity mapping; only valid when upstream tokens already sort.
    Passthrough,
}

fn default_key_prefix() -> String {
    "tributary".to_string()
}

/// One table declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Source collection
    pub collection: String,
    /// Key columns, defaulting to `["_id"]`
    #[serde(default)]
    pub key_columns: Option<Vec<String>>,
    /// Shorthand row filter
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
    /// Shorthand projection
    #[serde(default)]
    pub projection: Option<serde_json::Value>,
    /// Full reshaping pipeline
    #[serde(default)]
    pub pipeline: Option<Vec<serde_json::Value>>,
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Upstream connection
    pub source: SourceSettings,
    /// Watermark backend
    pub watermarks: WatermarkBackend,
    /// Logical schema stamped on relation metadata
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Session queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Table declarations, keyed by table name
    pub tables: BTreeMap<String, TableConfig>,
}

fn default_schema() -> String {
    "public".to_string()
}
fn default_queue_capacity() -> usize {
    256
}

impl BridgeConfig {
    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// JSON syntax errors, or an empty `tables` map.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        if config.tables.is_empty() {
            return Err(ConfigError::NoTables);
        }
        Ok(config)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// I/O failures plus everything [`Self::from_json_str`] rejects.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Compiles the table declarations into a mapping registry.
    ///
    /// # Errors
    ///
    /// BSON conversion failures and mapping validation errors, each
    /// naming the offending table.
    pub fn build_registry(&self) -> Result<MappingRegistry, ConfigError> {
        let mut registry = MappingRegistry::new();
        for (table, decl) in &self.tables {
            let mut builder = TableMapping::builder(table.clone(), decl.collection.clone());
            if let Some(columns) = &decl.key_columns {
                builder = builder.key_columns(columns.clone());
            }
            if let Some(filter) = &decl.filter {
                builder = builder.filter(to_bson_document(table, "filter", filter)?);
            }
            if let Some(projection) = &decl.projection {
                builder = builder.projection(to_bson_document(table, "projection", projection)?);
            }
            if let Some(stages) = &decl.pipeline {
                let docs = stages
                    .iter()
                    .map(|stage| to_bson_document(table, "pipeline", stage))
                    .collect::<Result<Vec<_>, _>>()?;
                builder = builder.pipeline(docs);
            }
            registry.register(builder.build()?)?;
        }
        Ok(registry)
    }

    /// Distinct source collections across all tables, for the upstream
    /// watch filter.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut collections: Vec<String> = self
            .tables
            .values()
            .map(|t| t.collection.clone())
            .collect();
        collections.sort();
        collections.dedup();
        collections
    }

    /// Builds the upstream source configuration (resume position is
    /// supplied per session).
    #[must_use]
    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            collections: self.collections(),
            resume_after: None,
            initial_backoff_ms: self.source.initial_backoff_ms,
            max_backoff_ms: self.source.max_backoff_ms,
            max_reconnect_attempts: self.source.max_reconnect_attempts,
            batch_size: self.source.batch_size,
            backoff_jitter: 0.1,
        }
    }
}

fn to_bson_document(
    table: &str,
    field: &'static str,
    value: &serde_json::Value,
) -> Result<Document, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidExpression {
        table: table.to_string(),
        field,
        message,
    };
    match Bson::try_from(value.clone()) {
        Ok(Bson::Document(doc)) => Ok(doc),
        Ok(other) => Err(invalid(format!(
            "expected an object, got {:?}",
            other.element_type()
        ))),
        Err(err) => Err(invalid(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "source": { "uri": "mongodb://localhost:27017", "database": "app" },
        "watermarks": { "type": "passthrough" },
        "tables": {
            "channels": {
                "collection": "rooms",
                "filter": { "t": "c" },
                "projection": { "_id": 1, "name": 1 }
            },
            "dms": {
                "collection": "rooms",
                "filter": { "t": "d" }
            },
            "users": {
                "collection": "users"
            }
        }
    }"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = BridgeConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.schema, "public");
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.source.initial_backoff_ms, 100);
        assert_eq!(config.watermarks, WatermarkBackend::Passthrough);
    }

    #[test]
    fn registry_builds_from_tables() {
        let config = BridgeConfig::from_json_str(MINIMAL).unwrap();
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.mappings_for("rooms").len(), 2);
        assert_eq!(registry.mappings_for("users").len(), 1);
    }

    #[test]
    fn collections_are_distinct() {
        let config = BridgeConfig::from_json_str(MINIMAL).unwrap();
        assert_eq!(config.collections(), vec!["rooms", "users"]);
    }

    #[test]
    fn empty_tables_rejected() {
        let json = r#"{
            "source": { "uri": "mongodb://localhost", "database": "app" },
            "watermarks": { "type": "passthrough" },
            "tables": {}
        }"#;
        assert!(matches!(
            BridgeConfig::from_json_str(json),
            Err(ConfigError::NoTables)
        ));
    }

    #[test]
    fn backend_variants_parse() {
        let json = r#"{ "type": "redis", "url": "redis://localhost:6379" }"#;
        let backend: WatermarkBackend = serde_json::from_str(json).unwrap();
        assert_eq!(
            backend,
            WatermarkBackend::Redis {
                url: "redis://localhost:6379".to_string(),
                key_prefix: "tributary".to_string(),
            }
        );

        let json = r#"{ "type": "sqlite", "path": "/tmp/wm.db" }"#;
        let backend: WatermarkBackend = serde_json::from_str(json).unwrap();
        assert_eq!(
            backend,
            WatermarkBackend::Sqlite {
                path: "/tmp/wm.db".to_string()
            }
        );
    }

    #[test]
    fn pipeline_tables_compile() {
        let json = r#"{
            "source": { "uri": "mongodb://localhost", "database": "app" },
            "watermarks": { "type": "passthrough" },
            "tables": {
                "room_members": {
                    "collection": "rooms",
                    "key_columns": ["room_id", "member"],
                    "pipeline": [
                        { "$unwind": "$members" },
                        { "$project": { "room_id": "$_id", "member": "$members" } }
                    ]
                }
            }
        }"#;
        let config = BridgeConfig::from_json_str(json).unwrap();
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.mappings_for("rooms").len(), 1);
    }

    #[test]
    fn bad_filter_names_the_table() {
        let json = r#"{
            "source": { "uri": "mongodb://localhost", "database": "app" },
            "watermarks": { "type": "passthrough" },
            "tables": {
                "broken": {
                    "collection": "rooms",
                    "filter": { "x": { "$near": 1 } }
                }
            }
        }"#;
        let config = BridgeConfig::from_json_str(json).unwrap();
        let err = config.build_registry().unwrap_err();
        assert!(matches!(err, ConfigError::Mapping(_)));
    }

    #[test]
    fn shorthand_plus_pipeline_rejected() {
        let json = r#"{
            "source": { "uri": "mongodb://localhost", "database": "app" },
            "watermarks": { "type": "passthrough" },
            "tables": {
                "broken": {
                    "collection": "rooms",
                    "filter": { "t": "c" },
                    "pipeline": [ { "$match": { "t": "c" } } ]
                }
            }
        }"#;
        let config = BridgeConfig::from_json_str(json).unwrap();
        assert!(config.build_registry().is_err());
    }
}
