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

//! Table mappings and the mapping registry.
//!
//! A [`TableMapping`] projects one logical table out of one upstream
//! collection. Collections holding discriminated unions get several
//! mappings with disjoint filters, one per variant; a single change event
//! can therefore fan out into rows for several tables.
//!
//! Mappings are declared either as a full reshaping pipeline or as the
//! filter + projection shorthand; the shorthand compiles into a two-stage
//! pipeline at build time so evaluation has a single path. The two forms
//! are mutually exclusive per mapping.
//!
//! The [`MappingRegistry`] indexes mappings by source collection and is
//! append-only once the bridge is running.

use crate::event::ChangeEvent;
use crate::expr::{self, EvalMode, ExprError, FieldPath, FilterExpr, ProjectionExpr};
use crate::pipeline::{Pipeline, Stage};
use bson::Document;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Errors building or registering table mappings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MappingError {
    /// A mapping declared both a pipeline and the filter/projection
    /// shorthand.
    #[error("mapping for table {table} declares both a pipeline and filter/projection")]
    ShorthandAndPipeline {
        /// Target table name
        table: String,
    },

    /// Key columns must not be empty when given explicitly.
    #[error("mapping for table {table} has empty key columns")]
    EmptyKeyColumns {
        /// Target table name
        table: String,
    },

    /// Two mappings registered under the same table name.
    #[error("duplicate mapping for table {table}")]
    DuplicateTable {
        /// Target table name
        table: String,
    },

    /// A filter, projection or pipeline failed to parse.
    #[error(transparent)]
    Expr(#[from] ExprError),
}

/// Declarative mapping from one upstream collection to one logical table.
#[derive(Debug, Clone)]
pub struct TableMapping {
    table: String,
    collection: String,
    key_columns: Vec<String>,
    pipeline: Pipeline,
}

impl TableMapping {
    /// Starts a mapping builder for `table` fed from `collection`.
    #[must_use]
    pub fn builder(table: impl Into<String>, collection: impl Into<String>) -> TableMappingBuilder {
        TableMappingBuilder {
            table: table.into(),
            collection: collection.into(),
            key_columns: None,
            filter: None,
            projection: None,
            pipeline: None,
        }
    }

    /// Target table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Source collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Columns forming the table's primary key. Defaults to `["_id"]`.
    #[must_use]
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// The compiled reshaping pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Extracts this mapping's key columns from a mapped row document.
    /// Returns `None` when a key column is absent from the row.
    #[must_use]
    pub fn key_values(&self, row: &Document) -> Option<Document> {
        let mut out = Document::new();
        for column in &self.key_columns {
            let value = expr::get_path(row, &FieldPath::parse(column))?;
            out.insert(column.clone(), value.clone());
        }
        Some(out)
    }
}

/// Builder for [`TableMapping`] with build-time validation.
#[derive(Debug, Clone)]
pub struct TableMappingBuilder {
    table: String,
    collection: String,
    key_columns: Option<Vec<String>>,
    filter: Option<Document>,
    projection: Option<Document>,
    pipeline: Option<Vec<Document>>,
}

impl TableMappingBuilder {
    /// Sets the key columns. Unset mappings key on `_id`.
    #[must_use]
    pub fn key_columns(mut self, columns: Vec<String>) -> Self {
        self.key_columns = Some(columns);
        self
    }

    /// Sets the shorthand row filter.
    #[must_use]
    pub fn filter(mut self, filter: Document) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the shorthand projection.
    #[must_use]
    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Sets the full reshaping pipeline.
    #[must_use]
    pub fn pipeline(mut self, stages: Vec<Document>) -> Self {
        self.pipeline = Some(stages);
        self
    }

    /// Validates and compiles the mapping.
    ///
    /// # Errors
    ///
    /// Rejects mappings mixing pipeline and shorthand forms, explicit empty
    /// key columns, and any expression that fails to parse.
    pub fn build(self) -> Result<TableMapping, MappingError> {
        if self.pipeline.is_some() && (self.filter.is_some() || self.projection.is_some()) {
            return Err(MappingError::ShorthandAndPipeline { table: self.table });
        }

        let key_columns = match self.key_columns {
            Some(columns) if columns.is_empty() => {
                return Err(MappingError::EmptyKeyColumns { table: self.table });
            }
            Some(columns) => columns,
            None => vec!["_id".to_string()],
        };

        let pipeline = if let Some(stages) = self.pipeline {
            Pipeline::parse(&stages)?
        } else {
            // Shorthand compiles to [$match, $project] so there is one
            // evaluation path.
            let mut stages = Vec::with_capacity(2);
            if let Some(filter) = &self.filter {
                stages.push(Stage::Match(FilterExpr::parse(filter)?));
            }
            if let Some(projection) = &self.projection {
                stages.push(Stage::Project(ProjectionExpr::parse(projection)?));
            }
            Pipeline::from_stages(stages)
        };

        Ok(TableMapping {
            table: self.table,
            collection: self.collection,
            key_columns,
            pipeline,
        })
    }
}

/// One resolved row: the mapping that produced it plus the row document.
#[derive(Debug, Clone)]
pub struct TableRow {
    /// The mapping that produced this row
    pub mapping: Arc<TableMapping>,
    /// The mapped row document
    pub document: Document,
}

/// All registered table mappings, indexed by source collection.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    by_collection: HashMap<String, Vec<Arc<TableMapping>>>,
    tables: HashSet<String>,
}

impl MappingRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mapping. Table names are unique across the registry.
    ///
    /// # Errors
    ///
    /// `DuplicateTable` when a mapping for the same table already exists.
    pub fn register(&mut self, mapping: TableMapping) -> Result<(), MappingError> {
        if !self.tables.insert(mapping.table.clone()) {
            return Err(MappingError::DuplicateTable {
                table: mapping.table,
            });
        }
        self.by_collection
            .entry(mapping.collection.clone())
            .or_default()
            .push(Arc::new(mapping));
        Ok(())
    }

    /// Mappings fed from the given collection, in registration order.
    #[must_use]
    pub fn mappings_for(&self, collection: &str) -> &[Arc<TableMapping>] {
        self.by_collection
            .get(collection)
            .map_or(&[], Vec::as_slice)
    }

    /// Number of registered mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the registry has no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Resolves a change event into the rows it produces, across every
    /// mapping on the event's collection.
    ///
    /// Deletes carry only their document key, so their pipelines run with
    /// lenient match semantics: a filter over a field the key-only shape
    /// lacks cannot disprove a match, and every mapping on the collection
    /// gets the chance to emit a tombstone.
    ///
    /// A document that fails a computed expression is dropped inside the
    /// pipeline run without disturbing its siblings; an unexpected pipeline
    /// error skips that mapping for this event and logs it. Other mappings
    /// and the stream continue either way.
    #[must_use]
    pub fn resolve(&self, event: &ChangeEvent) -> Vec<TableRow> {
        let Some(payload) = event.mapping_payload() else {
            return Vec::new();
        };
        let mode = if event.is_delete() {
            EvalMode::Lenient
        } else {
            EvalMode::Strict
        };

        let mut rows = Vec::new();
        for mapping in self.mappings_for(event.collection()) {
            match mapping.pipeline.run(payload, mode) {
                Ok(docs) => {
                    rows.extend(docs.into_iter().map(|document| TableRow {
                        mapping: Arc::clone(mapping),
                        document,
                    }));
                }
                Err(error) => {
                    warn!(
                        table = mapping.table(),
                        collection = event.collection(),
                        operation = %event.operation,
                        %error,
                        "skipping mapping: pipeline failed"
                    );
                }
            }
        }
        rows
    }

    /// Every registered mapping, useful for emitting relation metadata.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TableMapping>> {
        self.by_collection.values().flatten()
    }
}

/// Key values for a delete, resolved from the mapped tombstone row with a
/// fallback to the raw document key for the default `_id` key.
#[must_use]
pub fn delete_key_values(row: &TableRow, document_key: Option<&Document>) -> Option<Document> {
    if let Some(keys) = row.mapping.key_values(&row.document) {
        return Some(keys);
    }
    // A projection may rename _id away in the tombstone shape; fall back to
    // the upstream key when the mapping keys on _id.
    if row.mapping.key_columns() == ["_id"] {
        if let Some(key) = document_key {
            if let Some(id) = key.get("_id") {
                return Some(bson::doc! { "_id": id.clone() });
            }
        }
    }
    None
}
