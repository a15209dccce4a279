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

//! Normalized upstream change events.
//!
//! A [`ChangeEvent`] is a single mutation observed on the upstream change
//! feed, reduced to the fields the bridge needs: which collection changed,
//! how, the document key, the post-image when available, and the native
//! resume token that positions a cursor just after this event.
//!
//! Events convert from the MongoDB driver's `ChangeStreamEvent` at the
//! source boundary; everything downstream of [`crate::source`] works with
//! this normalized shape only.

use crate::watermark::ResumeToken;
use bson::Document;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error converting from the MongoDB driver's change stream event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversionError {
    /// The event's resume token could not be reduced to an opaque string.
    #[error("unusable resume token: {0}")]
    ResumeToken(String),
}

/// Change stream operation types handled by the bridge.
///
/// `Unknown` preserves operation strings from newer upstream versions so
/// they can be logged and dropped instead of failing the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted.
    Insert,
    /// A document was updated in place.
    Update,
    /// A document was replaced entirely.
    Replace,
    /// A document was deleted.
    Delete,
    /// The change feed itself was invalidated (collection dropped or
    /// renamed). Terminal for the cursor.
    Invalidate,
    /// An operation type this bridge does not handle.
    #[serde(untagged)]
    Unknown(String),
}

impl OperationType {
    /// Returns true for operations that carry row data downstream.
    #[inline]
    #[must_use]
    pub fn is_row_operation(&self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Update
                | OperationType::Replace
                | OperationType::Delete
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Insert => f.write_str("insert"),
            OperationType::Update => f.write_str("update"),
            OperationType::Replace => f.write_str("replace"),
            OperationType::Delete => f.write_str("delete"),
            OperationType::Invalidate => f.write_str("invalidate"),
            OperationType::Unknown(s) => f.write_str(s),
        }
    }
}

/// Upstream namespace (database + collection) of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name
    pub database: String,
    /// Collection name
    pub collection: String,
}

impl Namespace {
    /// Creates a namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

/// What changed in a partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    /// Fields added or modified
    #[serde(rename = "updatedFields")]
    pub updated_fields: Document,

    /// Fields removed from the document
    #[serde(rename = "removedFields")]
    pub removed_fields: Vec<String>,
}

/// A single normalized upstream mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Type of operation that occurred
    #[serde(rename = "operationType")]
    pub operation: OperationType,

    /// Namespace where the operation occurred
    #[serde(rename = "ns")]
    pub namespace: Namespace,

    /// Document key (`_id` plus the shard key on sharded collections).
    /// Absent only for invalidate events.
    #[serde(rename = "documentKey", skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Document>,

    /// Full document after the operation. Present for inserts and replaces,
    /// for updates when the cursor was opened with update lookup, never for
    /// deletes.
    #[serde(rename = "fullDocument", skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,

    /// Present only for update operations.
    #[serde(rename = "updateDescription", skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,

    /// Oplog timestamp of the operation
    #[serde(rename = "clusterTime")]
    pub cluster_time: DateTime<Utc>,

    /// Native cursor position just after this event
    #[serde(rename = "_id")]
    pub resume_token: ResumeToken,
}

impl ChangeEvent {
    /// Returns true if this is a delete operation.
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.operation == OperationType::Delete
    }

    /// Returns true if this event invalidates the change feed.
    #[inline]
    #[must_use]
    pub fn is_invalidate(&self) -> bool {
        self.operation == OperationType::Invalidate
    }

    /// Returns the collection name.
    #[inline]
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.namespace.collection
    }

    /// The document shape table mappings should evaluate against.
    ///
    /// Deletes carry no post-image, so resolution falls back to the
    /// document key; everything else uses the full document when present.
    #[must_use]
    pub fn mapping_payload(&self) -> Option<&Document> {
        if self.is_delete() {
            self.document_key.as_ref()
        } else {
            self.full_document.as_ref()
        }
    }
}

/// Reduces a driver resume token to the opaque string this system stores.
///
/// MongoDB tokens are `{"_data": "<hex>"}` documents; the hex payload alone
/// is a stable, per-shard totally ordered key.
fn token_string(token_doc: &Document) -> Result<String, ConversionError> {
    match token_doc.get_str("_data") {
        Ok(data) => Ok(data.to_string()),
        Err(_) => Err(ConversionError::ResumeToken(format!(
            "resume token has no _data string: {token_doc:?}"
        ))),
    }
}

/// Maps an oplog timestamp to a wall-clock instant, folding the increment
/// into sub-second nanoseconds so events within the same second keep their
/// order. Increments beyond the sub-second range clamp; they must not
/// overflow the nanosecond field or spill into the next second.
fn cluster_timestamp(ts: bson::Timestamp) -> DateTime<Utc> {
    let nanos = ts.increment.min(999_999) * 1_000;
    DateTime::from_timestamp(i64::from(ts.time), nanos).unwrap_or_else(Utc::now)
}

impl TryFrom<mongodb::change_stream::event::ChangeStreamEvent<Document>> for ChangeEvent {
    type Error = ConversionError;

    fn try_from(
        event: mongodb::change_stream::event::ChangeStreamEvent<Document>,
    ) -> Result<Self, Self::Error> {
        use mongodb::change_stream::event::OperationType as MongoOpType;

        let operation = match event.operation_type {
            MongoOpType::Insert => OperationType::Insert,
            MongoOpType::Update => OperationType::Update,
            MongoOpType::Replace => OperationType::Replace,
            MongoOpType::Delete => OperationType::Delete,
            // Dropping a watched collection invalidates the cursor; the
            // drop/rename events that precede the invalidate are treated
            // the same way so no row messages are emitted for them.
            MongoOpType::Invalidate | MongoOpType::Drop | MongoOpType::DropDatabase => {
                OperationType::Invalidate
            }
            other => OperationType::Unknown(format!("{other:?}")),
        };

        let namespace = event
            .ns
            .map(|ns| Namespace {
                database: ns.db,
                collection: ns.coll.unwrap_or_default(),
            })
            .unwrap_or_else(|| Namespace::new("", ""));

        let update_description = event.update_description.map(|ud| UpdateDescription {
            updated_fields: ud.updated_fields,
            removed_fields: ud.removed_fields,
        });

        let cluster_time = event
            .cluster_time
            .map(cluster_timestamp)
            .unwrap_or_else(Utc::now);

        let token_doc = bson::to_document(&event.id)
            .map_err(|e| ConversionError::ResumeToken(e.to_string()))?;
        let resume_token = ResumeToken::new(token_string(&token_doc)?);

        Ok(Self {
            operation,
            namespace,
            document_key: event.document_key,
            full_document: event.full_document,
            update_description,
            cluster_time,
            resume_token,
        })
    }
}
