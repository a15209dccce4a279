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

//! Event-to-wire translation.
//!
//! The [`Translator`] turns one upstream change event into one downstream
//! transaction: mint (or look up) the watermark for the event's resume
//! token, resolve the event through the mapping registry, and wrap the
//! resulting row messages in `begin`/`commit` boundaries carrying that
//! watermark.
//!
//! Relation metadata is emitted lazily: the first time a table appears in
//! a session, its `relation` message precedes the row that references it.
//! The announced set is per-translator, so a reconnecting client always
//! receives relations again before any rows.
//!
//! Events that resolve to zero rows are skipped without minting a
//! watermark; replaying such an event after a reconnect re-skips it, so
//! nothing is lost by not recording a position for it.

use crate::event::{ChangeEvent, OperationType};
use crate::mapping::{delete_key_values, MappingRegistry, TableRow};
use crate::protocol::{Relation, WireMessage};
use crate::watermark::{ResumeToken, ShardId, Watermark, WatermarkError, WatermarkStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of translating one upstream event.
#[derive(Debug)]
pub enum Translated {
    /// A transaction to forward downstream.
    Batch(TranslatedBatch),

    /// The upstream feed was invalidated; the session must end.
    Invalidated {
        /// Collection whose feed was invalidated
        collection: String,
    },

    /// The event produced nothing (unmapped collection, filtered out, or
    /// an operation type that carries no rows).
    Skipped,
}

/// One downstream transaction: `begin`, rows, `commit`.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedBatch {
    /// Watermark minted for the source event
    pub watermark: Watermark,
    /// Messages in send order, boundaries included
    pub messages: Vec<WireMessage>,
}

/// Translates normalized change events into wire transactions for one
/// shard session.
pub struct Translator {
    shard: ShardId,
    schema: String,
    registry: Arc<MappingRegistry>,
    store: Arc<dyn WatermarkStore>,
    announced: HashSet<String>,
}

impl Translator {
    /// Creates a translator for a shard session.
    ///
    /// `schema` is the logical schema name stamped on relation metadata.
    pub fn new(
        shard: ShardId,
        schema: impl Into<String>,
        registry: Arc<MappingRegistry>,
        store: Arc<dyn WatermarkStore>,
    ) -> Self {
        Self {
            shard,
            schema: schema.into(),
            registry,
            store,
            announced: HashSet::new(),
        }
    }

    /// Resolves where the upstream cursor should start for this shard.
    ///
    /// The last acknowledged watermark maps back to its resume token;
    /// `None` means no checkpoint exists and the cursor starts at now.
    ///
    /// # Errors
    ///
    /// Store failures are fatal to session establishment.
    pub async fn starting_position(&self) -> Result<Option<ResumeToken>, WatermarkError> {
        let Some(checkpoint) = self.store.load_checkpoint(&self.shard).await? else {
            return Ok(None);
        };
        let Some(acknowledged) = checkpoint.last_acknowledged else {
            return Ok(None);
        };
        let token = self.store.resume_token_for(&self.shard, &acknowledged).await?;
        if token.is_none() {
            // The checkpoint references a watermark this store never
            // issued; starting fresh is the only safe option.
            warn!(
                shard = %self.shard,
                watermark = %acknowledged,
                "checkpointed watermark has no resume token, starting from now"
            );
        }
        Ok(token)
    }

    /// Translates one event into a downstream transaction.
    ///
    /// # Errors
    ///
    /// Watermark store failures are fatal to the session; everything else
    /// is handled by skipping.
    pub async fn translate(&mut self, event: &ChangeEvent) -> Result<Translated, WatermarkError> {
        if event.is_invalidate() {
            return Ok(Translated::Invalidated {
                collection: event.collection().to_string(),
            });
        }
        if !event.operation.is_row_operation() {
            debug!(operation = %event.operation, "skipping non-row operation");
            return Ok(Translated::Skipped);
        }

        let rows = self.registry.resolve(event);
        if rows.is_empty() {
            return Ok(Translated::Skipped);
        }

        let watermark = self
            .store
            .get_or_create_watermark(&self.shard, &event.resume_token)
            .await?;

        let mut messages = Vec::with_capacity(rows.len() + 2);
        messages.push(WireMessage::Begin {
            watermark: watermark.clone(),
        });
        for row in &rows {
            self.announce_relation(row, &mut messages);
            if let Some(message) = self.row_message(event, row) {
                messages.push(message);
            }
        }
        messages.push(WireMessage::Commit {
            watermark: watermark.clone(),
        });

        // A batch whose rows all failed key resolution still carries its
        // boundaries so the watermark reaches the client.
        Ok(Translated::Batch(TranslatedBatch {
            watermark,
            messages,
        }))
    }

    fn announce_relation(&mut self, row: &TableRow, messages: &mut Vec<WireMessage>) {
        let table = row.mapping.table();
        if self.announced.insert(table.to_string()) {
            messages.push(WireMessage::Relation(Relation {
                schema: self.schema.clone(),
                name: table.to_string(),
                key_columns: row.mapping.key_columns().to_vec(),
            }));
        }
    }

    fn row_message(&self, event: &ChangeEvent, row: &TableRow) -> Option<WireMessage> {
        let relation = row.mapping.table().to_string();
        match event.operation {
            OperationType::Insert => Some(WireMessage::Insert {
                relation,
                row: row.document.clone(),
            }),
            // A replace is a full post-image like an update-with-lookup;
            // downstream applies both as an upsert by key.
            OperationType::Update | OperationType::Replace => Some(WireMessage::Update {
                relation,
                row: row.document.clone(),
            }),
            OperationType::Delete => {
                match delete_key_values(row, event.document_key.as_ref()) {
                    Some(key_values) => Some(WireMessage::Delete {
                        relation,
                        key_values,
                    }),
                    None => {
                        warn!(
                            table = row.mapping.table(),
                            "skipping delete: key columns unresolvable from tombstone"
                        );
                        None
                    }
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Namespace;
    use crate::mapping::TableMapping;
    use crate::watermark::PassthroughWatermarks;
    use bson::{doc, Document};
    use chrono::Utc;

    fn registry() -> Arc<MappingRegistry> {
        let mut registry = MappingRegistry::new();
        registry
            .register(
                TableMapping::builder("channels", "rooms")
                    .filter(doc! { "t": "c" })
                    .projection(doc! { "_id": 1, "name": 1 })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                TableMapping::builder("dms", "rooms")
                    .filter(doc! { "t": "d" })
                    .projection(doc! { "_id": 1 })
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn translator(registry: Arc<MappingRegistry>) -> Translator {
        Translator::new(
            ShardId::new("s1"),
            "public",
            registry,
            Arc::new(PassthroughWatermarks::new()),
        )
    }

    fn event(op: OperationType, token: &str, full: Option<Document>) -> ChangeEvent {
        ChangeEvent {
            operation: op,
            namespace: Namespace::new("app", "rooms"),
            document_key: Some(doc! { "_id": "r1" }),
            full_document: full,
            update_description: None,
            cluster_time: Utc::now(),
            resume_token: ResumeToken::new(token),
        }
    }

    #[tokio::test]
    async fn insert_wraps_rows_in_boundaries() {
        let mut translator = translator(registry());
        let ev = event(
            OperationType::Insert,
            "t1",
            Some(doc! { "_id": "r1", "t": "c", "name": "general" }),
        );

        let Translated::Batch(batch) = translator.translate(&ev).await.unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(batch.watermark, Watermark::new("t1"));
        assert_eq!(
            batch.messages,
            vec![
                WireMessage::Begin {
                    watermark: Watermark::new("t1")
                },
                WireMessage::Relation(Relation {
                    schema: "public".to_string(),
                    name: "channels".to_string(),
                    key_columns: vec!["_id".to_string()],
                }),
                WireMessage::Insert {
                    relation: "channels".to_string(),
                    row: doc! { "_id": "r1", "name": "general" },
                },
                WireMessage::Commit {
                    watermark: Watermark::new("t1")
                },
            ]
        );
    }

    #[tokio::test]
    async fn relation_announced_once_per_session() {
        let mut translator = translator(registry());
        let first = event(
            OperationType::Insert,
            "t1",
            Some(doc! { "_id": "r1", "t": "c", "name": "a" }),
        );
        let second = event(
            OperationType::Insert,
            "t2",
            Some(doc! { "_id": "r2", "t": "c", "name": "b" }),
        );

        let Translated::Batch(_) = translator.translate(&first).await.unwrap() else {
            panic!("expected a batch");
        };
        let Translated::Batch(batch) = translator.translate(&second).await.unwrap() else {
            panic!("expected a batch");
        };
        assert!(!batch
            .messages
            .iter()
            .any(|m| matches!(m, WireMessage::Relation(_))));
    }

    #[tokio::test]
    async fn replace_translates_to_update() {
        let mut translator = translator(registry());
        let ev = event(
            OperationType::Replace,
            "t1",
            Some(doc! { "_id": "r1", "t": "c", "name": "renamed" }),
        );
        let Translated::Batch(batch) = translator.translate(&ev).await.unwrap() else {
            panic!("expected a batch");
        };
        assert!(batch
            .messages
            .iter()
            .any(|m| matches!(m, WireMessage::Update { .. })));
    }

    #[tokio::test]
    async fn delete_fans_out_tombstones() {
        let mut translator = translator(registry());
        let mut ev = event(OperationType::Delete, "t9", None);
        ev.full_document = None;

        let Translated::Batch(batch) = translator.translate(&ev).await.unwrap() else {
            panic!("expected a batch");
        };
        let deletes: Vec<_> = batch
            .messages
            .iter()
            .filter_map(|m| match m {
                WireMessage::Delete {
                    relation,
                    key_values,
                } => Some((relation.as_str(), key_values)),
                _ => None,
            })
            .collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0], ("channels", &doc! { "_id": "r1" }));
        assert_eq!(deletes[1], ("dms", &doc! { "_id": "r1" }));
    }

    #[tokio::test]
    async fn unmapped_event_is_skipped_without_minting() {
        let mut translator = translator(registry());
        let mut ev = event(
            OperationType::Insert,
            "t1",
            Some(doc! { "_id": "x", "kind": "other" }),
        );
        ev.namespace = Namespace::new("app", "unmapped");
        assert!(matches!(
            translator.translate(&ev).await.unwrap(),
            Translated::Skipped
        ));
    }

    #[tokio::test]
    async fn filtered_out_event_is_skipped() {
        let mut translator = translator(registry());
        // t: "x" matches neither discriminator.
        let ev = event(
            OperationType::Insert,
            "t1",
            Some(doc! { "_id": "r1", "t": "x" }),
        );
        assert!(matches!(
            translator.translate(&ev).await.unwrap(),
            Translated::Skipped
        ));
    }

    #[tokio::test]
    async fn invalidate_ends_translation() {
        let mut translator = translator(registry());
        let mut ev = event(OperationType::Invalidate, "t1", None);
        ev.document_key = None;
        let out = translator.translate(&ev).await.unwrap();
        assert!(matches!(out, Translated::Invalidated { ref collection } if collection == "rooms"));
    }

    #[tokio::test]
    async fn starting_position_maps_acknowledged_watermark() {
        let store = Arc::new(PassthroughWatermarks::new());
        let shard = ShardId::new("s1");
        store
            .save_checkpoint(
                &shard,
                &crate::watermark::ShardCheckpoint {
                    last_pending: Some(Watermark::new("t5")),
                    last_acknowledged: Some(Watermark::new("t3")),
                },
            )
            .await
            .unwrap();
        let translator = Translator::new(shard, "public", registry(), store);
        assert_eq!(
            translator.starting_position().await.unwrap(),
            Some(ResumeToken::new("t3"))
        );
    }

    #[tokio::test]
    async fn no_checkpoint_starts_from_now() {
        let translator = translator(registry());
        assert_eq!(translator.starting_position().await.unwrap(), None);
    }
}
