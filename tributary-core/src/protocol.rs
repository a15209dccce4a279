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

//! The downstream wire protocol.
//!
//! Messages flow to the sync cache as JSON objects discriminated by a
//! `tag` field. Every event translates into a transaction envelope:
//! `begin`, the row messages, `commit`, with the minted watermark on both
//! boundary messages. Relation metadata is sent lazily, once per table per
//! session, before the first row that references it.
//!
//! The protocol is versioned; [`PROTOCOL_VERSION`] is negotiated in the
//! session handshake and bumped on any incompatible change to these
//! shapes.

use crate::watermark::Watermark;
use bson::Document;
use serde::{Deserialize, Serialize};

/// Version of the downstream wire protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Relation (logical table) metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Logical schema the table belongs to
    pub schema: String,
    /// Table name
    pub name: String,
    /// Columns forming the primary key
    #[serde(rename = "keyColumns")]
    pub key_columns: Vec<String>,
}

/// A message sent to the downstream sync cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum WireMessage {
    /// Table metadata, sent before the first row of that table.
    Relation(Relation),

    /// A new row.
    Insert {
        /// Target table name
        relation: String,
        /// The full row
        row: Document,
    },

    /// A changed row, carrying the full post-image.
    Update {
        /// Target table name
        relation: String,
        /// The full row after the change
        row: Document,
    },

    /// A removed row, identified by its key columns only.
    Delete {
        /// Target table name
        relation: String,
        /// Values of the key columns
        #[serde(rename = "keyValues")]
        key_values: Document,
    },

    /// Opens the transaction for one upstream event.
    Begin {
        /// Watermark minted for the event
        watermark: Watermark,
    },

    /// Closes the transaction for one upstream event. Receipt of the
    /// commit makes the watermark eligible for acknowledgement.
    Commit {
        /// Watermark minted for the event
        watermark: Watermark,
    },
}

impl WireMessage {
    /// Returns the watermark carried by transaction boundary messages.
    #[must_use]
    pub fn watermark(&self) -> Option<&Watermark> {
        match self {
            WireMessage::Begin { watermark } | WireMessage::Commit { watermark } => {
                Some(watermark)
            }
            _ => None,
        }
    }
}

/// A frame received from the downstream client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum ClientFrame {
    /// The client has durably applied everything up to and including this
    /// watermark.
    Ack {
        /// Highest durably applied watermark
        watermark: Watermark,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn messages_are_tagged_lowercase() {
        let msg = WireMessage::Begin {
            watermark: Watermark::from_sequence(7),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["tag"], "begin");
        assert_eq!(json["watermark"], "00000000000000000007");
    }

    #[test]
    fn relation_uses_wire_field_names() {
        let msg = WireMessage::Relation(Relation {
            schema: "public".to_string(),
            name: "channels".to_string(),
            key_columns: vec!["_id".to_string()],
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["tag"], "relation");
        assert_eq!(json["keyColumns"][0], "_id");
    }

    #[test]
    fn delete_carries_key_values_only() {
        let msg = WireMessage::Delete {
            relation: "channels".to_string(),
            key_values: doc! { "_id": "r1" },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["tag"], "delete");
        assert_eq!(json["keyValues"]["_id"], "r1");
        assert!(json.get("row").is_none());
    }

    #[test]
    fn ack_frame_round_trips() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"tag":"ack","watermark":"00000000000000000003"}"#).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Ack {
                watermark: Watermark::new("00000000000000000003")
            }
        );
    }

    #[test]
    fn row_messages_round_trip() {
        let msg = WireMessage::Insert {
            relation: "channels".to_string(),
            row: doc! { "_id": "r1", "name": "general" },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
