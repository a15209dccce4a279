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

//! Watermark and checkpoint primitives.
//!
//! A *watermark* is an opaque string minted by this system for an upstream
//! resume token. For a fixed shard, watermarks sort lexicographically in the
//! same order the resume tokens were observed, which makes them safe to
//! compare, persist, and hand to downstream consumers as replay positions.
//!
//! The [`WatermarkStore`] trait is the seam between the streaming core and
//! the persistence backends. Backends live in the `tributary-stores` crate
//! (Redis for multi-instance deployments, SQLite for single-process ones);
//! the [`PassthroughWatermarks`] implementation in this module covers
//! upstreams whose native tokens already sort correctly.
//!
//! # Example
//!
//! ```rust
//! use tributary_core::watermark::{PassthroughWatermarks, ResumeToken, ShardId, WatermarkStore};
//!
//! # async fn example() -> Result<(), tributary_core::watermark::WatermarkError> {
//! let store = PassthroughWatermarks::new();
//! let shard = ShardId::new("s1");
//! let token = ResumeToken::new("826B4FD3");
//!
//! let mark = store.get_or_create_watermark(&shard, &token).await?;
//! let back = store.resume_token_for(&shard, &mark).await?;
//! assert_eq!(back, Some(token));
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identifier of an independently resumable partition of the change stream.
///
/// All watermark and checkpoint state is scoped by shard; no ordering is
/// implied across shards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a shard id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the shard id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque upstream-native cursor position.
///
/// Never constructed with meaning by this system; only stored, compared for
/// equality, and handed back to the upstream driver to reposition a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    /// Wraps an upstream token payload.
    pub fn new(data: impl Into<String>) -> Self {
        Self(data.into())
    }

    /// Returns the raw token payload.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuilds the BSON document shape the MongoDB driver expects for
    /// `resume_after`.
    #[must_use]
    pub fn to_document(&self) -> bson::Document {
        bson::doc! { "_data": self.0.clone() }
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque checkpoint string issued by a [`WatermarkStore`].
///
/// For a fixed shard, the `Ord` on this type (plain lexicographic string
/// order) matches the arrival order of the resume tokens the watermarks
/// were minted for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    /// Wraps an already-minted watermark string.
    pub fn new(mark: impl Into<String>) -> Self {
        Self(mark.into())
    }

    /// Formats a store-assigned sequence number as a watermark.
    ///
    /// Zero-padded decimal so that lexicographic order equals numeric order
    /// across process restarts.
    #[must_use]
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("{seq:020}"))
    }

    /// Returns the watermark as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-shard replay positions persisted by the session gateway.
///
/// `last_pending` is the newest watermark handed to the client transport;
/// `last_acknowledged` is the newest watermark the client confirmed. On
/// reconnect, replay starts from `last_acknowledged`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCheckpoint {
    /// Newest watermark sent to the client but not yet acknowledged.
    #[serde(rename = "lastPendingWatermark", skip_serializing_if = "Option::is_none")]
    pub last_pending: Option<Watermark>,

    /// Newest watermark the client acknowledged.
    #[serde(
        rename = "lastAcknowledgedWatermark",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_acknowledged: Option<Watermark>,
}

/// Errors from watermark store operations.
///
/// Any of these is fatal to the shard session that observes it: the caller
/// must tear the session down and retry establishment rather than fall back
/// to a different minting strategy.
#[derive(Debug, thiserror::Error)]
pub enum WatermarkError {
    /// The backing store could not be reached or rejected the operation.
    #[error("watermark backend error: {message}")]
    Backend {
        /// Human-readable error message
        message: String,
        /// The underlying backend error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Stored state failed to encode or decode.
    #[error("watermark serialization error: {0}")]
    Serialization(String),

    /// The store was closed and can no longer serve requests.
    #[error("watermark store is closed")]
    Closed,
}

impl WatermarkError {
    /// Creates a backend error from any error type.
    #[must_use]
    pub fn backend(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a backend error with a plain message.
    #[must_use]
    pub fn backend_msg(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

/// Bidirectional, per-shard mapping between resume tokens and watermarks,
/// plus checkpoint persistence for the session gateway.
///
/// # Contract
///
/// - `get_or_create_watermark` is idempotent: the same `(shard, token)` pair
///   always yields the same watermark, including under concurrent callers
///   (backends use compare-and-set or an equivalent to converge).
/// - For a fixed shard, watermarks are strictly increasing in the order the
///   distinct tokens were first presented.
/// - Operations for different shards never serialize against each other
///   beyond what the backend itself requires.
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Returns the watermark for `token`, minting one if this is the first
    /// time the `(shard, token)` pair is seen.
    async fn get_or_create_watermark(
        &self,
        shard: &ShardId,
        token: &ResumeToken,
    ) -> Result<Watermark, WatermarkError>;

    /// Maps a previously issued watermark back to its resume token.
    ///
    /// Returns `None` if the watermark was never issued for this shard.
    async fn resume_token_for(
        &self,
        shard: &ShardId,
        watermark: &Watermark,
    ) -> Result<Option<ResumeToken>, WatermarkError>;

    /// Loads the persisted checkpoint for a shard, if any.
    async fn load_checkpoint(
        &self,
        shard: &ShardId,
    ) -> Result<Option<ShardCheckpoint>, WatermarkError>;

    /// Persists the checkpoint for a shard, replacing any previous value.
    async fn save_checkpoint(
        &self,
        shard: &ShardId,
        checkpoint: &ShardCheckpoint,
    ) -> Result<(), WatermarkError>;

    /// Closes the store, releasing any resources.
    async fn close(&self) -> Result<(), WatermarkError>;
}

/// Identity watermark mapping for upstreams whose native tokens already
/// sort lexicographically.
///
/// No translation state is kept; the watermark *is* the token. Checkpoints
/// are held in memory only, so this implementation is suitable for tests
/// and for deployments that track replay positions elsewhere.
#[derive(Debug, Clone, Default)]
pub struct PassthroughWatermarks {
    checkpoints: Arc<RwLock<HashMap<ShardId, ShardCheckpoint>>>,
}

impl PassthroughWatermarks {
    /// Creates a new passthrough store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for PassthroughWatermarks {
    async fn get_or_create_watermark(
        &self,
        _shard: &ShardId,
        token: &ResumeToken,
    ) -> Result<Watermark, WatermarkError> {
        Ok(Watermark::new(token.as_str()))
    }

    async fn resume_token_for(
        &self,
        _shard: &ShardId,
        watermark: &Watermark,
    ) -> Result<Option<ResumeToken>, WatermarkError> {
        Ok(Some(ResumeToken::new(watermark.as_str())))
    }

    async fn load_checkpoint(
        &self,
        shard: &ShardId,
    ) -> Result<Option<ShardCheckpoint>, WatermarkError> {
        Ok(self.checkpoints.read().await.get(shard).cloned())
    }

    async fn save_checkpoint(
        &self,
        shard: &ShardId,
        checkpoint: &ShardCheckpoint,
    ) -> Result<(), WatermarkError> {
        self.checkpoints
            .write()
            .await
            .insert(shard.clone(), checkpoint.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), WatermarkError> {
        Ok(())
    }
}
