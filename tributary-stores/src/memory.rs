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

//! In-memory watermark store.
//!
//! Sequence-minting semantics identical to the persistent backends, with
//! no durability. Useful in tests that need real minting (as opposed to
//! the identity passthrough) and in throwaway deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tributary_core::watermark::{
    ResumeToken, ShardCheckpoint, ShardId, Watermark, WatermarkError, WatermarkStore,
};

#[derive(Debug, Default)]
struct ShardState {
    next_seq: u64,
    by_token: HashMap<ResumeToken, Watermark>,
    by_watermark: HashMap<Watermark, ResumeToken>,
    checkpoint: Option<ShardCheckpoint>,
}

/// Watermark store backed by process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shards: Arc<RwLock<HashMap<ShardId, ShardState>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn get_or_create_watermark(
        &self,
        shard: &ShardId,
        token: &ResumeToken,
    ) -> Result<Watermark, WatermarkError> {
        let mut shards = self.shards.write().await;
        let state = shards.entry(shard.clone()).or_default();
        if let Some(existing) = state.by_token.get(token) {
            return Ok(existing.clone());
        }
        state.next_seq += 1;
        let minted = Watermark::from_sequence(state.next_seq);
        state.by_token.insert(token.clone(), minted.clone());
        state.by_watermark.insert(minted.clone(), token.clone());
        Ok(minted)
    }

    async fn resume_token_for(
        &self,
        shard: &ShardId,
        watermark: &Watermark,
    ) -> Result<Option<ResumeToken>, WatermarkError> {
        let shards = self.shards.read().await;
        Ok(shards
            .get(shard)
            .and_then(|state| state.by_watermark.get(watermark))
            .cloned())
    }

    async fn load_checkpoint(
        &self,
        shard: &ShardId,
    ) -> Result<Option<ShardCheckpoint>, WatermarkError> {
        let shards = self.shards.read().await;
        Ok(shards.get(shard).and_then(|s| s.checkpoint.clone()))
    }

    async fn save_checkpoint(
        &self,
        shard: &ShardId,
        checkpoint: &ShardCheckpoint,
    ) -> Result<(), WatermarkError> {
        let mut shards = self.shards.write().await;
        shards.entry(shard.clone()).or_default().checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), WatermarkError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn minting_is_idempotent() {
        let store = MemoryStore::new();
        let shard = ShardId::new("s1");
        let token = ResumeToken::new("tok-a");

        let first = store.get_or_create_watermark(&shard, &token).await.unwrap();
        let second = store.get_or_create_watermark(&shard, &token).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn watermarks_increase_in_arrival_order() {
        let store = MemoryStore::new();
        let shard = ShardId::new("s1");

        let a = store
            .get_or_create_watermark(&shard, &ResumeToken::new("a"))
            .await
            .unwrap();
        let b = store
            .get_or_create_watermark(&shard, &ResumeToken::new("b"))
            .await
            .unwrap();
        assert!(a < b);
    }

    #[tokio::test]
    async fn shards_mint_independently() {
        let store = MemoryStore::new();
        let token = ResumeToken::new("same");

        let s1 = store
            .get_or_create_watermark(&ShardId::new("s1"), &token)
            .await
            .unwrap();
        let s2 = store
            .get_or_create_watermark(&ShardId::new("s2"), &token)
            .await
            .unwrap();
        // Both shards start their own sequence.
        assert_eq!(s1, s2);
        assert_eq!(
            store
                .resume_token_for(&ShardId::new("s2"), &s2)
                .await
                .unwrap(),
            Some(token)
        );
    }

    #[tokio::test]
    async fn unknown_watermark_maps_to_none() {
        let store = MemoryStore::new();
        assert_eq!(
            store
                .resume_token_for(&ShardId::new("s1"), &Watermark::new("nope"))
                .await
                .unwrap(),
            None
        );
    }
}
