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

//! Redis store tests against a live server.
//!
//! Run with a local Redis and `cargo test -- --ignored`. Each test uses
//! its own key prefix so runs do not interfere.

#![cfg(feature = "redis-store")]

use std::sync::Arc;
use tributary_core::watermark::{
    ResumeToken, ShardCheckpoint, ShardId, Watermark, WatermarkStore,
};
use tributary_stores::redis::{RedisConfig, RedisStore};

const REDIS_URL: &str = "redis://localhost:6379";

async fn store(prefix: &str) -> RedisStore {
    let config = RedisConfig::builder()
        .url(REDIS_URL)
        .key_prefix(format!("tributary-test-{prefix}"))
        .build()
        .unwrap();
    RedisStore::new(config).await.expect("redis must be running")
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn minting_is_idempotent() {
    let store = store("idempotent").await;
    let shard = ShardId::new("s1");
    let token = ResumeToken::new("tok-a");

    let first = store.get_or_create_watermark(&shard, &token).await.unwrap();
    let second = store.get_or_create_watermark(&shard, &token).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn distinct_tokens_mint_increasing_watermarks() {
    let store = store("ordering").await;
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
#[ignore = "requires a running Redis server"]
async fn reverse_mapping_round_trips() {
    let store = store("reverse").await;
    let shard = ShardId::new("s1");
    let token = ResumeToken::new("tok-a");

    let mark = store.get_or_create_watermark(&shard, &token).await.unwrap();
    assert_eq!(
        store.resume_token_for(&shard, &mark).await.unwrap(),
        Some(token)
    );
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn concurrent_minting_converges() {
    let store = Arc::new(store("race").await);
    let shard = ShardId::new("s1");
    let token = ResumeToken::new("contended");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        let shard = shard.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            store.get_or_create_watermark(&shard, &token).await.unwrap()
        }));
    }

    let mut marks = Vec::new();
    for handle in handles {
        marks.push(handle.await.unwrap());
    }
    let first = marks[0].clone();
    assert!(marks.iter().all(|m| *m == first));

    // The winning watermark resolves back to the token; any losing
    // candidates were cleaned up.
    assert_eq!(
        store.resume_token_for(&shard, &first).await.unwrap(),
        Some(token)
    );
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn checkpoints_round_trip() {
    let store = store("checkpoint").await;
    let shard = ShardId::new("s1");

    let cp = ShardCheckpoint {
        last_pending: Some(Watermark::from_sequence(9)),
        last_acknowledged: Some(Watermark::from_sequence(7)),
    };
    store.save_checkpoint(&shard, &cp).await.unwrap();
    assert_eq!(store.load_checkpoint(&shard).await.unwrap(), Some(cp));
}
