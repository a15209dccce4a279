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

//! Watermark store backends for the Tributary bridge.
//!
//! Backends implement the
//! [`WatermarkStore`](tributary_core::watermark::WatermarkStore) trait:
//!
//! - **Redis** (`redis-store` feature): shared minting across bridge
//!   instances, converging through atomic `SET NX`
//! - **SQLite** (`sqlite-store` feature): durable single-process minting
//!   in one database file
//! - **Memory**: always available; real minting, no durability
//!
//! [`build_store`] picks a backend from the bridge configuration.
//!
//! # Example
//!
//! ```rust
//! use tributary_core::watermark::{ResumeToken, ShardId, WatermarkStore};
//! use tributary_stores::memory::MemoryStore;
//!
//! # async fn example() -> Result<(), tributary_core::watermark::WatermarkError> {
//! let store = MemoryStore::new();
//! let mark = store
//!     .get_or_create_watermark(&ShardId::new("s1"), &ResumeToken::new("826B"))
//!     .await?;
//! assert_eq!(mark.as_str(), "00000000000000000001");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;
#[cfg(feature = "sqlite-store")]
pub mod sqlite;

use std::sync::Arc;
use tributary_core::config::WatermarkBackend;
use tributary_core::watermark::{PassthroughWatermarks, WatermarkError, WatermarkStore};

/// Builds the watermark store a bridge configuration asks for.
///
/// # Errors
///
/// Backend initialization failures, or a configuration selecting a
/// backend this build was compiled without.
pub async fn build_store(
    backend: &WatermarkBackend,
) -> Result<Arc<dyn WatermarkStore>, WatermarkError> {
    match backend {
        WatermarkBackend::Passthrough => Ok(Arc::new(PassthroughWatermarks::new())),

        #[cfg(feature = "redis-store")]
        WatermarkBackend::Redis { url, key_prefix } => {
            let config = redis::RedisConfig::builder()
                .url(url.clone())
                .key_prefix(key_prefix.clone())
                .build()?;
            Ok(Arc::new(redis::RedisStore::new(config).await?))
        }
        #[cfg(not(feature = "redis-store"))]
        WatermarkBackend::Redis { .. } => Err(WatermarkError::backend_msg(
            "redis backend requested but the redis-store feature is disabled",
        )),

        #[cfg(feature = "sqlite-store")]
        WatermarkBackend::Sqlite { path } => Ok(Arc::new(sqlite::SqliteStore::open(path)?)),
        #[cfg(not(feature = "sqlite-store"))]
        WatermarkBackend::Sqlite { .. } => Err(WatermarkError::backend_msg(
            "sqlite backend requested but the sqlite-store feature is disabled",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_backend_builds() {
        let store = build_store(&WatermarkBackend::Passthrough).await;
        assert!(store.is_ok());
    }

    #[cfg(feature = "sqlite-store")]
    #[tokio::test]
    async fn sqlite_backend_builds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wm.db");
        let backend = WatermarkBackend::Sqlite {
            path: path.to_string_lossy().into_owned(),
        };
        assert!(build_store(&backend).await.is_ok());
    }
}
