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

//! SQLite-backed watermark store for single-process deployments.
//!
//! State lives in one key/value table; minting runs inside an immediate
//! transaction, so the check-then-assign sequence is atomic against other
//! connections to the same file. Calls hop to the blocking thread pool
//! because rusqlite is synchronous.
//!
//! # Key Pattern
//!
//! ```text
//! wm/{shard}/token/{token}   forward mapping
//! wm/{shard}/mark/{mark}     reverse mapping
//! wm/{shard}/seq             counter
//! checkpoint/{shard}         JSON ShardCheckpoint
//! ```

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use tributary_core::watermark::{
    ResumeToken, ShardCheckpoint, ShardId, Watermark, WatermarkError, WatermarkStore,
};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS tributary_kv (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID";

/// Watermark store backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (and initializes, if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// File and schema initialization failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WatermarkError> {
        let conn = Connection::open(path.as_ref()).map_err(WatermarkError::backend)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(WatermarkError::backend)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(WatermarkError::backend)?;
        conn.execute(CREATE_TABLE, [])
            .map_err(WatermarkError::backend)?;
        debug!(path = %path.as_ref().display(), "opened SQLite watermark store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Schema initialization failures.
    pub fn in_memory() -> Result<Self, WatermarkError> {
        let conn = Connection::open_in_memory().map_err(WatermarkError::backend)?;
        conn.execute(CREATE_TABLE, [])
            .map_err(WatermarkError::backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, WatermarkError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| WatermarkError::backend_msg("connection mutex poisoned"))?;
            f(&mut guard).map_err(WatermarkError::backend)
        })
        .await
        .map_err(|e| WatermarkError::backend_msg(format!("blocking task failed: {e}")))?
    }
}

fn forward_key(shard: &ShardId, token: &ResumeToken) -> String {
    format!("wm/{shard}/token/{token}")
}

fn reverse_key(shard: &ShardId, watermark: &Watermark) -> String {
    format!("wm/{shard}/mark/{watermark}")
}

fn seq_key(shard: &ShardId) -> String {
    format!("wm/{shard}/seq")
}

fn checkpoint_key(shard: &ShardId) -> String {
    format!("checkpoint/{shard}")
}

fn get(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM tributary_kv WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

fn put(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO tributary_kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

#[async_trait]
impl WatermarkStore for SqliteStore {
    async fn get_or_create_watermark(
        &self,
        shard: &ShardId,
        token: &ResumeToken,
    ) -> Result<Watermark, WatermarkError> {
        let fwd = forward_key(shard, token);
        let seq = seq_key(shard);
        let shard = shard.clone();
        let token = token.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) = get(&tx, &fwd)? {
                return Ok(Watermark::new(existing));
            }

            let next: u64 = get(&tx, &seq)?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
                + 1;
            let minted = Watermark::from_sequence(next);

            put(&tx, &seq, &next.to_string())?;
            put(&tx, &fwd, minted.as_str())?;
            put(&tx, &reverse_key(&shard, &minted), token.as_str())?;
            tx.commit()?;
            Ok(minted)
        })
        .await
    }

    async fn resume_token_for(
        &self,
        shard: &ShardId,
        watermark: &Watermark,
    ) -> Result<Option<ResumeToken>, WatermarkError> {
        let key = reverse_key(shard, watermark);
        self.with_conn(move |conn| Ok(get(conn, &key)?.map(ResumeToken::new)))
            .await
    }

    async fn load_checkpoint(
        &self,
        shard: &ShardId,
    ) -> Result<Option<ShardCheckpoint>, WatermarkError> {
        let key = checkpoint_key(shard);
        let json = self.with_conn(move |conn| get(conn, &key)).await?;
        json.map(|value| {
            serde_json::from_str(&value).map_err(|e| WatermarkError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn save_checkpoint(
        &self,
        shard: &ShardId,
        checkpoint: &ShardCheckpoint,
    ) -> Result<(), WatermarkError> {
        let key = checkpoint_key(shard);
        let json = serde_json::to_string(checkpoint)
            .map_err(|e| WatermarkError::Serialization(e.to_string()))?;
        self.with_conn(move |conn| put(conn, &key, &json)).await
    }

    async fn close(&self) -> Result<(), WatermarkError> {
        // The connection closes when the last clone drops; WAL recovery
        // handles anything unflushed.
        Ok(())
    }
}
