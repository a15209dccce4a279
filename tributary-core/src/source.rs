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

//! Upstream change feed sources.
//!
//! [`ChangeSource`] is the seam between the session pipeline and the
//! upstream database: an async pull of normalized [`ChangeEvent`]s. The
//! production implementation, [`MongoChangeSource`], wraps a MongoDB
//! change stream cursor with automatic reconnection:
//!
//! 1. classify the cursor error; transient codes and retry labels are
//!    retryable, everything else is fatal
//! 2. back off exponentially with jitter, capped at `max_backoff_ms`
//! 3. reopen the cursor with `resume_after` set to the last delivered
//!    token, so no events are lost or duplicated across the reconnect
//! 4. give up after `max_reconnect_attempts` attempts
//!
//! A stale resume token (server code 286, the oplog no longer covers the
//! token) is not retryable: the bridge cannot resume without missing
//! events, and the session must fail loudly instead.
//!
//! [`ScriptedSource`] feeds tests a canned sequence of events and errors.

use crate::event::{ChangeEvent, ConversionError};
use crate::watermark::ResumeToken;
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::{
    change_stream::{event::ChangeStreamEvent, ChangeStream},
    error::{Error as MongoError, ErrorKind as MongoErrorKind},
    options::{ChangeStreamOptions, FullDocumentType},
    Database,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Errors from the upstream change feed.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Upstream connection or cursor error, possibly retryable.
    #[error("upstream error: {message}")]
    Upstream {
        /// Human-readable error message
        message: String,
        /// The underlying driver error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Server error code, when present
        code: Option<i32>,
        /// Server error labels
        labels: Vec<String>,
    },

    /// An event could not be normalized.
    #[error("event conversion failed: {0}")]
    Conversion(#[from] ConversionError),

    /// The resume token no longer falls inside the retained oplog window
    /// (server code 286). Resuming would silently miss events.
    #[error("stale resume token (code {code}): oplog no longer covers it")]
    StaleResumeToken {
        /// The server code that identified the condition
        code: i32,
    },

    /// Reconnection gave up after the configured number of attempts.
    #[error("max reconnect attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    /// Invalid source configuration.
    #[error("source configuration error: {0}")]
    Configuration(String),
}

impl SourceError {
    /// Classifies a driver error into the source taxonomy.
    #[must_use]
    pub fn from_mongo_error(err: MongoError) -> Self {
        let code = match err.kind.as_ref() {
            MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
            _ => None,
        };

        if code == Some(286) {
            return Self::StaleResumeToken { code: 286 };
        }

        let labels: Vec<String> = err.labels().iter().cloned().collect();
        Self::Upstream {
            message: err.to_string(),
            source: Some(Box::new(err)),
            code,
            labels,
        }
    }

    /// Whether reconnecting with the last token can recover from this
    /// error.
    ///
    /// Retry labels take precedence; otherwise the transient server codes
    /// (network, failover, cursor-not-found) are retryable and everything
    /// else is fatal.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { code, labels, .. } => {
                if labels.iter().any(|l| {
                    l == "RetryableWriteError"
                        || l == "TransientTransactionError"
                        || l == "NetworkError"
                }) {
                    return true;
                }
                code.is_some_and(|c| {
                    matches!(
                        c,
                        // Network errors
                        6 |     // HostUnreachable
                        7 |     // HostNotFound
                        89 |    // NetworkTimeout
                        91 |    // ShutdownInProgress
                        // Replica set failover
                        10107 | // NotPrimary
                        11600 | // InterruptedAtShutdown
                        11602 | // InterruptedDueToReplStateChange
                        13435 | // NotPrimaryNoSecondaryOk
                        13436 | // NotPrimaryOrSecondary
                        // Cursor lost, safe to resume with the token
                        43 // CursorNotFound
                    )
                })
            }
            Self::Conversion(_)
            | Self::StaleResumeToken { .. }
            | Self::MaxReconnectAttemptsExceeded(_)
            | Self::Configuration(_) => false,
        }
    }
}

/// A pull-based feed of normalized change events.
///
/// `next_event` returning `Ok(None)` means the feed ended cleanly.
/// Invalidate events are delivered like any other so the caller decides
/// how to wind the session down.
#[async_trait::async_trait]
pub trait ChangeSource: Send {
    /// Pulls the next event, reconnecting internally where the
    /// implementation supports it.
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SourceError>;

    /// Releases the underlying cursor or connection.
    async fn close(&mut self);
}

/// Configuration for [`MongoChangeSource`].
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Collections to watch. Empty means the whole database.
    pub collections: Vec<String>,

    /// Token to resume after, from the watermark store.
    pub resume_after: Option<ResumeToken>,

    /// Initial reconnect backoff in milliseconds.
    pub initial_backoff_ms: u64,

    /// Backoff cap in milliseconds.
    pub max_backoff_ms: u64,

    /// Reconnect attempts before giving up (0 = infinite).
    pub max_reconnect_attempts: u32,

    /// Cursor batch size.
    pub batch_size: Option<u32>,

    /// Jitter factor in `[0.0, 1.0]` applied to each backoff.
    pub backoff_jitter: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            resume_after: None,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 5,
            batch_size: None,
            backoff_jitter: 0.1,
        }
    }
}

impl SourceConfig {
    /// Validates backoff parameters.
    ///
    /// # Errors
    ///
    /// `Configuration` when the backoff window is empty or the jitter
    /// factor falls outside `[0.0, 1.0]`.
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.initial_backoff_ms == 0 {
            return Err(SourceError::Configuration(
                "initial_backoff_ms must be greater than 0".to_string(),
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(SourceError::Configuration(format!(
                "initial_backoff_ms ({}) must be <= max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(SourceError::Configuration(format!(
                "backoff_jitter ({}) must be between 0.0 and 1.0",
                self.backoff_jitter
            )));
        }
        Ok(())
    }

    /// Exponential backoff with jitter for the given attempt (1-based).
    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(32))
            .min(self.max_backoff_ms);

        if self.backoff_jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.backoff_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis(((base_ms as f64) + jitter).max(0.0) as u64)
        } else {
            Duration::from_millis(base_ms)
        }
    }

    fn to_mongo_options(&self, resume_after: Option<&ResumeToken>) -> ChangeStreamOptions {
        let mut options = ChangeStreamOptions::default();
        // Updates must carry the full post-image so mapped rows are
        // complete without a read-back.
        options.full_document = Some(FullDocumentType::UpdateLookup);
        options.batch_size = self.batch_size;

        if let Some(token) = resume_after {
            let token_doc = token.to_document();
            if let Ok(bytes) = bson::to_vec(&token_doc) {
                if let Ok(resume_token) = bson::from_slice(&bytes) {
                    options.resume_after = Some(resume_token);
                }
            }
        }
        options
    }

    fn watch_pipeline(&self) -> Vec<Document> {
        if self.collections.is_empty() {
            Vec::new()
        } else {
            vec![doc! { "$match": { "ns.coll": { "$in": self.collections.clone() } } }]
        }
    }
}

type RawStream = ChangeStream<ChangeStreamEvent<Document>>;

/// Change feed over a MongoDB database, filtered to the mapped
/// collections, with automatic resume-token reconnection.
pub struct MongoChangeSource {
    database: Database,
    config: SourceConfig,
    stream: Option<RawStream>,
    /// Token of the last event handed to the caller; reconnects resume
    /// after it.
    last_token: Option<ResumeToken>,
}

impl MongoChangeSource {
    /// Opens the change stream cursor.
    ///
    /// # Errors
    ///
    /// Configuration validation failures and driver errors opening the
    /// cursor.
    pub async fn open(database: Database, config: SourceConfig) -> Result<Self, SourceError> {
        config.validate()?;
        info!(
            database = database.name(),
            collections = ?config.collections,
            resuming = config.resume_after.is_some(),
            "opening change stream"
        );

        let stream = Self::open_stream(&database, &config, config.resume_after.as_ref()).await?;
        let last_token = config.resume_after.clone();
        Ok(Self {
            database,
            config,
            stream: Some(stream),
            last_token,
        })
    }

    async fn open_stream(
        database: &Database,
        config: &SourceConfig,
        resume_after: Option<&ResumeToken>,
    ) -> Result<RawStream, SourceError> {
        let options = config.to_mongo_options(resume_after);
        let pipeline = config.watch_pipeline();
        let result = if pipeline.is_empty() {
            database.watch().with_options(options).await
        } else {
            database.watch().pipeline(pipeline).with_options(options).await
        };
        result.map_err(SourceError::from_mongo_error)
    }

    async fn reconnect(&mut self) -> Result<(), SourceError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if self.config.max_reconnect_attempts > 0
                && attempt > self.config.max_reconnect_attempts
            {
                error!(attempts = attempt - 1, "giving up on reconnection");
                return Err(SourceError::MaxReconnectAttemptsExceeded(
                    self.config.max_reconnect_attempts,
                ));
            }

            let backoff = self.config.calculate_backoff(attempt);
            warn!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "reconnecting change stream"
            );
            tokio::time::sleep(backoff).await;

            match Self::open_stream(&self.database, &self.config, self.last_token.as_ref()).await
            {
                Ok(stream) => {
                    info!(attempt, "change stream reconnected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait::async_trait]
impl ChangeSource for MongoChangeSource {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SourceError> {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return Ok(None);
            };
            match stream.next().await {
                Some(Ok(raw)) => {
                    let event = ChangeEvent::try_from(raw)?;
                    debug!(
                        operation = %event.operation,
                        collection = event.collection(),
                        "change event"
                    );
                    self.last_token = Some(event.resume_token.clone());
                    return Ok(Some(event));
                }
                Some(Err(err)) => {
                    let err = SourceError::from_mongo_error(err);
                    if err.is_retryable() {
                        warn!(error = %err, "retryable cursor error");
                        self.reconnect().await?;
                    } else {
                        error!(error = %err, "fatal cursor error");
                        self.stream = None;
                        return Err(err);
                    }
                }
                None => {
                    warn!("change stream ended");
                    self.stream = None;
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        info!("closing change stream");
        self.stream = None;
    }
}

/// A canned source for tests: yields a scripted sequence of events and
/// errors, then ends.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<Result<ChangeEvent, SourceError>>,
    hang_at_end: bool,
}

impl ScriptedSource {
    /// Builds a source that yields the given outcomes in order.
    #[must_use]
    pub fn new(script: Vec<Result<ChangeEvent, SourceError>>) -> Self {
        Self {
            script: script.into(),
            hang_at_end: false,
        }
    }

    /// Builds a source that yields the given events and then ends.
    #[must_use]
    pub fn from_events(events: Vec<ChangeEvent>) -> Self {
        Self::new(events.into_iter().map(Ok).collect())
    }

    /// Builds a source that yields the given events and then blocks
    /// forever, mimicking a quiet upstream.
    #[must_use]
    pub fn hanging(events: Vec<ChangeEvent>) -> Self {
        Self {
            script: events.into_iter().map(Ok).collect(),
            hang_at_end: true,
        }
    }
}

#[async_trait::async_trait]
impl ChangeSource for ScriptedSource {
    async fn next_event(&mut self) -> Result<Option<ChangeEvent>, SourceError> {
        match self.script.pop_front() {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(err)) => Err(err),
            None if self.hang_at_end => futures::future::pending().await,
            None => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.script.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Namespace, OperationType};
    use chrono::Utc;

    #[test]
    fn default_config_is_valid() {
        assert!(SourceConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_initial_backoff_rejected() {
        let config = SourceConfig {
            initial_backoff_ms: 0,
            ..SourceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SourceError::Configuration(_))
        ));
    }

    #[test]
    fn inverted_backoff_window_rejected() {
        let config = SourceConfig {
            initial_backoff_ms: 60_000,
            max_backoff_ms: 1_000,
            ..SourceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_is_capped() {
        let config = SourceConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_jitter: 0.0,
            ..SourceConfig::default()
        };
        assert_eq!(config.calculate_backoff(1), Duration::from_millis(100));
        assert_eq!(config.calculate_backoff(2), Duration::from_millis(200));
        assert_eq!(config.calculate_backoff(10), Duration::from_millis(1_000));
    }

    #[test]
    fn transient_codes_are_retryable() {
        for code in [6, 7, 43, 89, 91, 10107, 11600, 11602, 13435, 13436] {
            let err = SourceError::Upstream {
                message: "transient".to_string(),
                source: None,
                code: Some(code),
                labels: vec![],
            };
            assert!(err.is_retryable(), "code {code} should be retryable");
        }
    }

    #[test]
    fn stale_token_is_fatal() {
        let err = SourceError::StaleResumeToken { code: 286 };
        assert!(!err.is_retryable());
    }

    #[test]
    fn retry_labels_override_missing_code() {
        let err = SourceError::Upstream {
            message: "network".to_string(),
            source: None,
            code: None,
            labels: vec!["NetworkError".to_string()],
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn watch_pipeline_filters_collections() {
        let config = SourceConfig {
            collections: vec!["rooms".to_string(), "users".to_string()],
            ..SourceConfig::default()
        };
        let pipeline = config.watch_pipeline();
        assert_eq!(pipeline.len(), 1);
        assert!(pipeline[0].get_document("$match").is_ok());
    }

    #[tokio::test]
    async fn scripted_source_replays_in_order() {
        let ev = ChangeEvent {
            operation: OperationType::Insert,
            namespace: Namespace::new("app", "rooms"),
            document_key: Some(bson::doc! { "_id": 1 }),
            full_document: Some(bson::doc! { "_id": 1 }),
            update_description: None,
            cluster_time: Utc::now(),
            resume_token: ResumeToken::new("t1"),
        };
        let mut source = ScriptedSource::new(vec![
            Ok(ev.clone()),
            Err(SourceError::StaleResumeToken { code: 286 }),
        ]);

        assert_eq!(source.next_event().await.unwrap(), Some(ev));
        assert!(source.next_event().await.is_err());
        assert_eq!(source.next_event().await.unwrap(), None);
    }
}
