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

//! The session gateway.
//!
//! A *session* is one downstream client replicating one shard. The
//! gateway runs each session as two halves joined by a bounded queue:
//!
//! - the **pump** pulls events from the [`ChangeSource`], translates them,
//!   persists the pending watermark, and pushes wire messages into the
//!   queue; a slow client fills the queue and backpressure pauses the
//!   upstream pull
//! - the **drain** moves messages from the queue to the transport while
//!   listening for client acknowledgement frames, persisting the
//!   acknowledged watermark as it advances
//!
//! One session per shard: establishing a session for a shard that already
//! has one takes the shard over, closing the older session. The client
//! that reconnects after a network blip must not find its shard wedged
//! behind a half-dead predecessor.
//!
//! The pending watermark is persisted *before* its messages are handed to
//! the transport, and the acknowledged watermark only advances on explicit
//! client acks, so a crash between the two replays the unacknowledged
//! tail instead of losing it.

use crate::protocol::{ClientFrame, WireMessage, PROTOCOL_VERSION};
use crate::source::{ChangeSource, SourceError};
use crate::translator::{Translated, Translator};
use crate::watermark::{ShardCheckpoint, ShardId, Watermark, WatermarkError, WatermarkStore};
use crate::mapping::MappingRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// Errors establishing or running a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session request did not carry a shard id.
    #[error("session request is missing the shardID parameter")]
    MissingShardId,

    /// The client asked for a protocol version this build does not speak.
    #[error("unsupported protocol version {requested} (supported: {PROTOCOL_VERSION})")]
    UnsupportedProtocolVersion {
        /// Version the client requested
        requested: u32,
    },

    /// A malformed session parameter.
    #[error("invalid session parameter {name}: {value}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Rejected value
        value: String,
    },

    /// The client supplied a resume watermark this store never issued.
    #[error("unknown resume watermark {watermark}")]
    UnknownResumeWatermark {
        /// The unresolvable watermark
        watermark: Watermark,
    },

    /// Watermark store failure; fatal to the session.
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    /// Upstream source failure that reconnection could not absorb.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The downstream transport failed.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Parameters of a session establishment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Shard the client replicates
    pub shard: ShardId,
    /// Protocol version the client speaks
    pub version: u32,
    /// Explicit resume point: the last watermark the client applied.
    /// `None` falls back to the shard's persisted checkpoint.
    pub last_watermark: Option<Watermark>,
}

impl SessionParams {
    /// Creates params for the current protocol version with no explicit
    /// resume point.
    #[must_use]
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            version: PROTOCOL_VERSION,
            last_watermark: None,
        }
    }

    /// Parses an establishment query string such as
    /// `"shardID=s1&version=1&lastWatermark=00000000000000000042"`.
    ///
    /// `shardID` is required; `version` defaults to the current protocol
    /// version and is rejected when unsupported; `lastWatermark` is
    /// optional.
    ///
    /// # Errors
    ///
    /// `MissingShardId`, `InvalidParameter`, or
    /// `UnsupportedProtocolVersion`.
    pub fn from_query_str(query: &str) -> Result<Self, SessionError> {
        let mut shard = None;
        let mut version = None;
        let mut last_watermark = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            match name {
                "shardID" => {
                    if value.is_empty() {
                        return Err(SessionError::MissingShardId);
                    }
                    shard = Some(ShardId::new(value));
                }
                "lastWatermark" => {
                    if !value.is_empty() {
                        last_watermark = Some(Watermark::new(value));
                    }
                }
                "version" => {
                    let parsed: u32 =
                        value.parse().map_err(|_| SessionError::InvalidParameter {
                            name: name.to_string(),
                            value: value.to_string(),
                        })?;
                    version = Some(parsed);
                }
                // Unknown parameters are ignored for forward compatibility.
                _ => debug!(name, "ignoring unknown session parameter"),
            }
        }

        let shard = shard.ok_or(SessionError::MissingShardId)?;
        let version = version.unwrap_or(PROTOCOL_VERSION);
        if version != PROTOCOL_VERSION {
            return Err(SessionError::UnsupportedProtocolVersion { requested: version });
        }
        Ok(Self {
            shard,
            version,
            last_watermark,
        })
    }
}

/// Outbound half of a session transport.
#[async_trait::async_trait]
pub trait MessageSink: Send {
    /// Sends one wire message to the client.
    async fn send(&mut self, message: WireMessage) -> Result<(), SessionError>;
}

/// Inbound half of a session transport.
#[async_trait::async_trait]
pub trait FrameSource: Send {
    /// Receives the next client frame; `Ok(None)` means the client closed
    /// the connection.
    async fn next_frame(&mut self) -> Result<Option<ClientFrame>, SessionError>;
}

/// In-process transport endpoints over tokio channels, for tests and for
/// embedding the gateway behind an arbitrary server.
pub mod channel_transport {
    use super::{ClientFrame, FrameSource, MessageSink, SessionError, WireMessage};
    use tokio::sync::mpsc;

    /// Sink half backed by an mpsc sender.
    pub struct ChannelSink {
        tx: mpsc::Sender<WireMessage>,
    }

    /// Frame half backed by an mpsc receiver.
    pub struct ChannelFrames {
        rx: mpsc::Receiver<ClientFrame>,
    }

    /// Builds a connected transport: the gateway writes into the returned
    /// sink and the test reads from the message receiver; frames flow the
    /// other way.
    #[must_use]
    pub fn pair(
        capacity: usize,
    ) -> (
        ChannelSink,
        mpsc::Receiver<WireMessage>,
        mpsc::Sender<ClientFrame>,
        ChannelFrames,
    ) {
        let (msg_tx, msg_rx) = mpsc::channel(capacity);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        (
            ChannelSink { tx: msg_tx },
            msg_rx,
            frame_tx,
            ChannelFrames { rx: frame_rx },
        )
    }

    #[async_trait::async_trait]
    impl MessageSink for ChannelSink {
        async fn send(&mut self, message: WireMessage) -> Result<(), SessionError> {
            self.tx
                .send(message)
                .await
                .map_err(|_| SessionError::Transport("client receiver dropped".to_string()))
        }
    }

    #[async_trait::async_trait]
    impl FrameSource for ChannelFrames {
        async fn next_frame(&mut self) -> Result<Option<ClientFrame>, SessionError> {
            Ok(self.rx.recv().await)
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The upstream feed ended cleanly.
    SourceEnded,
    /// The upstream feed was invalidated.
    Invalidated {
        /// Collection whose feed was invalidated
        collection: String,
    },
    /// The client closed the connection.
    ClientClosed,
    /// A newer session took the shard over.
    Takeover,
}

/// Final accounting for a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Shard the session served
    pub shard: ShardId,
    /// Why the session ended
    pub close_reason: CloseReason,
    /// Wire messages delivered to the transport
    pub messages_sent: u64,
    /// Last watermark the client acknowledged
    pub last_acknowledged: Option<Watermark>,
}

/// Session gateway configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Logical schema stamped on relation metadata.
    pub schema: String,
    /// Capacity of the pump-to-drain queue; when full, upstream pulling
    /// pauses.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            queue_capacity: 256,
        }
    }
}

enum PumpEnd {
    SourceEnded,
    Invalidated { collection: String },
    ReceiverGone,
    Failed(SessionError),
}

/// Serves replication sessions over a shared mapping registry and
/// watermark store.
pub struct SessionGateway {
    registry: Arc<MappingRegistry>,
    store: Arc<dyn WatermarkStore>,
    config: SessionConfig,
    active: Mutex<HashMap<ShardId, (u64, broadcast::Sender<()>)>>,
    next_session_id: AtomicU64,
}

impl SessionGateway {
    /// Creates a gateway.
    pub fn new(
        registry: Arc<MappingRegistry>,
        store: Arc<dyn WatermarkStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            active: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Resolves the resume token the upstream cursor for `shard` should
    /// start after, from the shard's acknowledged checkpoint.
    ///
    /// # Errors
    ///
    /// Watermark store failures.
    pub async fn starting_position(
        &self,
        shard: &ShardId,
    ) -> Result<Option<crate::watermark::ResumeToken>, WatermarkError> {
        let translator = Translator::new(
            shard.clone(),
            self.config.schema.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
        );
        translator.starting_position().await
    }

    /// Resolves the resume token for a session request.
    ///
    /// An explicit `lastWatermark` parameter takes precedence over the
    /// persisted checkpoint; supplying a watermark the store never issued
    /// is a session error, because resuming from an unverifiable position
    /// could silently skip events.
    ///
    /// # Errors
    ///
    /// `UnknownResumeWatermark` or watermark store failures.
    pub async fn resume_position(
        &self,
        params: &SessionParams,
    ) -> Result<Option<crate::watermark::ResumeToken>, SessionError> {
        if let Some(watermark) = &params.last_watermark {
            return match self.store.resume_token_for(&params.shard, watermark).await? {
                Some(token) => Ok(Some(token)),
                None => Err(SessionError::UnknownResumeWatermark {
                    watermark: watermark.clone(),
                }),
            };
        }
        Ok(self.starting_position(&params.shard).await?)
    }

    /// Runs one session to completion.
    ///
    /// The source must already be positioned (see [`Self::starting_position`]).
    /// Returns when the source ends, the feed is invalidated, the client
    /// disconnects, or another session takes the shard over.
    ///
    /// # Errors
    ///
    /// Store, source, and transport failures tear the session down.
    pub async fn run_session<S, F>(
        &self,
        params: SessionParams,
        source: Box<dyn ChangeSource>,
        mut sink: S,
        mut frames: F,
    ) -> Result<SessionSummary, SessionError>
    where
        S: MessageSink,
        F: FrameSource,
    {
        let shard = params.shard.clone();
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut takeover_rx = self.claim_shard(&shard, session_id).await;
        info!(shard = %shard, session_id, "session established");

        let checkpoint = Arc::new(Mutex::new(
            self.store.load_checkpoint(&shard).await?.unwrap_or_default(),
        ));

        let translator = Translator::new(
            shard.clone(),
            self.config.schema.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
        );
        let (queue_tx, mut queue_rx) = mpsc::channel::<WireMessage>(self.config.queue_capacity);
        let mut pump = tokio::spawn(pump_loop(
            source,
            translator,
            shard.clone(),
            Arc::clone(&self.store),
            Arc::clone(&checkpoint),
            queue_tx,
        ));

        let mut messages_sent: u64 = 0;
        let result = loop {
            tokio::select! {
                queued = queue_rx.recv() => match queued {
                    Some(message) => {
                        if let Err(err) = sink.send(message).await {
                            pump.abort();
                            break Err(err);
                        }
                        messages_sent += 1;
                    }
                    // Queue drained and pump finished; its end state is the
                    // session outcome.
                    None => break match pump.await {
                        Ok(PumpEnd::SourceEnded) => Ok(CloseReason::SourceEnded),
                        Ok(PumpEnd::Invalidated { collection }) => {
                            Ok(CloseReason::Invalidated { collection })
                        }
                        Ok(PumpEnd::ReceiverGone) | Err(_) => Ok(CloseReason::ClientClosed),
                        Ok(PumpEnd::Failed(err)) => Err(err),
                    },
                },
                frame = frames.next_frame() => match frame {
                    Ok(Some(ClientFrame::Ack { watermark })) => {
                        if let Err(err) = self
                            .record_ack(&shard, &watermark, &checkpoint)
                            .await
                        {
                            pump.abort();
                            break Err(err.into());
                        }
                    }
                    Ok(None) => {
                        pump.abort();
                        break Ok(CloseReason::ClientClosed);
                    }
                    Err(err) => {
                        pump.abort();
                        break Err(err);
                    }
                },
                _ = takeover_rx.recv() => {
                    warn!(shard = %shard, session_id, "shard taken over by a newer session");
                    pump.abort();
                    break Ok(CloseReason::Takeover);
                }
            }
        };

        self.release_shard(&shard, session_id).await;
        let last_acknowledged = checkpoint.lock().await.last_acknowledged.clone();
        let close_reason = result?;
        info!(
            shard = %shard,
            session_id,
            messages_sent,
            ?close_reason,
            "session closed"
        );
        Ok(SessionSummary {
            shard,
            close_reason,
            messages_sent,
            last_acknowledged,
        })
    }

    async fn claim_shard(&self, shard: &ShardId, session_id: u64) -> broadcast::Receiver<()> {
        let mut active = self.active.lock().await;
        if let Some((old_id, existing)) = active.get(shard) {
            debug!(shard = %shard, old_session = old_id, "taking over shard");
            let _ = existing.send(());
        }
        let (tx, rx) = broadcast::channel(1);
        active.insert(shard.clone(), (session_id, tx));
        rx
    }

    async fn release_shard(&self, shard: &ShardId, session_id: u64) {
        let mut active = self.active.lock().await;
        // A successor may have replaced the entry already.
        if active.get(shard).is_some_and(|(id, _)| *id == session_id) {
            active.remove(shard);
        }
    }

    async fn record_ack(
        &self,
        shard: &ShardId,
        watermark: &Watermark,
        checkpoint: &Arc<Mutex<ShardCheckpoint>>,
    ) -> Result<(), WatermarkError> {
        let mut cp = checkpoint.lock().await;
        if cp
            .last_acknowledged
            .as_ref()
            .is_some_and(|current| watermark <= current)
        {
            warn!(shard = %shard, %watermark, "ignoring stale acknowledgement");
            return Ok(());
        }
        cp.last_acknowledged = Some(watermark.clone());
        self.store.save_checkpoint(shard, &cp).await
    }
}

async fn pump_loop(
    mut source: Box<dyn ChangeSource>,
    mut translator: Translator,
    shard: ShardId,
    store: Arc<dyn WatermarkStore>,
    checkpoint: Arc<Mutex<ShardCheckpoint>>,
    queue: mpsc::Sender<WireMessage>,
) -> PumpEnd {
    let end = loop {
        match source.next_event().await {
            Ok(Some(event)) => match translator.translate(&event).await {
                Ok(Translated::Batch(batch)) => {
                    // Persist the pending position before any message of the
                    // batch can reach the transport.
                    {
                        let mut cp = checkpoint.lock().await;
                        cp.last_pending = Some(batch.watermark.clone());
                        if let Err(err) = store.save_checkpoint(&shard, &cp).await {
                            break PumpEnd::Failed(err.into());
                        }
                    }
                    let mut gone = false;
                    for message in batch.messages {
                        if queue.send(message).await.is_err() {
                            gone = true;
                            break;
                        }
                    }
                    if gone {
                        break PumpEnd::ReceiverGone;
                    }
                }
                Ok(Translated::Skipped) => {}
                Ok(Translated::Invalidated { collection }) => {
                    break PumpEnd::Invalidated { collection };
                }
                Err(err) => break PumpEnd::Failed(err.into()),
            },
            Ok(None) => break PumpEnd::SourceEnded,
            Err(err) => break PumpEnd::Failed(err.into()),
        }
    };
    source.close().await;
    end
}
