//! Message-bus collaborator interface.
//!
//! Flow graphs and query channels consume the bus through [`MsgBus`] /
//! [`BusConsumer`]; the broker itself is an external system. [`MemoryBus`]
//! is the in-process implementation backing tests and single-process runs.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use vespid_protocol::{Position, Timestamp};

/// One message as observed on a bus channel
#[derive(Debug, Clone)]
pub struct BusPacket {
    pub channel: String,
    pub msg_id: Bytes,
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

/// Where a new subscription starts consuming
#[derive(Debug, Clone)]
pub enum SubscribeFrom {
    /// Only messages published after the subscription
    Latest,
    /// Seek: replay everything after the position's timestamp, then live
    Position(Position),
}

/// A single-channel subscription handle
#[async_trait]
pub trait BusConsumer: Send {
    /// Next packet, or `None` once the channel is gone
    async fn recv(&mut self) -> Option<BusPacket>;

    /// Channel this consumer is attached to
    fn channel(&self) -> &str;

    /// Subscription-group name
    fn group(&self) -> &str;
}

/// Message-bus client boundary
#[async_trait]
pub trait MsgBus: Send + Sync {
    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
        from: SubscribeFrom,
    ) -> Result<Box<dyn BusConsumer>>;
}

const CHANNEL_BUFFER: usize = 1024;

struct ChannelState {
    /// Retained messages, in publish order, for seek replay
    history: Vec<BusPacket>,
    live: broadcast::Sender<BusPacket>,
}

impl ChannelState {
    fn new() -> Self {
        let (live, _) = broadcast::channel(CHANNEL_BUFFER);
        Self {
            history: Vec::new(),
            live,
        }
    }
}

/// In-process message bus.
///
/// Channels are created on first touch (publish or subscribe). Seek replays
/// the retained history strictly after the given position's timestamp.
#[derive(Default)]
pub struct MemoryBus {
    channels: parking_lot::Mutex<HashMap<String, ChannelState>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a packet to a channel
    pub fn publish(&self, channel: &str, msg_id: Bytes, timestamp: Timestamp, payload: Bytes) {
        let mut channels = self.channels.lock();
        let state = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelState::new);
        let packet = BusPacket {
            channel: channel.to_string(),
            msg_id,
            timestamp,
            payload,
        };
        state.history.push(packet.clone());
        // no receivers yet is fine, the history retains the packet
        let _ = state.live.send(packet);
    }

    /// Number of retained packets on a channel (test introspection)
    pub fn retained(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|s| s.history.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MsgBus for MemoryBus {
    async fn subscribe(
        &self,
        channel: &str,
        group: &str,
        from: SubscribeFrom,
    ) -> Result<Box<dyn BusConsumer>> {
        // snapshot + subscribe under one lock so no packet lands between them
        let mut channels = self.channels.lock();
        let state = channels
            .entry(channel.to_string())
            .or_insert_with(ChannelState::new);

        let backlog: VecDeque<BusPacket> = match &from {
            SubscribeFrom::Latest => VecDeque::new(),
            SubscribeFrom::Position(pos) => state
                .history
                .iter()
                .filter(|p| p.timestamp > pos.timestamp)
                .cloned()
                .collect(),
        };
        let rx = state.live.subscribe();

        Ok(Box::new(MemoryConsumer {
            channel: channel.to_string(),
            group: group.to_string(),
            backlog,
            rx,
        }))
    }
}

struct MemoryConsumer {
    channel: String,
    group: String,
    backlog: VecDeque<BusPacket>,
    rx: broadcast::Receiver<BusPacket>,
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<BusPacket> {
        if let Some(packet) = self.backlog.pop_front() {
            return Some(packet);
        }
        loop {
            match self.rx.recv().await {
                Ok(packet) => return Some(packet),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        channel = %self.channel,
                        group = %self.group,
                        skipped,
                        "bus consumer lagged, messages skipped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn channel(&self) -> &str {
        &self.channel
    }

    fn group(&self) -> &str {
        &self.group
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}
