//! Per-channel time-safety watermarks.
//!
//! A tSafe entry is a monotonically non-decreasing timestamp per channel:
//! reads at `ts <= tsafe(channel)` are visible. Entries are created and
//! removed in lockstep with the channel's flow graph; interested parties
//! (query shards) observe advancement through a watch subscription.

use crate::error::{Error, Result};
use crate::Channel;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;
use vespid_protocol::Timestamp;

/// Registry of tSafe watermarks, one per watched channel
#[derive(Debug, Default)]
pub struct TSafeReplica {
    entries: parking_lot::RwLock<HashMap<Channel, watch::Sender<Timestamp>>>,
}

impl TSafeReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a channel. Re-adding an existing channel keeps
    /// the current watermark.
    pub fn add_tsafe(&self, channel: &str) {
        let mut entries = self.entries.write();
        entries.entry(channel.to_string()).or_insert_with(|| {
            debug!(channel, "tSafe entry created");
            watch::channel(0).0
        });
    }

    /// Drop the entry for a channel; removing a missing entry is a no-op
    pub fn remove_tsafe(&self, channel: &str) {
        if self.entries.write().remove(channel).is_some() {
            debug!(channel, "tSafe entry removed");
        }
    }

    pub fn has_tsafe(&self, channel: &str) -> bool {
        self.entries.read().contains_key(channel)
    }

    /// Current watermark for a channel
    pub fn get_tsafe(&self, channel: &str) -> Result<Timestamp> {
        let entries = self.entries.read();
        entries
            .get(channel)
            .map(|tx| *tx.borrow())
            .ok_or_else(|| Error::TSafeNotFound(channel.to_string()))
    }

    /// Advance a channel's watermark. Regressions are ignored so the
    /// watermark stays monotonic.
    pub fn set_tsafe(&self, channel: &str, ts: Timestamp) -> Result<()> {
        let entries = self.entries.read();
        let tx = entries
            .get(channel)
            .ok_or_else(|| Error::TSafeNotFound(channel.to_string()))?;
        tx.send_if_modified(|current| {
            if ts > *current {
                *current = ts;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Subscribe to a channel's watermark advancement
    pub fn watch_tsafe(&self, channel: &str) -> Result<watch::Receiver<Timestamp>> {
        let entries = self.entries.read();
        entries
            .get(channel)
            .map(|tx| tx.subscribe())
            .ok_or_else(|| Error::TSafeNotFound(channel.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let replica = TSafeReplica::new();
        assert!(replica.get_tsafe("ch").is_err());

        replica.add_tsafe("ch");
        assert!(replica.has_tsafe("ch"));
        assert_eq!(replica.get_tsafe("ch").unwrap(), 0);

        replica.remove_tsafe("ch");
        assert!(!replica.has_tsafe("ch"));
        // double remove is a no-op
        replica.remove_tsafe("ch");
    }

    #[test]
    fn test_monotonic_watermark() {
        let replica = TSafeReplica::new();
        replica.add_tsafe("ch");

        replica.set_tsafe("ch", 100).unwrap();
        assert_eq!(replica.get_tsafe("ch").unwrap(), 100);

        // regressions are ignored
        replica.set_tsafe("ch", 50).unwrap();
        assert_eq!(replica.get_tsafe("ch").unwrap(), 100);

        replica.set_tsafe("ch", 150).unwrap();
        assert_eq!(replica.get_tsafe("ch").unwrap(), 150);
    }

    #[test]
    fn test_readd_keeps_watermark() {
        let replica = TSafeReplica::new();
        replica.add_tsafe("ch");
        replica.set_tsafe("ch", 42).unwrap();

        replica.add_tsafe("ch");
        assert_eq!(replica.get_tsafe("ch").unwrap(), 42);
    }

    #[tokio::test]
    async fn test_watch_observes_advancement() {
        let replica = TSafeReplica::new();
        replica.add_tsafe("ch");

        let mut rx = replica.watch_tsafe("ch").unwrap();
        replica.set_tsafe("ch", 7).unwrap();

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 7);
    }
}
