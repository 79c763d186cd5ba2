//! Per-replica collection metadata

use crate::Channel;
use vespid_protocol::{CollectionSchema, LoadKind, Timestamp, UniqueId};

#[derive(Debug, Default)]
struct CollectionState {
    load_kind: LoadKind,
    v_channels: Vec<Channel>,
    p_channels: Vec<Channel>,
    v_delta_channels: Vec<Channel>,
    p_delta_channels: Vec<Channel>,
    /// Timestamp of the release request once the collection is being torn
    /// down; reads younger than this must not be served
    release_ts: Timestamp,
}

/// A collection as one replica sees it: schema plus the channel lists the
/// node is attached to. One instance exists per replica per collection id.
///
/// Invariant: `p_channels[i]` is the physical channel of `v_channels[i]`
/// and neither list contains duplicates (the delta lists likewise).
#[derive(Debug)]
pub struct Collection {
    id: UniqueId,
    schema: Option<CollectionSchema>,
    state: parking_lot::RwLock<CollectionState>,
}

impl Collection {
    pub fn new(id: UniqueId, schema: Option<CollectionSchema>) -> Self {
        Self {
            id,
            schema,
            state: parking_lot::RwLock::new(CollectionState::default()),
        }
    }

    pub fn id(&self) -> UniqueId {
        self.id
    }

    pub fn schema(&self) -> Option<&CollectionSchema> {
        self.schema.as_ref()
    }

    pub fn load_kind(&self) -> LoadKind {
        self.state.read().load_kind
    }

    pub fn set_load_kind(&self, kind: LoadKind) {
        self.state.write().load_kind = kind;
    }

    pub fn release_ts(&self) -> Timestamp {
        self.state.read().release_ts
    }

    pub fn set_release_ts(&self, ts: Timestamp) {
        self.state.write().release_ts = ts;
    }

    pub fn v_channels(&self) -> Vec<Channel> {
        self.state.read().v_channels.clone()
    }

    pub fn p_channels(&self) -> Vec<Channel> {
        self.state.read().p_channels.clone()
    }

    pub fn v_delta_channels(&self) -> Vec<Channel> {
        self.state.read().v_delta_channels.clone()
    }

    pub fn p_delta_channels(&self) -> Vec<Channel> {
        self.state.read().p_delta_channels.clone()
    }

    pub fn add_v_channels(&self, channels: &[Channel]) {
        let mut state = self.state.write();
        for c in channels {
            if !state.v_channels.contains(c) {
                state.v_channels.push(c.clone());
            }
        }
    }

    pub fn add_p_channels(&self, channels: &[Channel]) {
        let mut state = self.state.write();
        for c in channels {
            if !state.p_channels.contains(c) {
                state.p_channels.push(c.clone());
            }
        }
    }

    pub fn add_v_delta_channels(&self, channels: &[Channel]) {
        let mut state = self.state.write();
        for c in channels {
            if !state.v_delta_channels.contains(c) {
                state.v_delta_channels.push(c.clone());
            }
        }
    }

    pub fn add_p_delta_channels(&self, channels: &[Channel]) {
        let mut state = self.state.write();
        for c in channels {
            if !state.p_delta_channels.contains(c) {
                state.p_delta_channels.push(c.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_lists_dedup() {
        let col = Collection::new(1, None);
        col.add_v_channels(&["a".to_string(), "b".to_string()]);
        col.add_v_channels(&["b".to_string(), "c".to_string()]);
        assert_eq!(col.v_channels(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_load_kind() {
        let col = Collection::new(1, None);
        assert_eq!(col.load_kind(), LoadKind::Unknown);
        col.set_load_kind(LoadKind::Collection);
        assert_eq!(col.load_kind(), LoadKind::Collection);
    }

    #[test]
    fn test_release_ts() {
        let col = Collection::new(1, None);
        assert_eq!(col.release_ts(), 0);
        col.set_release_ts(1234);
        assert_eq!(col.release_ts(), 1234);
    }
}
