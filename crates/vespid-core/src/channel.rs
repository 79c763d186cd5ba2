//! Deterministic channel-name functions.
//!
//! Every *virtual* channel name (one per shard, e.g. `vespid-dml_0_100v0`)
//! maps to a *physical* channel on the shared bus (`vespid-dml_0`) by
//! stripping the per-virtual suffix after the last `'_'`. DML and delta
//! channels for the same shard differ only by their configured root prefix.

use crate::error::{Error, Result};
use vespid_protocol::UniqueId;

/// Physical channel for a virtual channel name.
///
/// Strips the suffix after the last `'_'`; a name without one is its own
/// physical channel.
pub fn physical(vchannel: &str) -> String {
    match vchannel.rfind('_') {
        Some(idx) => vchannel[..idx].to_string(),
        None => vchannel.to_string(),
    }
}

/// Substitute `from_root` with `to_root` in a channel name (first occurrence).
///
/// Used to pair a delta channel with its DML channel and vice versa.
pub fn convert_channel(channel: &str, from_root: &str, to_root: &str) -> Result<String> {
    if from_root.is_empty() {
        return Err(Error::InvalidChannelName(
            channel.to_string(),
            "empty source root".to_string(),
        ));
    }
    if !channel.contains(from_root) {
        return Err(Error::InvalidChannelName(
            channel.to_string(),
            format!("does not contain root '{}'", from_root),
        ));
    }
    Ok(channel.replacen(from_root, to_root, 1))
}

/// Subscription-group name this node uses on the bus for a collection
pub fn sub_name(prefix: &str, collection_id: UniqueId, node_id: i64) -> String {
    format!("{}-{}-{}", prefix, collection_id, node_id)
}
