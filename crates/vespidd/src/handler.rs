//! Request dispatch: one wire request in, one response out.
//!
//! Every control-plane request is handed to the node, which wraps it in a
//! task, pushes it through the queue and reports the outcome; the handler
//! only translates that outcome onto the wire.

use std::sync::Arc;
use tracing::debug;
use vespid_core::QueryNode;
use vespid_protocol::{Request, Response};

/// Handles incoming requests
pub struct RequestHandler {
    node: Arc<QueryNode>,
}

impl RequestHandler {
    pub fn new(node: Arc<QueryNode>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<QueryNode> {
        &self.node
    }

    /// Process a single request
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,

            Request::Status => Response::Status {
                node_id: self.node.config().node_id,
                streaming_collections: self.node.streaming().collection_count() as u64,
                historical_collections: self.node.historical().collection_count() as u64,
            },

            Request::AddQueryChannel(req) => {
                debug!(collection_id = req.collection_id, "AddQueryChannel received");
                self.outcome(self.node.add_query_channel(req).await)
            }

            Request::WatchDmChannels(req) => {
                debug!(collection_id = req.collection_id, "WatchDmChannels received");
                self.outcome(self.node.watch_dm_channels(req).await)
            }

            Request::WatchDeltaChannels(req) => {
                debug!(collection_id = req.collection_id, "WatchDeltaChannels received");
                self.outcome(self.node.watch_delta_channels(req).await)
            }

            Request::LoadSegments(req) => {
                debug!(collection_id = req.collection_id, "LoadSegments received");
                self.outcome(self.node.load_segments(req).await)
            }

            Request::ReleaseCollection(req) => {
                debug!(collection_id = req.collection_id, "ReleaseCollection received");
                self.outcome(self.node.release_collection(req).await)
            }

            Request::ReleasePartitions(req) => {
                debug!(collection_id = req.collection_id, "ReleasePartitions received");
                self.outcome(self.node.release_partitions(req).await)
            }
        }
    }

    fn outcome(&self, result: vespid_core::Result<()>) -> Response {
        match result {
            Ok(()) => Response::Ok,
            Err(err) => Response::Error {
                message: err.to_string(),
            },
        }
    }
}
