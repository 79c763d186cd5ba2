use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a Vespid query node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Cluster-unique node id assigned at registration
    pub node_id: i64,

    /// Prefix for message-bus subscription names generated by this node
    pub sub_name_prefix: String,

    /// Root prefix of DML channel names
    pub dml_channel_root: String,

    /// Root prefix of delta channel names
    pub delta_channel_root: String,

    /// Capacity of the control-plane task queue
    pub task_queue_capacity: usize,

    /// Milliseconds to wait before a release starts tearing down state,
    /// letting in-flight reads drain
    pub graceful_release_ms: u64,

    /// Log level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 21123,
            node_id: 1,
            sub_name_prefix: "vespid-querynode".to_string(),
            dml_channel_root: "vespid-dml".to_string(),
            delta_channel_root: "vespid-delta".to_string(),
            task_queue_capacity: 1024,
            graceful_release_ms: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address
    pub fn with_bind_address(mut self, address: String) -> Self {
        self.bind_address = address;
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the node id
    pub fn with_node_id(mut self, node_id: i64) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the graceful release wait
    pub fn with_graceful_release_ms(mut self, ms: u64) -> Self {
        self.graceful_release_ms = ms;
        self
    }

    /// Get the server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// The graceful release wait as a [`Duration`]
    pub fn graceful_release(&self) -> Duration {
        Duration::from_millis(self.graceful_release_ms)
    }
}
