//! CLI argument parsing for the Vespid query-node daemon

use clap::Parser;
use std::net::SocketAddr;
use vespid_core::Config;

/// Vespid Query Node - control plane for a vector-search worker
///
/// Serves vector similarity reads over collections loaded onto this node
/// and enacts coordinator requests (watch channels, load segments, release)
/// against its local replicas.
#[derive(Parser, Debug)]
#[command(name = "vespidd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Server bind address
    #[arg(short, long, default_value = "127.0.0.1:21123", env = "VESPID_BIND")]
    pub bind: SocketAddr,

    /// Cluster-unique node id assigned at registration
    #[arg(short, long, default_value = "1", env = "VESPID_NODE_ID")]
    pub node_id: i64,

    /// Prefix for bus subscription names generated by this node
    #[arg(long, default_value = "vespid-querynode", env = "VESPID_SUB_NAME_PREFIX")]
    pub sub_name_prefix: String,

    /// Root prefix of DML channel names
    #[arg(long, default_value = "vespid-dml", env = "VESPID_DML_ROOT")]
    pub dml_channel_root: String,

    /// Root prefix of delta channel names
    #[arg(long, default_value = "vespid-delta", env = "VESPID_DELTA_ROOT")]
    pub delta_channel_root: String,

    /// Milliseconds a release waits for in-flight reads to drain
    #[arg(long, default_value = "1000", env = "VESPID_GRACEFUL_RELEASE_MS")]
    pub graceful_release_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    /// Validate argument combinations clap cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.node_id <= 0 {
            return Err(format!("node id must be positive, got {}", self.node_id));
        }
        if self.dml_channel_root == self.delta_channel_root {
            return Err("DML and delta channel roots must differ".to_string());
        }
        Ok(())
    }

    /// Node configuration from the parsed arguments
    pub fn to_config(&self) -> Config {
        let mut config = Config::new()
            .with_bind_address(self.bind.ip().to_string())
            .with_port(self.bind.port())
            .with_node_id(self.node_id)
            .with_graceful_release_ms(self.graceful_release_ms);
        config.sub_name_prefix = self.sub_name_prefix.clone();
        config.dml_channel_root = self.dml_channel_root.clone();
        config.delta_channel_root = self.delta_channel_root.clone();
        config.log_level = self.log_level.clone();
        config
    }
}
