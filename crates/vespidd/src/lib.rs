//! Vespid query-node daemon library
//!
//! Exposes the pieces `main.rs` and the integration tests assemble: CLI
//! parsing, the request handler, and the TCP server.

pub mod cli;
pub mod handler;
pub mod server;

pub use cli::Cli;
pub use handler::RequestHandler;
pub use server::Server;
