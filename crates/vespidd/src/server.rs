use crate::handler::RequestHandler;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use vespid_core::{Config, MsgBus, QueryNode};
use vespid_protocol::{Request, Response, MAX_MESSAGE_SIZE};

/// Vespid query-node server
pub struct Server {
    node: Arc<QueryNode>,
    listener: Option<TcpListener>,
}

impl Server {
    /// Create a new server with the given configuration and bus client
    pub async fn new(config: Config, bus: Arc<dyn MsgBus>) -> anyhow::Result<Self> {
        // Pre-bind the listener so we can report the actual address
        let addr = config.server_address();
        let listener = TcpListener::bind(&addr).await?;

        let node = QueryNode::new(config, bus);

        Ok(Self {
            node,
            listener: Some(listener),
        })
    }

    /// The query node this server fronts
    pub fn node(&self) -> &Arc<QueryNode> {
        &self.node
    }

    /// Get the local address the server is bound to
    ///
    /// Useful for tests where port 0 is used for random port selection.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotConnected, "Server not bound")
            })
            .and_then(|l| l.local_addr())
    }

    /// Start the server
    pub async fn start(mut self) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("Server already started"))?;

        let addr = listener.local_addr()?;
        info!("Starting Vespid query node on {}", addr);

        let handler = Arc::new(RequestHandler::new(self.node.clone()));

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("New connection from {}", addr);
                    let handler = handler.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler).await {
                            error!("Error handling connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Handle a single coordinator connection
async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<RequestHandler>,
) -> anyhow::Result<()> {
    let mut buffer = BytesMut::with_capacity(8192);

    loop {
        // Read length prefix (4 bytes)
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                info!("Coordinator disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let msg_len = u32::from_be_bytes(len_buf) as usize;

        if msg_len > MAX_MESSAGE_SIZE {
            warn!("Message too large: {} bytes", msg_len);
            return Ok(());
        }

        // Read message data
        buffer.clear();
        buffer.resize(msg_len, 0);
        stream.read_exact(&mut buffer).await?;

        // Deserialize request
        let request = match Request::from_bytes(&buffer) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to deserialize request: {}", e);
                continue;
            }
        };

        let response = handler.handle(request).await;

        let payload = match response.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize response: {}", e);
                Response::Error {
                    message: "internal serialization error".to_string(),
                }
                .to_bytes()?
            }
        };

        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
    }
}
