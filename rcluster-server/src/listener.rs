//! TCP listener and the per-connection request loop.
//!
//! One task per client connection. Requests are handled strictly one at a
//! time per connection, so replies always leave in request order; other
//! connections interleave only between requests.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use rcluster_protocol::{Reply, RequestReader};
use rcluster_shard::Cluster;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::dispatch::Dispatcher;

/// Accepts client connections and spawns a handler task per connection.
pub struct Listener {
    listener: TcpListener,
    cluster: Arc<Cluster>,
    password: Option<String>,
}

impl Listener {
    pub async fn bind(config: &ProxyConfig, cluster: Arc<Cluster>) -> io::Result<Self> {
        let listener = TcpListener::bind((config.bind.as_str(), config.port)).await?;
        info!(addr = %listener.local_addr()?, "listening for clients");
        Ok(Listener {
            listener,
            cluster,
            password: config.password.clone(),
        })
    }

    /// The bound address; useful with an ephemeral port.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            debug!(%peer, "accepted connection");
            let mut connection = Connection::new(
                socket,
                Dispatcher::new(Arc::clone(&self.cluster), self.password.clone()),
            );
            tokio::spawn(async move {
                match connection.run().await {
                    Ok(()) => debug!(%peer, "connection closed"),
                    Err(error) => debug!(%peer, error = %error, "connection dropped"),
                }
            });
        }
    }
}

struct Connection {
    socket: TcpStream,
    buffer: BytesMut,
    reader: RequestReader,
    dispatcher: Dispatcher,
}

impl Connection {
    fn new(socket: TcpStream, dispatcher: Dispatcher) -> Self {
        Connection {
            socket,
            buffer: BytesMut::with_capacity(4 * 1024),
            reader: RequestReader::new(),
            dispatcher,
        }
    }

    async fn run(&mut self) -> io::Result<()> {
        let mut out = BytesMut::new();
        loop {
            // Drain every complete request already buffered before asking
            // the socket for more.
            loop {
                match self.reader.feed(&mut self.buffer) {
                    Ok(Some(request)) => {
                        let reply = self.dispatcher.dispatch(&request).await;
                        out.clear();
                        reply.encode(&mut out);
                        self.socket.write_all(&out).await?;
                        if reply.closes_stream() {
                            self.socket.flush().await?;
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(frame_error) => {
                        // Malformed framing is fatal: report it and close.
                        let reply = Reply::error(frame_error.message()).close_after_send();
                        out.clear();
                        reply.encode(&mut out);
                        self.socket.write_all(&out).await?;
                        self.socket.flush().await?;
                        return Ok(());
                    }
                }
            }
            if self.socket.read_buf(&mut self.buffer).await? == 0 {
                // Peer hung up; any in-flight backend work has already
                // completed inside dispatch.
                return Ok(());
            }
        }
    }
}
