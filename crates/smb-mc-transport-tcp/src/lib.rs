// # TCP Channel Transport
//
// This crate opens SMB channels as plain TCP connections for the
// multichannel connection manager.
//
// ## Responsibilities
//
// - One connect attempt per request, bounded by a timeout
// - Binding to the client NIC's local address when one is known
// - Holding the open stream until the engine asks for teardown
//
// The transport never retries and never decides which channels exist.
// Session setup on top of the stream belongs to the session layer.
//
// ## Usage
//
// ```rust,ignore
// use smb_mc_core::PluginRegistry;
//
// let registry = PluginRegistry::with_builtins();
// smb_mc_transport_tcp::register(&registry);
// let transport = registry.create_transport(&config.transport)?;
// ```

use async_trait::async_trait;
use smb_mc_core::config::TransportConfig;
use smb_mc_core::traits::{ConnectRequest, Transport, TransportFactory, TransportHandle};
use smb_mc_core::{Error, PluginRegistry, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// TCP transport
///
/// Streams are owned here and referenced by [`TransportHandle`]. Dropping
/// a stream closes the connection.
pub struct TcpTransport {
    connect_timeout: Duration,
    next_handle: AtomicU64,
    streams: Mutex<HashMap<TransportHandle, TcpStream>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            next_handle: AtomicU64::new(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Number of open channels
    pub async fn open_channels(&self) -> usize {
        self.streams.lock().await.len()
    }

    async fn open(&self, request: &ConnectRequest) -> Result<TcpStream> {
        let server = request.server_address;
        let Some(local) = request.local_address.filter(|a| !a.ip().is_unspecified()) else {
            return Ok(TcpStream::connect(server).await?);
        };

        let socket = match server {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(local.ip(), 0)).map_err(|e| {
            Error::transport(format!("cannot bind {} for {}: {}", local.ip(), request.pair, e))
        })?;
        Ok(socket.connect(server).await?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, request: &ConnectRequest) -> Result<TransportHandle> {
        debug!(
            "Opening TCP channel {} to {} (local {:?})",
            request.pair, request.server_address, request.local_address
        );

        let stream = tokio::time::timeout(self.connect_timeout, self.open(request))
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "connect to {} timed out after {:?}",
                    request.server_address, self.connect_timeout
                ))
            })?
            .map_err(|e| match e {
                Error::Network(io) => Error::transport(format!(
                    "connect to {} failed: {}",
                    request.server_address, io
                )),
                other => other,
            })?;

        // Channels carry small latency-sensitive requests
        stream.set_nodelay(true)?;

        let handle = TransportHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.streams.lock().await.insert(handle, stream);
        info!("TCP channel {} up as {}", request.pair, handle);
        Ok(handle)
    }

    async fn disconnect(&self, handle: TransportHandle) -> Result<()> {
        match self.streams.lock().await.remove(&handle) {
            Some(stream) => {
                drop(stream);
                debug!("Closed {}", handle);
            }
            None => debug!("{} already closed", handle),
        }
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

/// Factory for creating TCP transports
pub struct TcpTransportFactory;

impl TransportFactory for TcpTransportFactory {
    fn create(&self, config: &TransportConfig) -> Result<Box<dyn Transport>> {
        match config {
            TransportConfig::Tcp {
                connect_timeout_ms, ..
            } => {
                if *connect_timeout_ms == 0 {
                    return Err(Error::config("TCP connect timeout must be > 0"));
                }
                Ok(Box::new(TcpTransport::new(Duration::from_millis(
                    *connect_timeout_ms,
                ))))
            }
            _ => Err(Error::config("Invalid config for TCP transport")),
        }
    }
}

/// Register the TCP transport with a plugin registry
pub fn register(registry: &PluginRegistry) {
    registry.register_transport("tcp", Box::new(TcpTransportFactory));
}
