//! Byte-stream transports.
//!
//! The driver never opens sockets itself. It asks a [`Connector`] for a
//! stream, and for a TLS upgrade of that stream when the server accepts an
//! SSLRequest. [`TcpConnector`] covers plain TCP; TLS needs a connector from
//! the caller.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::PgConfig;

/// Any bidirectional async byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Opens transports for a configuration.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new stream to the configured server.
    async fn connect(&self, config: &PgConfig) -> io::Result<BoxTransport>;

    /// Wrap an established stream in TLS after the server answered 'S'.
    async fn upgrade_tls(
        &self,
        _stream: BoxTransport,
        _config: &PgConfig,
    ) -> io::Result<BoxTransport> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "this connector does not support TLS",
        ))
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &PgConfig) -> io::Result<BoxTransport> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
