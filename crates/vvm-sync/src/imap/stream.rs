//! Byte streams under an IMAP session.
//!
//! The connection only needs something it can read from and write to, so
//! the socket is opened through a [`StreamOpener`]. Production code uses
//! [`TcpOpener`] (TCP plus native TLS); tests hand in in-memory pipes.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// A bidirectional byte stream an async-imap client can run over.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug> ImapStream for T {}

/// Opens sockets and upgrades them to TLS.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// Connects to `host:port`, negotiating TLS right away if `implicit_tls`.
    async fn open(&self, host: &str, port: u16, implicit_tls: bool)
        -> SyncResult<Box<dyn ImapStream>>;

    /// Runs a TLS handshake over an already open stream (STARTTLS).
    async fn start_tls(
        &self,
        stream: Box<dyn ImapStream>,
        host: &str,
    ) -> SyncResult<Box<dyn ImapStream>>;
}

/// TCP sockets with native TLS.
#[derive(Debug, Clone)]
pub struct TcpOpener {
    connect_timeout: Duration,
}

impl TcpOpener {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpOpener { connect_timeout }
    }
}

impl Default for TcpOpener {
    fn default() -> Self {
        TcpOpener::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl StreamOpener for TcpOpener {
    async fn open(
        &self,
        host: &str,
        port: u16,
        implicit_tls: bool,
    ) -> SyncResult<Box<dyn ImapStream>> {
        debug!(host = %host, port, implicit_tls, "Opening IMAP socket");

        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                SyncError::ConnectionFailed(format!(
                    "connect to {}:{} timed out after {}s",
                    host,
                    port,
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| SyncError::ConnectionFailed(format!("{}:{}: {}", host, port, e)))?;

        let stream: Box<dyn ImapStream> = Box::new(tcp);
        if implicit_tls {
            self.start_tls(stream, host).await
        } else {
            Ok(stream)
        }
    }

    async fn start_tls(
        &self,
        stream: Box<dyn ImapStream>,
        host: &str,
    ) -> SyncResult<Box<dyn ImapStream>> {
        let connector = tokio_native_tls::TlsConnector::from(native_tls::TlsConnector::new()?);
        let tls = connector
            .connect(host, stream)
            .await
            .map_err(|e| SyncError::TlsError(format!("TLS handshake failed: {}", e)))?;
        debug!(host = %host, "TLS established");
        Ok(Box::new(tls))
    }
}
