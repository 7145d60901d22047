//! PostgreSQL connection implementation.
//!
//! This module provides the physical connection that handles:
//! - Transport establishment through a [`Connector`]
//! - SSL negotiation
//! - Startup and authentication
//! - Framed message send/receive
//! - Out-of-band cancellation
//!
//! Once started, a [`Connection`] is usually [split](Connection::split) into a
//! [`MessageSink`] for writing and a [`MessageStream`] that yields decoded
//! backend messages in arrival order from a dedicated reader task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::auth::{AuthStep, Authenticator};
use crate::config::{PgConfig, SslMode};
use crate::error::{DbError, PgError, PgResult};
use crate::frame::FrameDecoder;
use crate::protocol::{BackendMessage, FrontendMessage, TransactionStatus};
use crate::transport::{BoxTransport, Connector};

/// Size of each read from the transport.
const READ_CHUNK: usize = 16 * 1024;

/// Decoded messages buffered between the reader task and its consumer.
const STREAM_CAPACITY: usize = 256;

// ============================================================================
// Connection
// ============================================================================

/// Process id and secret key that authorize a CancelRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// A started PostgreSQL connection.
pub struct Connection {
    reader: ReadHalf<BoxTransport>,
    writer: WriteHalf<BoxTransport>,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
    write_buf: BytesMut,
    config: Arc<PgConfig>,
    connector: Arc<dyn Connector>,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    backend_key: Option<BackendKey>,
    transaction_status: TransactionStatus,
}

impl Connection {
    /// Connect and run the startup handshake.
    ///
    /// `config.connect_timeout` bounds the whole sequence: transport connect,
    /// SSL negotiation, authentication and the first ReadyForQuery.
    pub async fn connect(config: Arc<PgConfig>, connector: Arc<dyn Connector>) -> PgResult<Self> {
        match config.connect_timeout {
            Some(limit) => {
                tokio::time::timeout(limit, Self::establish(Arc::clone(&config), connector))
                    .await
                    .map_err(|_| {
                        PgError::Timeout(format!(
                            "connecting to {}:{} took longer than {:?}",
                            config.host, config.port, limit
                        ))
                    })?
            }
            None => Self::establish(config, connector).await,
        }
    }

    async fn establish(config: Arc<PgConfig>, connector: Arc<dyn Connector>) -> PgResult<Self> {
        let stream = open_transport(&config, connector.as_ref()).await?;
        let (reader, writer) = tokio::io::split(stream);

        let mut conn = Self {
            reader,
            writer,
            decoder: FrameDecoder::new(config.max_frame_len),
            scratch: vec![0u8; READ_CHUNK],
            write_buf: BytesMut::with_capacity(8 * 1024),
            config,
            connector,
            parameters: HashMap::new(),
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
        };

        conn.startup().await?;
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self) -> PgResult<()> {
        let startup = FrontendMessage::Startup {
            user: self.config.user.clone(),
            database: Some(self.config.database.clone()),
            options: self.config.startup_options(),
        };
        self.send(&startup).await?;

        let mut auth = Authenticator::new(&self.config);
        let mut authenticated = false;

        loop {
            let msg = self.recv().await?;

            match msg {
                BackendMessage::AuthenticationOk
                | BackendMessage::AuthenticationCleartextPassword
                | BackendMessage::AuthenticationMD5Password { .. }
                | BackendMessage::AuthenticationSASL { .. }
                | BackendMessage::AuthenticationSASLContinue { .. }
                | BackendMessage::AuthenticationSASLFinal { .. }
                | BackendMessage::AuthenticationUnsupported { .. } => match auth.handle(msg)? {
                    AuthStep::Respond(reply) => self.send(&reply).await?,
                    AuthStep::Continue => {}
                    AuthStep::Done => {
                        debug!(user = %self.config.user, "authenticated");
                        authenticated = true;
                    }
                },
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_key = Some(BackendKey {
                        process_id,
                        secret_key,
                    });
                }
                BackendMessage::ReadyForQuery { status } => {
                    if !authenticated {
                        return Err(PgError::Protocol(
                            "ReadyForQuery before authentication completed".to_string(),
                        ));
                    }
                    self.transaction_status = status;
                    debug!(
                        host = %self.config.host,
                        port = self.config.port,
                        pid = self.backend_key.map(|k| k.process_id),
                        "connection ready"
                    );
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    let db = DbError::from_fields(&fields);
                    return Err(if db.is_auth_failure() {
                        PgError::Auth(db.to_string())
                    } else {
                        PgError::Server(db)
                    });
                }
                BackendMessage::NoticeResponse { fields } => {
                    let notice = DbError::from_fields(&fields);
                    warn!(code = %notice.code, "startup notice: {}", notice.message);
                }
                BackendMessage::Unknown { tag, .. } => {
                    trace!(tag = %(tag as char), "ignoring unknown message during startup");
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "Unexpected {} during startup",
                        other.name()
                    )));
                }
            }
        }
    }

    /// Buffer a frontend message without flushing (for pipelining).
    #[inline]
    pub fn buffer(&mut self, msg: &FrontendMessage) {
        msg.encode_to(&mut self.write_buf);
    }

    /// Flush buffered messages.
    pub async fn flush(&mut self) -> PgResult<()> {
        write_out(&mut self.writer, &mut self.write_buf).await
    }

    /// Send a frontend message (with flush).
    pub async fn send(&mut self, msg: &FrontendMessage) -> PgResult<()> {
        self.buffer(msg);
        self.flush().await
    }

    /// Receive the next backend message.
    pub async fn recv(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return BackendMessage::decode(frame.tag, frame.payload);
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                return Err(unexpected_eof());
            }

            if let Some(frame) = self.decoder.feed(&self.scratch[..n]).next() {
                let frame = frame?;
                return BackendMessage::decode(frame.tag, frame.payload);
            }
        }
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn config(&self) -> &Arc<PgConfig> {
        &self.config
    }

    /// A handle that can cancel whatever this connection is running.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.backend_key.map(|key| CancelToken {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            key,
        })
    }

    /// Send Terminate and drop the transport.
    pub async fn close(mut self) -> PgResult<()> {
        self.send(&FrontendMessage::Terminate).await?;
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Split into a writer and a reader task that decodes backend messages.
    pub fn split(self) -> (ConnectionInfo, MessageSink, MessageStream) {
        let info = ConnectionInfo {
            cancel: self.cancel_token(),
            parameters: self.parameters,
            backend_key: self.backend_key,
            transaction_status: self.transaction_status,
        };

        let sink = MessageSink {
            writer: self.writer,
            buf: self.write_buf,
        };

        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let task = tokio::spawn(read_loop(self.reader, self.decoder, self.scratch, tx));

        (info, sink, MessageStream { rx, task })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("backend_key", &self.backend_key)
            .field("transaction_status", &self.transaction_status)
            .finish()
    }
}

/// State captured from startup when a connection is split.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub parameters: HashMap<String, String>,
    pub backend_key: Option<BackendKey>,
    pub transaction_status: TransactionStatus,
    pub cancel: Option<CancelToken>,
}

// ============================================================================
// Split halves
// ============================================================================

/// Write half of a split connection.
pub struct MessageSink {
    writer: WriteHalf<BoxTransport>,
    buf: BytesMut,
}

impl MessageSink {
    #[inline]
    pub fn buffer(&mut self, msg: &FrontendMessage) {
        msg.encode_to(&mut self.buf);
    }

    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    pub async fn flush(&mut self) -> PgResult<()> {
        write_out(&mut self.writer, &mut self.buf).await
    }

    pub async fn send(&mut self, msg: &FrontendMessage) -> PgResult<()> {
        self.buffer(msg);
        self.flush().await
    }

    pub async fn shutdown(&mut self) -> PgResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Ordered stream of backend messages from a split connection.
///
/// After an error is yielded the stream is finished; further calls report
/// [`PgError::ConnectionClosed`].
pub struct MessageStream {
    rx: mpsc::Receiver<PgResult<BackendMessage>>,
    task: JoinHandle<()>,
}

impl MessageStream {
    pub async fn recv(&mut self) -> PgResult<BackendMessage> {
        match self.rx.recv().await {
            Some(msg) => msg,
            None => Err(PgError::ConnectionClosed),
        }
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxTransport>,
    mut decoder: FrameDecoder,
    mut scratch: Vec<u8>,
    tx: mpsc::Sender<PgResult<BackendMessage>>,
) {
    // Frames already buffered during startup go first
    loop {
        match decoder.next_frame() {
            Ok(Some(frame)) => {
                let msg = BackendMessage::decode(frame.tag, frame.payload);
                let failed = msg.is_err();
                if tx.send(msg).await.is_err() || failed {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    loop {
        let n = match reader.read(&mut scratch).await {
            Ok(0) => {
                let _ = tx.send(Err(unexpected_eof())).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        for frame in decoder.feed(&scratch[..n]) {
            let msg = frame.and_then(|f| BackendMessage::decode(f.tag, f.payload));
            let failed = msg.is_err();
            if tx.send(msg).await.is_err() || failed {
                return;
            }
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cancels the running query of one backend from a separate connection.
#[derive(Clone)]
pub struct CancelToken {
    config: Arc<PgConfig>,
    connector: Arc<dyn Connector>,
    key: BackendKey,
}

impl CancelToken {
    /// Open a short-lived transport and send a CancelRequest.
    ///
    /// Completion only means the request was written; the server gives no
    /// answer and may ignore it.
    pub async fn cancel(&self) -> PgResult<()> {
        let mut stream = open_transport(&self.config, self.connector.as_ref()).await?;
        let msg = FrontendMessage::CancelRequest {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        };
        stream.write_all(&msg.encode()).await?;
        stream.flush().await?;
        let _ = stream.shutdown().await;
        debug!(pid = self.key.process_id, "cancel request sent");
        Ok(())
    }

    pub fn backend_key(&self) -> BackendKey {
        self.key
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("process_id", &self.key.process_id)
            .finish()
    }
}

// ============================================================================
// Private helpers
// ============================================================================

/// Connect a transport and negotiate SSL if configured.
async fn open_transport(config: &PgConfig, connector: &dyn Connector) -> PgResult<BoxTransport> {
    let mut stream = connector.connect(config).await.map_err(|e| {
        PgError::Connection(format!(
            "could not connect to {}:{}: {}",
            config.host, config.port, e
        ))
    })?;

    if config.ssl == SslMode::Disable {
        return Ok(stream);
    }

    stream.write_all(&FrontendMessage::SslRequest.encode()).await?;
    stream.flush().await?;

    let mut answer = [0u8; 1];
    stream
        .read_exact(&mut answer)
        .await
        .map_err(|e| PgError::Connection(format!("SSL negotiation failed: {}", e)))?;

    match answer[0] {
        b'S' => {
            debug!(host = %config.host, "server accepted SSL");
            connector
                .upgrade_tls(stream, config)
                .await
                .map_err(|e| PgError::Connection(format!("TLS upgrade failed: {}", e)))
        }
        b'N' if config.ssl == SslMode::Require => Err(PgError::Connection(
            "The server does not support SSL connections".to_string(),
        )),
        b'N' => {
            debug!(host = %config.host, "server declined SSL, continuing without it");
            Ok(stream)
        }
        other => Err(PgError::Connection(format!(
            "There was an error establishing an SSL connection (server answered {:?})",
            other as char
        ))),
    }
}

async fn write_out(writer: &mut WriteHalf<BoxTransport>, buf: &mut BytesMut) -> PgResult<()> {
    if buf.is_empty() {
        return Ok(());
    }
    writer.write_all(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}

fn unexpected_eof() -> PgError {
    PgError::Connection("Connection terminated unexpectedly".to_string())
}
