//! Client handle and per-connection driver task.
//!
//! A [`Client`] is a cheap front end that sends commands to a driver task.
//! The driver owns the connection: it writes requests, keeps the written
//! ones in a FIFO, and feeds every backend message to the oldest of them.
//!
//! Without pipelining a request is written only after the previous one saw
//! its ReadyForQuery. With [`PgConfig::pipeline`] requests are written as
//! soon as they arrive, each ending in its own Sync, and responses are still
//! matched strictly in write order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::PgConfig;
use crate::connection::{BackendKey, CancelToken, Connection, MessageSink, MessageStream};
use crate::cursor::{Cursor, RowStream};
use crate::error::{error_from_fields, DbError, PgError, PgResult};
use crate::protocol::{BackendMessage, FrontendMessage, Target, TransactionStatus};
use crate::query::{Accumulator, CursorBatch, InFlight, Op, Outcome, Query, Step, Until};
use crate::result::{no_columns, QueryResult, SharedColumns};
use crate::statement::{cache_key, PreparedStatement, StatementCache};
use crate::transport::{Connector, TcpConnector};
use crate::types::{ColumnDecoder, PgValue, TypeRegistry};

/// Events buffered per subscriber before old ones are dropped.
const EVENT_CAPACITY: usize = 64;

/// Asynchronous messages from the server that belong to no query.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Notice(DbError),
    /// LISTEN/NOTIFY delivery
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    /// The connection failed and is closed.
    Error(PgError),
}

// ============================================================================
// Requests
// ============================================================================

/// Work that waits its turn in the driver's queue.
enum Request {
    Simple {
        sql: String,
        types: Option<Arc<TypeRegistry>>,
        reply: oneshot::Sender<PgResult<Vec<QueryResult>>>,
    },
    Extended {
        query: Query,
        reply: oneshot::Sender<PgResult<QueryResult>>,
    },
    CopyIn {
        sql: String,
        data: Vec<Bytes>,
        reply: oneshot::Sender<PgResult<u64>>,
    },
    CopyOut {
        sql: String,
        reply: oneshot::Sender<PgResult<Vec<Bytes>>>,
    },
    CursorOpen {
        id: u64,
        query: Query,
        reply: oneshot::Sender<PgResult<SharedColumns>>,
    },
    Terminate {
        reply: Option<oneshot::Sender<()>>,
    },
}

impl Request {
    /// The caller stopped waiting (timed out or dropped the call).
    fn is_abandoned(&self) -> bool {
        match self {
            Request::Simple { reply, .. } => reply.is_closed(),
            Request::Extended { reply, .. } => reply.is_closed(),
            Request::CopyIn { reply, .. } => reply.is_closed(),
            Request::CopyOut { reply, .. } => reply.is_closed(),
            Request::CursorOpen { reply, .. } => reply.is_closed(),
            Request::Terminate { .. } => false,
        }
    }

    fn fail(self, err: PgError) {
        match self {
            Request::Simple { reply, .. } => drop(reply.send(Err(err))),
            Request::Extended { reply, .. } => drop(reply.send(Err(err))),
            Request::CopyIn { reply, .. } => drop(reply.send(Err(err))),
            Request::CopyOut { reply, .. } => drop(reply.send(Err(err))),
            Request::CursorOpen { reply, .. } => drop(reply.send(Err(err))),
            Request::Terminate { reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
        }
    }
}

enum Command {
    Request(Request),
    /// Cursor operations bypass the queue: the cursor already holds the
    /// connection.
    CursorRead {
        id: u64,
        rows: i32,
        reply: oneshot::Sender<PgResult<CursorBatch>>,
    },
    CursorClose {
        id: u64,
        reply: Option<oneshot::Sender<PgResult<()>>>,
    },
}

impl Command {
    fn fail(self, err: PgError) {
        match self {
            Command::Request(req) => req.fail(err),
            Command::CursorRead { reply, .. } => drop(reply.send(Err(err))),
            Command::CursorClose { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }
}

/// A Parse issued by an extended query that must be undone if it fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Parsed {
    Cached(String),
    Named(String),
}

// ============================================================================
// Client
// ============================================================================

/// State the driver publishes for the handle.
struct Shared {
    parameters: Mutex<HashMap<String, String>>,
    transaction_status: Mutex<TransactionStatus>,
    closed: watch::Sender<bool>,
}

/// A connection to a PostgreSQL server.
///
/// Methods take `&self`; concurrent calls are queued and run in call order.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    events: broadcast::Sender<ClientEvent>,
    config: Arc<PgConfig>,
    backend_key: Option<BackendKey>,
    cancel: Option<CancelToken>,
    next_cursor: AtomicU64,
}

impl Client {
    /// Connect over TCP.
    pub async fn connect(config: PgConfig) -> PgResult<Client> {
        Self::connect_with(Arc::new(config), Arc::new(TcpConnector)).await
    }

    /// Connect through a custom transport connector.
    pub async fn connect_with(
        config: Arc<PgConfig>,
        connector: Arc<dyn Connector>,
    ) -> PgResult<Client> {
        let conn = Connection::connect(config, connector).await?;
        Ok(Client::from_connection(conn))
    }

    /// Take over a started connection and spawn its driver task.
    pub fn from_connection(conn: Connection) -> Client {
        let config = Arc::clone(conn.config());
        let (info, sink, stream) = conn.split();

        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            parameters: Mutex::new(info.parameters),
            transaction_status: Mutex::new(info.transaction_status),
            closed,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = Driver {
            sink,
            stream,
            commands: rx,
            commands_open: true,
            shared: Arc::clone(&shared),
            events: events.clone(),
            connection_types: Arc::clone(&config.types),
            pipeline: config.pipeline,
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            held: None,
            statements: StatementCache::new(config.statement_cache_capacity),
            named: HashMap::new(),
            terminating: false,
        };
        tokio::spawn(driver.run());

        Client {
            commands: tx,
            shared,
            events,
            config,
            backend_key: info.backend_key,
            cancel: info.cancel,
            next_cursor: AtomicU64::new(1),
        }
    }

    fn submit(&self, cmd: Command) -> PgResult<()> {
        self.commands.send(cmd).map_err(|e| {
            let err = PgError::ConnectionClosed;
            e.0.fail(err.clone());
            err
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<PgResult<T>>) -> Request,
    ) -> PgResult<T> {
        self.request_within(self.config.query_timeout, make).await
    }

    /// Submit a request and wait at most `timeout` for its result. A request
    /// that times out before it is written is never sent; one already
    /// written runs to completion and its result is discarded.
    async fn request_within<T>(
        &self,
        timeout: Option<Duration>,
        make: impl FnOnce(oneshot::Sender<PgResult<T>>) -> Request,
    ) -> PgResult<T> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Request(make(tx)))?;
        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                debug!(?limit, "query timed out");
                PgError::Timeout(format!("query did not finish within {:?}", limit))
            })?,
            None => rx.await,
        };
        reply.map_err(|_| PgError::ConnectionClosed)?
    }

    /// Run one or more statements with the simple query protocol.
    ///
    /// Returns one result per statement. Values come back in text format.
    pub async fn simple_query(&self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.request(|reply| Request::Simple {
            sql: sql.to_string(),
            types: None,
            reply,
        })
        .await
    }

    /// Simple query with call-scoped decoder overrides.
    pub async fn simple_query_with_types(
        &self,
        sql: &str,
        types: TypeRegistry,
    ) -> PgResult<Vec<QueryResult>> {
        self.request(|reply| Request::Simple {
            sql: sql.to_string(),
            types: Some(Arc::new(types)),
            reply,
        })
        .await
    }

    /// Execute a query with the extended protocol.
    ///
    /// Statements are prepared once per connection and cached.
    pub async fn query(&self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.query_with(Query::new(sql).params(params.iter().cloned()))
            .await
    }

    pub async fn query_with(&self, query: Query) -> PgResult<QueryResult> {
        let timeout = query.timeout.or(self.config.query_timeout);
        self.request_within(timeout, |reply| Request::Extended { query, reply })
            .await
    }

    /// Execute a statement and return the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(sql, params).await?.rows_affected())
    }

    /// Run `COPY ... FROM STDIN`, sending `data` as the copy stream.
    pub async fn copy_in(&self, sql: &str, data: Vec<Bytes>) -> PgResult<u64> {
        self.request(|reply| Request::CopyIn {
            sql: sql.to_string(),
            data,
            reply,
        })
        .await
    }

    /// Run `COPY ... TO STDOUT` and collect the copy stream.
    pub async fn copy_out(&self, sql: &str) -> PgResult<Vec<Bytes>> {
        self.request(|reply| Request::CopyOut {
            sql: sql.to_string(),
            reply,
        })
        .await
    }

    /// Open a server-side cursor. The connection runs nothing else until
    /// the cursor is closed or fully read.
    pub async fn cursor(&self, query: impl Into<Query>) -> PgResult<Cursor<'_>> {
        Cursor::open(self, query.into()).await
    }

    /// Stream rows through a cursor, fetching `batch_size` at a time.
    pub async fn query_stream(
        &self,
        query: impl Into<Query>,
        batch_size: u32,
    ) -> PgResult<RowStream<'_>> {
        let cursor = self.cursor(query).await?;
        Ok(RowStream::new(cursor, batch_size))
    }

    pub(crate) fn next_cursor_id(&self) -> u64 {
        self.next_cursor.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn cursor_open(&self, id: u64, query: Query) -> PgResult<SharedColumns> {
        let timeout = query.timeout.or(self.config.query_timeout);
        self.request_within(timeout, |reply| Request::CursorOpen { id, query, reply })
            .await
    }

    pub(crate) async fn cursor_read(&self, id: u64, rows: u32) -> PgResult<CursorBatch> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::CursorRead {
            id,
            rows: i32::try_from(rows).unwrap_or(i32::MAX),
            reply,
        })?;
        rx.await.map_err(|_| PgError::ConnectionClosed)?
    }

    pub(crate) async fn cursor_close(&self, id: u64) -> PgResult<()> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::CursorClose {
            id,
            reply: Some(reply),
        })?;
        rx.await.map_err(|_| PgError::ConnectionClosed)?
    }

    /// Close a cursor without waiting, for `Drop`.
    pub(crate) fn cursor_close_detached(&self, id: u64) {
        let _ = self.commands.send(Command::CursorClose { id, reply: None });
    }

    /// Ask the server to cancel the running query.
    ///
    /// Best effort: the request travels on a separate connection and the
    /// server may finish the query anyway.
    pub async fn cancel(&self) -> PgResult<()> {
        match &self.cancel {
            Some(token) => token.cancel().await,
            None => Err(PgError::Usage(
                "the server sent no BackendKeyData; cancellation is unavailable".to_string(),
            )),
        }
    }

    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }

    /// Finish queued work, send Terminate and close the transport.
    pub async fn close(&self) -> PgResult<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Request(Request::Terminate { reply: Some(tx) }))
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        self.closed().await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the connection has closed, for any reason.
    pub async fn closed(&self) {
        let mut rx = self.closed_signal();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.closed.subscribe()
    }

    /// Subscribe to notices, notifications, parameter changes and errors.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn process_id(&self) -> Option<i32> {
        self.backend_key.map(|k| k.process_id)
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.backend_key
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameters.lock().get(name).cloned()
    }

    /// Get the transaction status from the latest ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        *self.shared.transaction_status.lock()
    }

    pub fn config(&self) -> &Arc<PgConfig> {
        &self.config
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("process_id", &self.process_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Driver
// ============================================================================

/// The cursor whose portal currently owns the connection.
struct HeldCursor {
    id: u64,
    portal: String,
    columns: SharedColumns,
    decoders: Arc<[ColumnDecoder]>,
    opened: bool,
}

struct Driver {
    sink: MessageSink,
    stream: MessageStream,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    shared: Arc<Shared>,
    events: broadcast::Sender<ClientEvent>,
    connection_types: Arc<TypeRegistry>,
    pipeline: bool,
    /// Requests not yet written
    queue: VecDeque<Request>,
    /// Written requests, oldest first
    in_flight: VecDeque<InFlight>,
    held: Option<HeldCursor>,
    statements: StatementCache,
    /// Named statements parsed on this connection: name → text
    named: HashMap<String, String>,
    terminating: bool,
}

/// Marks the client closed when the driver ends, including by unwinding.
struct ClosedGuard(Arc<Shared>);

impl Drop for ClosedGuard {
    fn drop(&mut self) {
        self.0.closed.send_replace(true);
    }
}

impl Driver {
    async fn run(mut self) {
        let closed = ClosedGuard(Arc::clone(&self.shared));
        let result = self.run_inner().await;

        let err = match result {
            Ok(()) => {
                debug!("connection closed");
                PgError::ConnectionClosed
            }
            Err(e) => {
                warn!(error = %e, "connection failed");
                let _ = self.events.send(ClientEvent::Error(e.clone()));
                e
            }
        };

        // Mark closed before any caller sees its failure
        drop(closed);
        self.commands.close();
        for req in self.in_flight.drain(..) {
            req.abort(err.clone());
        }
        for req in self.queue.drain(..) {
            req.fail(err.clone());
        }
        while let Ok(cmd) = self.commands.try_recv() {
            cmd.fail(PgError::ConnectionClosed);
        }
    }

    async fn run_inner(&mut self) -> PgResult<()> {
        loop {
            self.pump().await?;

            if self.terminating && self.in_flight.is_empty() {
                let _ = self.sink.shutdown().await;
                return Ok(());
            }

            tokio::select! {
                msg = self.stream.recv() => {
                    self.on_backend(msg?).await?;
                }
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        // Every handle is gone: finish up and hang up
                        self.commands_open = false;
                        self.queue.push_back(Request::Terminate { reply: None });
                    }
                },
            }
        }
    }

    fn can_write(&self) -> bool {
        !self.terminating && self.held.is_none() && (self.pipeline || self.in_flight.is_empty())
    }

    /// Write every request the connection can take now, then flush.
    async fn pump(&mut self) -> PgResult<()> {
        let mut terminate_reply = None;
        while self.can_write() {
            let Some(req) = self.queue.pop_front() else {
                break;
            };
            if req.is_abandoned() {
                trace!("dropping abandoned request");
                continue;
            }
            if let Request::Terminate { reply } = req {
                self.sink.buffer(&FrontendMessage::Terminate);
                self.terminating = true;
                terminate_reply = reply;
                break;
            }
            self.write_request(req);
        }

        if self.sink.has_buffered() {
            self.sink.flush().await?;
        }
        if let Some(reply) = terminate_reply {
            let _ = reply.send(());
        }
        Ok(())
    }

    fn write_request(&mut self, req: Request) {
        match req {
            Request::Simple { sql, types, reply } => {
                trace!(sql = %sql, "simple query");
                self.sink.buffer(&FrontendMessage::Query { query: sql });
                self.push(Op::Simple { reply }, Until::ReadyForQuery, types);
            }
            Request::Extended { query, reply } => {
                let (statement, parsed) = match self.prepare(&query) {
                    Ok(prepared) => prepared,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                self.sink.buffer(&query.bind_message(&statement, ""));
                self.sink.buffer(&FrontendMessage::Describe {
                    target: Target::Portal,
                    name: String::new(),
                });
                self.sink.buffer(&FrontendMessage::Execute {
                    portal: String::new(),
                    max_rows: query.max_rows,
                });
                self.sink.buffer(&FrontendMessage::Sync);
                self.push(
                    Op::Extended { reply, parsed },
                    Until::ReadyForQuery,
                    query.types,
                );
            }
            Request::CopyIn { sql, data, reply } => {
                self.sink.buffer(&FrontendMessage::Query { query: sql });
                self.push(Op::CopyIn { data, reply }, Until::ReadyForQuery, None);
            }
            Request::CopyOut { sql, reply } => {
                self.sink.buffer(&FrontendMessage::Query { query: sql });
                self.push(Op::CopyOut { reply }, Until::ReadyForQuery, None);
            }
            Request::CursorOpen { id, query, reply } => {
                let portal = format!("__pgkit_cursor_{}", id);
                self.sink.buffer(&FrontendMessage::Parse {
                    name: String::new(),
                    query: query.text.clone(),
                    param_types: query.parse_types(),
                });
                self.sink.buffer(&query.bind_message("", &portal));
                self.sink.buffer(&FrontendMessage::Describe {
                    target: Target::Portal,
                    name: portal.clone(),
                });
                self.sink.buffer(&FrontendMessage::Flush);
                self.push(Op::CursorOpen { id, reply }, Until::Flushed, query.types);
                self.held = Some(HeldCursor {
                    id,
                    portal,
                    columns: no_columns(),
                    decoders: Arc::from(Vec::new()),
                    opened: false,
                });
            }
            // Handled by pump
            Request::Terminate { .. } => {}
        }
    }

    fn push(&mut self, op: Op, until: Until, types: Option<Arc<TypeRegistry>>) {
        let acc = Accumulator::new(types, Arc::clone(&self.connection_types));
        self.in_flight.push_back(InFlight::new(op, until, acc));
    }

    /// Buffer whatever Parse (and Close of an evicted statement) the query
    /// needs, returning the statement name to bind.
    fn prepare(&mut self, query: &Query) -> PgResult<(String, Option<Parsed>)> {
        let param_types = query.parse_types();

        if let Some(name) = &query.name {
            if let Some(text) = self.named.get(name) {
                if *text != query.text {
                    return Err(PgError::Usage(format!(
                        "Prepared statements must be unique - '{}' was used for a different statement",
                        name
                    )));
                }
                return Ok((name.clone(), None));
            }
            self.sink.buffer(&FrontendMessage::Parse {
                name: name.clone(),
                query: query.text.clone(),
                param_types,
            });
            self.named.insert(name.clone(), query.text.clone());
            return Ok((name.clone(), Some(Parsed::Named(name.clone()))));
        }

        if !self.statements.is_enabled() {
            self.sink.buffer(&FrontendMessage::Parse {
                name: String::new(),
                query: query.text.clone(),
                param_types,
            });
            return Ok((String::new(), None));
        }

        let key = cache_key(&query.text, &param_types);
        if let Some(stmt) = self.statements.get(&key) {
            return Ok((stmt.name.clone(), None));
        }

        let name = self.statements.next_statement_name();
        let stmt = PreparedStatement::new(name.clone(), query.text.clone(), param_types.clone());
        if let Some(evicted) = self.statements.insert(key.clone(), Arc::new(stmt)) {
            debug!(statement = %evicted.name, "closing evicted prepared statement");
            self.sink.buffer(&FrontendMessage::Close {
                target: Target::Statement,
                name: evicted.name.clone(),
            });
        }
        self.sink.buffer(&FrontendMessage::Parse {
            name: name.clone(),
            query: query.text.clone(),
            param_types,
        });
        Ok((name, Some(Parsed::Cached(key))))
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request(req) => {
                if self.terminating {
                    req.fail(PgError::ConnectionClosed);
                } else {
                    self.queue.push_back(req);
                }
            }
            Command::CursorRead { id, rows, reply } => match &self.held {
                Some(held) if held.id == id && held.opened => {
                    self.sink.buffer(&FrontendMessage::Execute {
                        portal: held.portal.clone(),
                        max_rows: rows,
                    });
                    self.sink.buffer(&FrontendMessage::Flush);
                    let acc = Accumulator::described(
                        Arc::clone(&held.columns),
                        Arc::clone(&held.decoders),
                    );
                    self.in_flight.push_back(InFlight::new(
                        Op::CursorRead { id, reply },
                        Until::Flushed,
                        acc,
                    ));
                }
                _ => {
                    let _ = reply.send(Err(PgError::Usage("cursor is not open".to_string())));
                }
            },
            Command::CursorClose { id, reply } => match self.held.take() {
                Some(held) if held.id == id => {
                    self.sink.buffer(&FrontendMessage::Close {
                        target: Target::Portal,
                        name: held.portal,
                    });
                    self.sink.buffer(&FrontendMessage::Sync);
                    let acc = Accumulator::new(None, TypeRegistry::empty());
                    self.in_flight.push_back(InFlight::new(
                        Op::CursorClose { id, reply },
                        Until::ReadyForQuery,
                        acc,
                    ));
                }
                other => {
                    // Already closed, or failed and released
                    self.held = other;
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
            },
        }
    }

    async fn on_backend(&mut self, msg: BackendMessage) -> PgResult<()> {
        // Asynchronous messages can arrive at any time
        let msg = match msg {
            BackendMessage::NoticeResponse { fields } => {
                let notice = DbError::from_fields(&fields);
                debug!(code = %notice.code, "notice: {}", notice.message);
                let _ = self.events.send(ClientEvent::Notice(notice));
                return Ok(());
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                let _ = self.events.send(ClientEvent::Notification {
                    process_id,
                    channel,
                    payload,
                });
                return Ok(());
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.shared
                    .parameters
                    .lock()
                    .insert(name.clone(), value.clone());
                let _ = self
                    .events
                    .send(ClientEvent::ParameterStatus { name, value });
                return Ok(());
            }
            BackendMessage::Unknown { tag, .. } => {
                trace!(tag = %(tag as char), "ignoring unknown message");
                return Ok(());
            }
            BackendMessage::ReadyForQuery { status } => {
                *self.shared.transaction_status.lock() = status;
                msg
            }
            other => other,
        };

        let Some(front) = self.in_flight.front_mut() else {
            return Err(match msg {
                // Typically FATAL before the server hangs up
                BackendMessage::ErrorResponse { fields } => error_from_fields(&fields),
                other => PgError::Protocol(format!(
                    "Received unexpected {} with no query in flight",
                    other.name()
                )),
            });
        };

        match front.on_message(msg)? {
            Step::Continue => {}
            Step::Reply(replies) => {
                for reply in &replies {
                    self.sink.buffer(reply);
                }
                self.sink.flush().await?;
            }
            Step::Finished => {
                if let Some(done) = self.in_flight.pop_front() {
                    self.on_finished(done.finish());
                }
            }
        }
        Ok(())
    }

    fn on_finished(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Done => {}
            Outcome::CursorOpened {
                id,
                columns,
                decoders,
                abandoned,
            } => {
                if let Some(held) = self.held.as_mut().filter(|h| h.id == id) {
                    held.columns = columns;
                    held.decoders = decoders;
                    held.opened = true;
                }
                if abandoned {
                    debug!(id, "closing cursor nobody is waiting for");
                    self.on_command(Command::CursorClose { id, reply: None });
                }
            }
            Outcome::CursorReleased { id } => {
                if self.held.as_ref().is_some_and(|h| h.id == id) {
                    self.held = None;
                }
            }
            Outcome::Unprepare(Parsed::Cached(key)) => {
                self.statements.remove(&key);
            }
            Outcome::Unprepare(Parsed::Named(name)) => {
                self.named.remove(&name);
            }
        }
    }
}
