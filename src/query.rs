//! Query requests and the per-request response state machine.
//!
//! Every request written to the server becomes an [`InFlight`] entry. The
//! client driver keeps those entries in write order and hands each backend
//! message to the oldest one; an entry consumes messages until its
//! terminator arrives and then resolves its caller. Responses are matched to
//! requests by position alone.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::client::Parsed;
use crate::error::{error_from_fields, PgError, PgResult};
use crate::protocol::{BackendMessage, FieldDescription, FrontendMessage};
use crate::result::{no_columns, QueryResult, Row, SharedColumns};
use crate::types::{ColumnDecoder, Format, Oid, PgValue, TypeRegistry};

// ============================================================================
// Query builder
// ============================================================================

/// An extended-protocol query with its options.
///
/// ```ignore
/// let q = Query::new("SELECT * FROM users WHERE id = $1")
///     .bind(PgValue::Int4(42))
///     .binary();
/// let result = client.query_with(q).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) text: String,
    pub(crate) params: Vec<PgValue>,
    pub(crate) param_types: Option<Vec<Oid>>,
    pub(crate) result_format: Format,
    pub(crate) name: Option<String>,
    pub(crate) types: Option<Arc<TypeRegistry>>,
    pub(crate) max_rows: i32,
    pub(crate) timeout: Option<Duration>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            param_types: None,
            result_format: Format::Text,
            name: None,
            types: None,
            max_rows: 0,
            timeout: None,
        }
    }

    /// Append one parameter value.
    pub fn bind(mut self, value: PgValue) -> Self {
        self.params.push(value);
        self
    }

    pub fn params(mut self, values: impl IntoIterator<Item = PgValue>) -> Self {
        self.params.extend(values);
        self
    }

    /// Declare parameter types instead of deriving them from the values.
    pub fn param_types(mut self, types: Vec<Oid>) -> Self {
        self.param_types = Some(types);
        self
    }

    /// Ask for every result column in binary format.
    pub fn binary(mut self) -> Self {
        self.result_format = Format::Binary;
        self
    }

    pub fn result_format(mut self, format: Format) -> Self {
        self.result_format = format;
        self
    }

    /// Parse once under this name and reuse it on later calls.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Decoder overrides for this call only.
    pub fn types(mut self, registry: TypeRegistry) -> Self {
        self.types = Some(Arc::new(registry));
        self
    }

    /// Stop after this many rows (0 means no limit).
    pub fn max_rows(mut self, rows: u32) -> Self {
        self.max_rows = i32::try_from(rows).unwrap_or(i32::MAX);
        self
    }

    /// Client-side deadline for this call, overriding the connection's.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Type OIDs sent with Parse.
    pub(crate) fn parse_types(&self) -> Vec<Oid> {
        match &self.param_types {
            Some(types) => types.clone(),
            None => self.params.iter().map(PgValue::type_oid).collect(),
        }
    }

    /// Bind for the given statement and portal.
    pub(crate) fn bind_message(&self, statement: &str, portal: &str) -> FrontendMessage {
        FrontendMessage::Bind {
            portal: portal.to_string(),
            statement: statement.to_string(),
            param_formats: self.params.iter().map(PgValue::param_format).collect(),
            params: self
                .params
                .iter()
                .map(|p| p.encode_param().map(Bytes::from))
                .collect(),
            result_formats: vec![self.result_format],
        }
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

// ============================================================================
// Pending operations
// ============================================================================

/// Rows fetched by one cursor read.
#[derive(Debug)]
pub(crate) struct CursorBatch {
    pub(crate) rows: Vec<Row>,
    /// The portal has more rows
    pub(crate) suspended: bool,
}

/// What a request is waiting to deliver.
pub(crate) enum Op {
    Simple {
        reply: oneshot::Sender<PgResult<Vec<QueryResult>>>,
    },
    Extended {
        reply: oneshot::Sender<PgResult<QueryResult>>,
        /// Statement this request's Parse registered, if it sent one
        parsed: Option<Parsed>,
    },
    CopyOut {
        reply: oneshot::Sender<PgResult<Vec<Bytes>>>,
    },
    CopyIn {
        data: Vec<Bytes>,
        reply: oneshot::Sender<PgResult<u64>>,
    },
    CursorOpen {
        id: u64,
        reply: oneshot::Sender<PgResult<SharedColumns>>,
    },
    CursorRead {
        id: u64,
        reply: oneshot::Sender<PgResult<CursorBatch>>,
    },
    CursorClose {
        id: u64,
        reply: Option<oneshot::Sender<PgResult<()>>>,
    },
}

impl Op {
    /// Resolve with an error without waiting for the server.
    pub(crate) fn fail(self, err: PgError) {
        match self {
            Op::Simple { reply } => drop(reply.send(Err(err))),
            Op::Extended { reply, .. } => drop(reply.send(Err(err))),
            Op::CopyOut { reply } => drop(reply.send(Err(err))),
            Op::CopyIn { reply, .. } => drop(reply.send(Err(err))),
            Op::CursorOpen { reply, .. } => drop(reply.send(Err(err))),
            Op::CursorRead { reply, .. } => drop(reply.send(Err(err))),
            Op::CursorClose { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    /// The cursor this operation belongs to.
    pub(crate) fn cursor_id(&self) -> Option<u64> {
        match self {
            Op::CursorOpen { id, .. } | Op::CursorRead { id, .. } | Op::CursorClose { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }
}

/// Message that ends a request's response sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Until {
    /// Sync was sent: wait for ReadyForQuery.
    ReadyForQuery,
    /// Only Flush was sent: the describe or execute response ends it.
    Flushed,
}

/// What the driver must do after a message was consumed.
#[derive(Debug, PartialEq)]
pub(crate) enum Step {
    Continue,
    /// Write these messages, then continue.
    Reply(Vec<FrontendMessage>),
    /// The request is complete; pop it.
    Finished,
}

/// How a finished request left the connection.
#[derive(Debug)]
pub(crate) enum Outcome {
    Done,
    /// A cursor's portal is open and described.
    CursorOpened {
        id: u64,
        columns: SharedColumns,
        decoders: Arc<[ColumnDecoder]>,
        /// Nobody is waiting for the cursor; close it straight away.
        abandoned: bool,
    },
    /// A cursor cycle ended (closed or failed); the connection is free.
    CursorReleased { id: u64 },
    /// A Parse failed; forget the statement.
    Unprepare(Parsed),
}

// ============================================================================
// Result accumulator
// ============================================================================

/// Collects rows for the current statement and finished statement results.
pub(crate) struct Accumulator {
    call_types: Option<Arc<TypeRegistry>>,
    connection_types: Arc<TypeRegistry>,
    columns: SharedColumns,
    decoders: Arc<[ColumnDecoder]>,
    rows: Vec<Row>,
    results: Vec<QueryResult>,
    copy_data: Vec<Bytes>,
}

impl Accumulator {
    pub(crate) fn new(
        call_types: Option<Arc<TypeRegistry>>,
        connection_types: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            call_types,
            connection_types,
            columns: no_columns(),
            decoders: Arc::from(Vec::new()),
            rows: Vec::new(),
            results: Vec::new(),
            copy_data: Vec::new(),
        }
    }

    /// Start with a known row description, for cursor reads.
    pub(crate) fn described(columns: SharedColumns, decoders: Arc<[ColumnDecoder]>) -> Self {
        Self {
            call_types: None,
            connection_types: TypeRegistry::empty(),
            columns,
            decoders,
            rows: Vec::new(),
            results: Vec::new(),
            copy_data: Vec::new(),
        }
    }

    /// RowDescription: resolve one decoder per column, once.
    fn describe(&mut self, fields: Vec<FieldDescription>) {
        self.decoders = fields
            .iter()
            .map(|f| {
                ColumnDecoder::resolve(
                    f.type_oid,
                    f.format,
                    self.call_types.as_deref(),
                    &self.connection_types,
                )
            })
            .collect();
        self.columns = Arc::new(fields);
    }

    fn no_data(&mut self) {
        self.columns = no_columns();
        self.decoders = Arc::from(Vec::new());
    }

    /// DataRow. A count mismatch means the stream is corrupt and is fatal;
    /// a decoder failure only fails this request.
    fn push_row(&mut self, values: Vec<Option<Bytes>>) -> PgResult<Result<(), PgError>> {
        if values.len() != self.decoders.len() {
            return Err(PgError::Protocol(format!(
                "DataRow has {} fields but RowDescription announced {}",
                values.len(),
                self.decoders.len()
            )));
        }

        let mut decoded: SmallVec<[PgValue; 16]> = SmallVec::with_capacity(values.len());
        for (value, decoder) in values.iter().zip(self.decoders.iter()) {
            let v = match value {
                Some(data) => match decoder.decode(data) {
                    Ok(v) => v,
                    Err(e) => return Ok(Err(e)),
                },
                None => PgValue::Null,
            };
            decoded.push(v);
        }
        self.rows.push(Row::new(Arc::clone(&self.columns), decoded));
        Ok(Ok(()))
    }

    /// CommandComplete, EmptyQueryResponse or PortalSuspended.
    fn complete(&mut self, tag: Option<String>) {
        let rows = std::mem::take(&mut self.rows);
        let columns = std::mem::replace(&mut self.columns, no_columns());
        self.results.push(QueryResult::new(columns, rows, tag));
    }

    /// Rows of a cursor read; the description stays for the next read.
    fn take_rows(&mut self) -> Vec<Row> {
        std::mem::take(&mut self.rows)
    }
}

// ============================================================================
// In-flight request
// ============================================================================

/// A request whose messages have been written.
pub(crate) struct InFlight {
    op: Op,
    until: Until,
    acc: Accumulator,
    error: Option<PgError>,
    suspended: bool,
    parse_complete: bool,
}

impl InFlight {
    pub(crate) fn new(op: Op, until: Until, acc: Accumulator) -> Self {
        Self {
            op,
            until,
            acc,
            error: None,
            suspended: false,
            parse_complete: false,
        }
    }

    fn record_error(&mut self, err: PgError) {
        // The first error is the one the caller sees
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn finish_if_flushed(&self) -> Step {
        if self.until == Until::Flushed {
            Step::Finished
        } else {
            Step::Continue
        }
    }

    /// Consume one backend message. `Err` is fatal for the connection.
    pub(crate) fn on_message(&mut self, msg: BackendMessage) -> PgResult<Step> {
        match msg {
            BackendMessage::ParseComplete => {
                self.parse_complete = true;
                Ok(Step::Continue)
            }
            BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::ParameterDescription { .. } => Ok(Step::Continue),

            BackendMessage::RowDescription { fields } => {
                self.acc.describe(fields);
                Ok(self.finish_if_flushed())
            }
            BackendMessage::NoData => {
                self.acc.no_data();
                Ok(self.finish_if_flushed())
            }
            BackendMessage::DataRow { values } => {
                if self.error.is_none() {
                    if let Err(e) = self.acc.push_row(values)? {
                        self.record_error(e);
                    }
                }
                Ok(Step::Continue)
            }
            BackendMessage::CommandComplete { tag } => {
                if self.until == Until::Flushed {
                    return Ok(Step::Finished);
                }
                self.acc.complete(Some(tag));
                Ok(Step::Continue)
            }
            BackendMessage::EmptyQueryResponse => {
                if self.until == Until::Flushed {
                    return Ok(Step::Finished);
                }
                self.acc.complete(None);
                Ok(Step::Continue)
            }
            BackendMessage::PortalSuspended => {
                if self.until == Until::Flushed {
                    self.suspended = true;
                    return Ok(Step::Finished);
                }
                // Row limit reached on an unnamed portal
                self.acc.complete(None);
                Ok(Step::Continue)
            }
            BackendMessage::ErrorResponse { fields } => {
                self.record_error(error_from_fields(&fields));
                if self.until == Until::Flushed {
                    // The server skips everything up to the next Sync
                    self.until = Until::ReadyForQuery;
                    return Ok(Step::Reply(vec![FrontendMessage::Sync]));
                }
                Ok(Step::Continue)
            }
            BackendMessage::CopyInResponse { .. } => match &mut self.op {
                Op::CopyIn { data, .. } => {
                    let mut out: Vec<FrontendMessage> = std::mem::take(data)
                        .into_iter()
                        .map(|data| FrontendMessage::CopyData { data })
                        .collect();
                    out.push(FrontendMessage::CopyDone);
                    Ok(Step::Reply(out))
                }
                _ => Ok(Step::Reply(vec![FrontendMessage::CopyFail {
                    message: "COPY FROM STDIN is only supported through copy_in".to_string(),
                }])),
            },
            BackendMessage::CopyOutResponse { .. } | BackendMessage::CopyDone => {
                Ok(Step::Continue)
            }
            BackendMessage::CopyData { data } => {
                if matches!(self.op, Op::CopyOut { .. }) {
                    self.acc.copy_data.push(data);
                }
                Ok(Step::Continue)
            }
            BackendMessage::ReadyForQuery { .. } => match self.until {
                Until::ReadyForQuery => Ok(Step::Finished),
                Until::Flushed => Err(PgError::Protocol(
                    "ReadyForQuery arrived for a request that never sent Sync".to_string(),
                )),
            },
            other => Err(PgError::Protocol(format!(
                "Unexpected {} while a query is in progress",
                other.name()
            ))),
        }
    }

    /// Deliver the result to the caller.
    pub(crate) fn finish(mut self) -> Outcome {
        if let Some(err) = self.error.take() {
            let outcome = match &self.op {
                Op::Extended {
                    parsed: Some(parsed),
                    ..
                } if !self.parse_complete => Outcome::Unprepare(parsed.clone()),
                op => match op.cursor_id() {
                    Some(id) => Outcome::CursorReleased { id },
                    None => Outcome::Done,
                },
            };
            self.op.fail(err);
            return outcome;
        }

        match self.op {
            Op::Simple { reply } => {
                let _ = reply.send(Ok(self.acc.results));
                Outcome::Done
            }
            Op::Extended { reply, .. } => {
                let result = self.acc.results.pop().unwrap_or_else(QueryResult::empty);
                let _ = reply.send(Ok(result));
                Outcome::Done
            }
            Op::CopyOut { reply } => {
                let _ = reply.send(Ok(self.acc.copy_data));
                Outcome::Done
            }
            Op::CopyIn { reply, .. } => {
                let rows = self
                    .acc
                    .results
                    .last()
                    .map(QueryResult::rows_affected)
                    .unwrap_or(0);
                let _ = reply.send(Ok(rows));
                Outcome::Done
            }
            Op::CursorOpen { id, reply } => {
                let columns = Arc::clone(&self.acc.columns);
                let abandoned = reply.send(Ok(Arc::clone(&columns))).is_err();
                Outcome::CursorOpened {
                    id,
                    columns,
                    decoders: self.acc.decoders,
                    abandoned,
                }
            }
            Op::CursorRead { reply, .. } => {
                let rows = self.acc.take_rows();
                let _ = reply.send(Ok(CursorBatch {
                    rows,
                    suspended: self.suspended,
                }));
                Outcome::Done
            }
            Op::CursorClose { id, reply } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
                Outcome::CursorReleased { id }
            }
        }
    }

    /// Fail without waiting for the server. An error the server already
    /// reported for this request takes precedence.
    pub(crate) fn abort(self, err: PgError) {
        self.op.fail(self.error.unwrap_or(err));
    }
}
