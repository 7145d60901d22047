//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages. Backend
//! messages are decoded from a `(tag, payload)` pair produced by
//! [`FrameDecoder`](crate::frame::FrameDecoder); frontend messages encode
//! straight into an output buffer. Both directions can be encoded and decoded
//! so that a test server can speak the protocol with the same code.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{PgError, PgResult};
use crate::types::{Format, Oid};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Request code of SSLRequest, sent in place of a protocol version.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Request code of CancelRequest, sent in place of a protocol version.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "Invalid transaction status: {:?}",
                other as char
            ))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

/// Target of a Describe or Close message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn as_byte(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }

    fn from_byte(b: u8) -> PgResult<Self> {
        match b {
            b'S' => Ok(Target::Statement),
            b'P' => Ok(Target::Portal),
            other => Err(PgError::Protocol(format!(
                "Invalid describe/close target: {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontendMessage {
    /// Startup message sent at connection start (untagged)
    Startup {
        user: String,
        database: Option<String>,
        options: Vec<(String, String)>,
    },
    /// SSL negotiation request (untagged)
    SslRequest,
    /// Out-of-band cancellation, sent on a fresh connection (untagged)
    CancelRequest { process_id: i32, secret_key: i32 },
    /// Password message (for MD5 or plaintext auth)
    Password { password: String },
    /// First SCRAM message
    SaslInitialResponse { mechanism: String, data: Bytes },
    /// Subsequent SCRAM messages
    SaslResponse { data: Bytes },
    /// Simple query ('Q')
    Query { query: String },
    /// Creates a prepared statement ('P')
    Parse {
        name: String,
        query: String,
        param_types: Vec<Oid>,
    },
    /// Binds parameters to a prepared statement ('B'); `None` is NULL
    Bind {
        portal: String,
        statement: String,
        param_formats: Vec<Format>,
        params: Vec<Option<Bytes>>,
        result_formats: Vec<Format>,
    },
    /// Request description of statement or portal ('D')
    Describe { target: Target, name: String },
    /// Executes a bound portal ('E'); `max_rows` 0 means no limit
    Execute { portal: String, max_rows: i32 },
    /// Close a statement or portal ('C')
    Close { target: Target, name: String },
    /// Marks end of an extended query ('S')
    Sync,
    /// Request server to flush output buffer ('H')
    Flush,
    /// Close the connection ('X')
    Terminate,
    CopyData { data: Bytes },
    CopyDone,
    CopyFail { message: String },
}

impl FrontendMessage {
    /// Encode into a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Append the encoded message to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            FrontendMessage::Startup {
                user,
                database,
                options,
            } => write_frame(buf, None, |body| {
                body.put_i32(PROTOCOL_VERSION);
                put_cstr(body, "user");
                put_cstr(body, user);
                if let Some(db) = database {
                    put_cstr(body, "database");
                    put_cstr(body, db);
                }
                for (key, value) in options {
                    put_cstr(body, key);
                    put_cstr(body, value);
                }
                // Terminator
                body.put_u8(0);
            }),
            FrontendMessage::SslRequest => {
                write_frame(buf, None, |body| body.put_i32(SSL_REQUEST_CODE))
            }
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => write_frame(buf, None, |body| {
                body.put_i32(CANCEL_REQUEST_CODE);
                body.put_i32(*process_id);
                body.put_i32(*secret_key);
            }),
            FrontendMessage::Password { password } => {
                write_frame(buf, Some(b'p'), |body| put_cstr(body, password))
            }
            FrontendMessage::SaslInitialResponse { mechanism, data } => {
                write_frame(buf, Some(b'p'), |body| {
                    put_cstr(body, mechanism);
                    body.put_i32(data.len() as i32);
                    body.put_slice(data);
                })
            }
            FrontendMessage::SaslResponse { data } => {
                write_frame(buf, Some(b'p'), |body| body.put_slice(data))
            }
            FrontendMessage::Query { query } => {
                write_frame(buf, Some(b'Q'), |body| put_cstr(body, query))
            }
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => write_frame(buf, Some(b'P'), |body| {
                put_cstr(body, name);
                put_cstr(body, query);
                body.put_i16(param_types.len() as i16);
                for oid in param_types {
                    body.put_i32(oid.as_i32());
                }
            }),
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                params,
                result_formats,
            } => write_frame(buf, Some(b'B'), |body| {
                put_cstr(body, portal);
                put_cstr(body, statement);
                body.put_i16(param_formats.len() as i16);
                for fmt in param_formats {
                    body.put_i16(fmt.code());
                }
                body.put_i16(params.len() as i16);
                for param in params {
                    match param {
                        None => body.put_i32(-1),
                        Some(data) => {
                            body.put_i32(data.len() as i32);
                            body.put_slice(data);
                        }
                    }
                }
                body.put_i16(result_formats.len() as i16);
                for fmt in result_formats {
                    body.put_i16(fmt.code());
                }
            }),
            FrontendMessage::Describe { target, name } => {
                write_frame(buf, Some(b'D'), |body| {
                    body.put_u8(target.as_byte());
                    put_cstr(body, name);
                })
            }
            FrontendMessage::Execute { portal, max_rows } => {
                write_frame(buf, Some(b'E'), |body| {
                    put_cstr(body, portal);
                    body.put_i32(*max_rows);
                })
            }
            FrontendMessage::Close { target, name } => write_frame(buf, Some(b'C'), |body| {
                body.put_u8(target.as_byte());
                put_cstr(body, name);
            }),
            FrontendMessage::Sync => write_frame(buf, Some(b'S'), |_| {}),
            FrontendMessage::Flush => write_frame(buf, Some(b'H'), |_| {}),
            FrontendMessage::Terminate => write_frame(buf, Some(b'X'), |_| {}),
            FrontendMessage::CopyData { data } => {
                write_frame(buf, Some(b'd'), |body| body.put_slice(data))
            }
            FrontendMessage::CopyDone => write_frame(buf, Some(b'c'), |_| {}),
            FrontendMessage::CopyFail { message } => {
                write_frame(buf, Some(b'f'), |body| put_cstr(body, message))
            }
        }
    }

    /// Decode an untagged message (startup, SSL or cancel request) from the
    /// bytes that follow its length prefix.
    pub fn decode_untagged(payload: Bytes) -> PgResult<Self> {
        let mut r = Reader::new(payload);
        match r.i32()? {
            PROTOCOL_VERSION => {
                let mut params = Vec::new();
                loop {
                    let key = r.cstr()?;
                    if key.is_empty() {
                        break;
                    }
                    params.push((key, r.cstr()?));
                }
                let mut user = None;
                let mut database = None;
                let mut options = Vec::new();
                for (key, value) in params {
                    match key.as_str() {
                        "user" => user = Some(value),
                        "database" => database = Some(value),
                        _ => options.push((key, value)),
                    }
                }
                let user = user
                    .ok_or_else(|| PgError::Protocol("Startup message without user".into()))?;
                Ok(FrontendMessage::Startup {
                    user,
                    database,
                    options,
                })
            }
            SSL_REQUEST_CODE => Ok(FrontendMessage::SslRequest),
            CANCEL_REQUEST_CODE => Ok(FrontendMessage::CancelRequest {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            }),
            code => Err(PgError::Protocol(format!(
                "Unsupported startup code: {}",
                code
            ))),
        }
    }

    /// Decode a tagged message.
    ///
    /// The 'p' tag is shared by every password-type message and its meaning
    /// depends on the authentication exchange, so it decodes as a plain
    /// [`FrontendMessage::Password`]; use [`FrontendMessage::decode_sasl`]
    /// during a SASL exchange.
    pub fn decode(tag: u8, payload: Bytes) -> PgResult<Self> {
        let mut r = Reader::new(payload);
        let msg = match tag {
            b'p' => FrontendMessage::Password { password: r.cstr()? },
            b'Q' => FrontendMessage::Query { query: r.cstr()? },
            b'P' => {
                let name = r.cstr()?;
                let query = r.cstr()?;
                let n = r.count()?;
                let mut param_types = Vec::with_capacity(n);
                for _ in 0..n {
                    param_types.push(Oid::from_i32(r.i32()?));
                }
                FrontendMessage::Parse {
                    name,
                    query,
                    param_types,
                }
            }
            b'B' => {
                let portal = r.cstr()?;
                let statement = r.cstr()?;
                let param_formats = r.formats()?;
                let n = r.count()?;
                let mut params = Vec::with_capacity(n);
                for _ in 0..n {
                    params.push(r.nullable_bytes()?);
                }
                let result_formats = r.formats()?;
                FrontendMessage::Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                }
            }
            b'D' => FrontendMessage::Describe {
                target: Target::from_byte(r.u8()?)?,
                name: r.cstr()?,
            },
            b'E' => FrontendMessage::Execute {
                portal: r.cstr()?,
                max_rows: r.i32()?,
            },
            b'C' => FrontendMessage::Close {
                target: Target::from_byte(r.u8()?)?,
                name: r.cstr()?,
            },
            b'S' => FrontendMessage::Sync,
            b'H' => FrontendMessage::Flush,
            b'X' => FrontendMessage::Terminate,
            b'd' => FrontendMessage::CopyData { data: r.rest() },
            b'c' => FrontendMessage::CopyDone,
            b'f' => FrontendMessage::CopyFail { message: r.cstr()? },
            other => {
                return Err(PgError::Protocol(format!(
                    "Unknown frontend message type: {:?}",
                    other as char
                )))
            }
        };
        Ok(msg)
    }

    /// Decode a 'p' message sent during a SASL exchange.
    pub fn decode_sasl(initial: bool, payload: Bytes) -> PgResult<Self> {
        let mut r = Reader::new(payload);
        if initial {
            let mechanism = r.cstr()?;
            let data = r.nullable_bytes()?.unwrap_or_default();
            Ok(FrontendMessage::SaslInitialResponse { mechanism, data })
        } else {
            Ok(FrontendMessage::SaslResponse { data: r.rest() })
        }
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Backend message types
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },
    /// Kerberos, GSSAPI, SSPI and anything newer.
    AuthenticationUnsupported {
        code: i32,
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // COPY
    CopyInResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        format: Format,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
    /// A tag this client does not know. Ignored by the connection.
    Unknown {
        tag: u8,
        payload: Bytes,
    },
}

impl BackendMessage {
    /// Decode a backend message from its tag and payload.
    ///
    /// Unknown tags decode to [`BackendMessage::Unknown`]; a payload that
    /// does not match the layout of a known tag is a protocol error.
    pub fn decode(tag: u8, payload: Bytes) -> PgResult<Self> {
        let mut r = Reader::new(payload);
        let msg = match tag {
            b'R' => Self::decode_auth(r)?,
            b'T' => Self::decode_row_description(&mut r)?,
            b'D' => Self::decode_data_row(&mut r)?,
            b'C' => BackendMessage::CommandComplete { tag: r.cstr()? },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::from_byte(r.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut r)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut r)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let n = r.count()?;
                let mut type_oids = Vec::with_capacity(n);
                for _ in 0..n {
                    type_oids.push(Oid::from_i32(r.i32()?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'A' => BackendMessage::NotificationResponse {
                process_id: r.i32()?,
                channel: r.cstr()?,
                payload: r.cstr()?,
            },
            b'G' => {
                let (format, column_formats) = read_copy_response(&mut r)?;
                BackendMessage::CopyInResponse {
                    format,
                    column_formats,
                }
            }
            b'H' => {
                let (format, column_formats) = read_copy_response(&mut r)?;
                BackendMessage::CopyOutResponse {
                    format,
                    column_formats,
                }
            }
            b'd' => BackendMessage::CopyData { data: r.rest() },
            b'c' => BackendMessage::CopyDone,
            _ => BackendMessage::Unknown {
                tag,
                payload: r.rest(),
            },
        };
        Ok(msg)
    }

    fn decode_auth(mut r: Reader) -> PgResult<Self> {
        let auth_type = r.i32()?;

        let msg = match auth_type {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&r.take(4)?);
                BackendMessage::AuthenticationMD5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while r.remaining() > 0 {
                    let mech = r.cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                BackendMessage::AuthenticationSASL { mechanisms }
            }
            11 => BackendMessage::AuthenticationSASLContinue { data: r.rest() },
            12 => BackendMessage::AuthenticationSASLFinal { data: r.rest() },
            code => BackendMessage::AuthenticationUnsupported {
                code,
                data: r.rest(),
            },
        };
        Ok(msg)
    }

    fn decode_row_description(r: &mut Reader) -> PgResult<Self> {
        let num_fields = r.count()?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: r.cstr()?,
                table_oid: r.i32()?,
                column_attr: r.i16()?,
                type_oid: Oid::from_i32(r.i32()?),
                type_size: r.i16()?,
                type_modifier: r.i32()?,
                format: Format::from_code(r.i16()?),
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(r: &mut Reader) -> PgResult<Self> {
        let num_cols = r.count()?;
        let mut values = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            values.push(r.nullable_bytes()?);
        }
        Ok(BackendMessage::DataRow { values })
    }

    /// Encode as a complete frame, tag included.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        let auth = |buf: &mut BytesMut, code: i32, data: &[u8]| {
            write_frame(buf, Some(b'R'), |body| {
                body.put_i32(code);
                body.put_slice(data);
            })
        };

        match self {
            BackendMessage::AuthenticationOk => auth(buf, 0, &[]),
            BackendMessage::AuthenticationCleartextPassword => auth(buf, 3, &[]),
            BackendMessage::AuthenticationMD5Password { salt } => auth(buf, 5, salt),
            BackendMessage::AuthenticationSASL { mechanisms } => {
                write_frame(buf, Some(b'R'), |body| {
                    body.put_i32(10);
                    for mech in mechanisms {
                        put_cstr(body, mech);
                    }
                    body.put_u8(0);
                })
            }
            BackendMessage::AuthenticationSASLContinue { data } => auth(buf, 11, data),
            BackendMessage::AuthenticationSASLFinal { data } => auth(buf, 12, data),
            BackendMessage::AuthenticationUnsupported { code, data } => auth(buf, *code, data),
            BackendMessage::RowDescription { fields } => write_frame(buf, Some(b'T'), |body| {
                body.put_i16(fields.len() as i16);
                for f in fields {
                    put_cstr(body, &f.name);
                    body.put_i32(f.table_oid);
                    body.put_i16(f.column_attr);
                    body.put_i32(f.type_oid.as_i32());
                    body.put_i16(f.type_size);
                    body.put_i32(f.type_modifier);
                    body.put_i16(f.format.code());
                }
            }),
            BackendMessage::DataRow { values } => write_frame(buf, Some(b'D'), |body| {
                body.put_i16(values.len() as i16);
                for value in values {
                    match value {
                        None => body.put_i32(-1),
                        Some(data) => {
                            body.put_i32(data.len() as i32);
                            body.put_slice(data);
                        }
                    }
                }
            }),
            BackendMessage::CommandComplete { tag } => {
                write_frame(buf, Some(b'C'), |body| put_cstr(body, tag))
            }
            BackendMessage::EmptyQueryResponse => write_frame(buf, Some(b'I'), |_| {}),
            BackendMessage::ParseComplete => write_frame(buf, Some(b'1'), |_| {}),
            BackendMessage::BindComplete => write_frame(buf, Some(b'2'), |_| {}),
            BackendMessage::CloseComplete => write_frame(buf, Some(b'3'), |_| {}),
            BackendMessage::NoData => write_frame(buf, Some(b'n'), |_| {}),
            BackendMessage::PortalSuspended => write_frame(buf, Some(b's'), |_| {}),
            BackendMessage::ReadyForQuery { status } => {
                write_frame(buf, Some(b'Z'), |body| body.put_u8(status.as_byte()))
            }
            BackendMessage::ParameterStatus { name, value } => {
                write_frame(buf, Some(b'S'), |body| {
                    put_cstr(body, name);
                    put_cstr(body, value);
                })
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => write_frame(buf, Some(b'K'), |body| {
                body.put_i32(*process_id);
                body.put_i32(*secret_key);
            }),
            BackendMessage::ErrorResponse { fields } => {
                write_frame(buf, Some(b'E'), |body| put_error_fields(body, fields))
            }
            BackendMessage::NoticeResponse { fields } => {
                write_frame(buf, Some(b'N'), |body| put_error_fields(body, fields))
            }
            BackendMessage::CopyInResponse {
                format,
                column_formats,
            } => write_frame(buf, Some(b'G'), |body| {
                put_copy_response(body, *format, column_formats)
            }),
            BackendMessage::CopyOutResponse {
                format,
                column_formats,
            } => write_frame(buf, Some(b'H'), |body| {
                put_copy_response(body, *format, column_formats)
            }),
            BackendMessage::CopyData { data } => {
                write_frame(buf, Some(b'd'), |body| body.put_slice(data))
            }
            BackendMessage::CopyDone => write_frame(buf, Some(b'c'), |_| {}),
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => write_frame(buf, Some(b'A'), |body| {
                body.put_i32(*process_id);
                put_cstr(body, channel);
                put_cstr(body, payload);
            }),
            BackendMessage::ParameterDescription { type_oids } => {
                write_frame(buf, Some(b't'), |body| {
                    body.put_i16(type_oids.len() as i16);
                    for oid in type_oids {
                        body.put_i32(oid.as_i32());
                    }
                })
            }
            BackendMessage::Unknown { tag, payload } => {
                write_frame(buf, Some(*tag), |body| body.put_slice(payload))
            }
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationSASL { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationSASLContinue { .. } => "AuthenticationSASLContinue",
            BackendMessage::AuthenticationSASLFinal { .. } => "AuthenticationSASLFinal",
            BackendMessage::AuthenticationUnsupported { .. } => "AuthenticationUnsupported",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::CopyInResponse { .. } => "CopyInResponse",
            BackendMessage::CopyOutResponse { .. } => "CopyOutResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::Unknown { .. } => "Unknown",
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Bounds-checked cursor over a message payload.
struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol(format!(
                "Message truncated: needed {} more bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// A non-negative Int16 element count.
    fn count(&mut self) -> PgResult<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| PgError::Protocol(format!("Negative count: {}", n)))
    }

    fn take(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Int32 length followed by that many bytes; -1 is NULL.
    fn nullable_bytes(&mut self) -> PgResult<Option<Bytes>> {
        match self.i32()? {
            -1 => Ok(None),
            len if len < 0 => Err(PgError::Protocol(format!("Invalid value length: {}", len))),
            len => self.take(len as usize).map(Some),
        }
    }

    fn formats(&mut self) -> PgResult<Vec<Format>> {
        let n = self.count()?;
        let mut formats = Vec::with_capacity(n);
        for _ in 0..n {
            formats.push(Format::from_code(self.i16()?));
        }
        Ok(formats)
    }

    /// Read a null-terminated string.
    fn cstr(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

        // Try direct UTF-8 conversion first, fall back to lossy only if invalid
        let s = std::str::from_utf8(&self.buf[..end])
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.buf[..end]).into_owned());

        self.buf.advance(end + 1); // Skip the null terminator
        Ok(s)
    }
}

/// Write one frame: optional tag, then a length that covers itself and the body.
fn write_frame(buf: &mut BytesMut, tag: Option<u8>, body: impl FnOnce(&mut BytesMut)) {
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let start = buf.len();
    // Placeholder for length (filled in at the end)
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Read error/notice response fields
fn read_error_fields(r: &mut Reader) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while r.remaining() > 0 {
        let field_type = r.u8()?;
        if field_type == 0 {
            break;
        }
        let value = r.cstr()?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

fn put_error_fields(buf: &mut BytesMut, fields: &HashMap<u8, String>) {
    let mut codes: Vec<_> = fields.keys().copied().collect();
    codes.sort_unstable();
    for code in codes {
        buf.put_u8(code);
        put_cstr(buf, &fields[&code]);
    }
    buf.put_u8(0);
}

fn read_copy_response(r: &mut Reader) -> PgResult<(Format, Vec<Format>)> {
    let format = Format::from_code(r.u8()? as i16);
    let column_formats = r.formats()?;
    Ok((format, column_formats))
}

fn put_copy_response(buf: &mut BytesMut, format: Format, column_formats: &[Format]) {
    buf.put_u8(format.code() as u8);
    buf.put_i16(column_formats.len() as i16);
    for fmt in column_formats {
        buf.put_i16(fmt.code());
    }
}
