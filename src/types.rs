//! PostgreSQL type identifiers, values and the row decoder registry.
//!
//! Column values are decoded by looking up `(type OID, format)` in a
//! [`TypeRegistry`]. Registries are layered: a call-scoped registry wins over
//! the connection-scoped one, which wins over the built-in decoders below.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;

use crate::error::{PgError, PgResult};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const TIMETZ: Oid = Oid(1266);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    /// Any nonzero code means binary.
    pub fn from_code(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }

    #[inline]
    pub fn code(self) -> i16 {
        self as i16
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;
/// Days between 1970-01-01 and 2000-01-01.
const PG_EPOCH_OFFSET_DAYS: i32 = 10_957;

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(uuid::Uuid),
    /// Microseconds since 2000-01-01 00:00:00
    Timestamp(i64),
    /// Days since 2000-01-01
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    Json(serde_json::Value),
    /// Types without a decoder keep their raw bytes.
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(*v as i64),
            PgValue::Int4(v) => Some(*v as i64),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![if *v { 1 } else { 0 }],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.as_bytes().to_vec(),
            PgValue::Timestamp(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // jsonb binary format: version byte followed by the text
                let mut out = vec![1u8];
                out.extend_from_slice(v.to_string().as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null | PgValue::Text(_) => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Wire format used when sending this value as a Bind parameter.
    ///
    /// Text goes out in text format with an unspecified type so the server
    /// can coerce it to whatever the statement expects.
    pub fn param_format(&self) -> Format {
        match self {
            PgValue::Null | PgValue::Text(_) => Format::Text,
            _ => Format::Binary,
        }
    }

    /// Bytes for a Bind parameter, `None` for NULL.
    pub fn encode_param(&self) -> Option<Vec<u8>> {
        match self {
            PgValue::Null => None,
            PgValue::Text(s) => Some(s.as_bytes().to_vec()),
            other => Some(other.encode_binary()),
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        match oid {
            Oid::BOOL => {
                if data.is_empty() {
                    return Err(PgError::Type("Empty data for BOOL".to_string()));
                }
                Ok(PgValue::Bool(data[0] != 0))
            }
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?))),
            _ if oid.is_text_like() => String::from_utf8(data.to_vec())
                .map(PgValue::Text)
                .map_err(|e| PgError::Type(format!("Invalid UTF-8 in TEXT: {}", e))),
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(uuid::Uuid::from_bytes(fixed(data, "UUID")?))),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Ok(PgValue::Timestamp(i64::from_be_bytes(
                fixed(data, "TIMESTAMP")?,
            ))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed(data, "DATE")?))),
            Oid::TIME | Oid::TIMETZ => {
                if data.len() < 8 {
                    return Err(PgError::Type(format!(
                        "Invalid TIME length: {}",
                        data.len()
                    )));
                }
                Ok(PgValue::Time(i64::from_be_bytes(fixed(&data[..8], "TIME")?)))
            }
            Oid::JSON | Oid::JSONB => {
                // JSONB has a version byte prefix
                let json_data = if oid == Oid::JSONB && !data.is_empty() {
                    &data[1..]
                } else {
                    data
                };
                serde_json::from_slice(json_data)
                    .map(PgValue::Json)
                    .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))
            }
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format.
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = String::from_utf8_lossy(data);

        match oid {
            Oid::BOOL => Ok(PgValue::Bool(text == "t" || text == "true" || text == "1")),
            Oid::INT2 => text
                .parse::<i16>()
                .map(PgValue::Int2)
                .map_err(|e| PgError::Type(format!("Invalid INT2: {}", e))),
            Oid::INT4 => text
                .parse::<i32>()
                .map(PgValue::Int4)
                .map_err(|e| PgError::Type(format!("Invalid INT4: {}", e))),
            Oid::INT8 => text
                .parse::<i64>()
                .map(PgValue::Int8)
                .map_err(|e| PgError::Type(format!("Invalid INT8: {}", e))),
            Oid::FLOAT4 => text
                .parse::<f32>()
                .map(PgValue::Float4)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT4: {}", e))),
            Oid::FLOAT8 => text
                .parse::<f64>()
                .map(PgValue::Float8)
                .map_err(|e| PgError::Type(format!("Invalid FLOAT8: {}", e))),
            Oid::BYTEA => decode_bytea_hex(data).map(PgValue::Bytea),
            Oid::UUID => uuid::Uuid::parse_str(&text)
                .map(PgValue::Uuid)
                .map_err(|e| PgError::Type(format!("Invalid UUID: {}", e))),
            Oid::JSON | Oid::JSONB => serde_json::from_str(&text)
                .map(PgValue::Json)
                .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e))),
            Oid::DATE => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map(|d| {
                    let unix_days = d.signed_duration_since(NaiveDate::default()).num_days();
                    PgValue::Date(unix_days as i32 - PG_EPOCH_OFFSET_DAYS)
                })
                .map_err(|e| PgError::Type(format!("Invalid DATE: {}", e))),
            Oid::TIMESTAMP => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|ts| {
                    PgValue::Timestamp(ts.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS)
                })
                .map_err(|e| PgError::Type(format!("Invalid TIMESTAMP: {}", e))),
            Oid::TIMESTAMPTZ => parse_timestamptz(&text)
                .map(|micros| PgValue::Timestamp(micros - PG_EPOCH_OFFSET_MICROS)),
            Oid::TIME => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .map(|t| {
                    let since_midnight = t.signed_duration_since(NaiveTime::MIN);
                    PgValue::Time(since_midnight.num_microseconds().unwrap_or(0))
                })
                .map_err(|e| PgError::Type(format!("Invalid TIME: {}", e))),
            // Default: treat as text
            _ => Ok(PgValue::Text(text.into_owned())),
        }
    }
}

fn fixed<const N: usize>(data: &[u8], what: &str) -> PgResult<[u8; N]> {
    data.try_into()
        .map_err(|_| PgError::Type(format!("Invalid {} length: {}", what, data.len())))
}

/// `\x` hex output is the server default since 9.0.
fn decode_bytea_hex(data: &[u8]) -> PgResult<Vec<u8>> {
    let hex = data
        .strip_prefix(b"\\x")
        .ok_or_else(|| PgError::Type("BYTEA text is not in hex format".to_string()))?;
    if hex.len() % 2 != 0 {
        return Err(PgError::Type("Odd-length BYTEA hex string".to_string()));
    }
    hex.chunks_exact(2)
        .map(|pair| Ok((hex_nibble(pair[0])? << 4) | hex_nibble(pair[1])?))
        .collect()
}

fn hex_nibble(byte: u8) -> PgResult<u8> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(PgError::Type(format!("Invalid BYTEA hex digit: {:#04x}", byte))),
    }
}

/// The server prints offsets as `+HH`, `+HH:MM` or `+HH:MM:SS`.
fn parse_timestamptz(text: &str) -> PgResult<i64> {
    let candidates = [text.to_string(), format!("{}:00", text)];
    for candidate in &candidates {
        if let Ok(ts) = DateTime::parse_from_str(candidate, "%Y-%m-%d %H:%M:%S%.f%:z") {
            return Ok(ts.timestamp_micros());
        }
    }
    Err(PgError::Type(format!("Invalid TIMESTAMPTZ: {}", text)))
}

// ============================================================================
// Decoder Registry
// ============================================================================

/// A decoder for one column value.
pub type DecodeFn = Arc<dyn Fn(&[u8]) -> PgResult<PgValue> + Send + Sync>;

/// A set of decoders keyed by `(type OID, format)`.
///
/// Registries only hold overrides; anything not registered falls through to
/// the next scope and finally to the built-in decoders.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    decoders: HashMap<(Oid, Format), DecodeFn>,
}

static EMPTY_REGISTRY: Lazy<Arc<TypeRegistry>> = Lazy::new(|| Arc::new(TypeRegistry::new()));

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared registry with no overrides.
    pub fn empty() -> Arc<TypeRegistry> {
        Arc::clone(&EMPTY_REGISTRY)
    }

    /// Register a decoder, replacing any previous one for the same key.
    pub fn register<F>(&mut self, oid: Oid, format: Format, decode: F)
    where
        F: Fn(&[u8]) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.decoders.insert((oid, format), Arc::new(decode));
    }

    /// Builder form of [`TypeRegistry::register`].
    pub fn with<F>(mut self, oid: Oid, format: Format, decode: F) -> Self
    where
        F: Fn(&[u8]) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.register(oid, format, decode);
        self
    }

    pub fn get(&self, oid: Oid, format: Format) -> Option<&DecodeFn> {
        self.decoders.get(&(oid, format))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.decoders.keys().collect();
        keys.sort_by_key(|(oid, format)| (oid.0, format.code()));
        f.debug_struct("TypeRegistry").field("decoders", &keys).finish()
    }
}

/// The decoder chosen for one column of a result set.
#[derive(Clone)]
pub(crate) enum ColumnDecoder {
    Custom(DecodeFn),
    Builtin(Oid, Format),
}

impl fmt::Debug for ColumnDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnDecoder::Custom(_) => f.write_str("Custom"),
            ColumnDecoder::Builtin(oid, format) => write!(f, "Builtin({}, {:?})", oid, format),
        }
    }
}

impl ColumnDecoder {
    /// Resolve a decoder: call scope, then connection scope, then built-in.
    pub(crate) fn resolve(
        oid: Oid,
        format: Format,
        call: Option<&TypeRegistry>,
        connection: &TypeRegistry,
    ) -> Self {
        call.and_then(|r| r.get(oid, format))
            .or_else(|| connection.get(oid, format))
            .map(|f| ColumnDecoder::Custom(Arc::clone(f)))
            .unwrap_or(ColumnDecoder::Builtin(oid, format))
    }

    pub(crate) fn decode(&self, data: &[u8]) -> PgResult<PgValue> {
        match self {
            ColumnDecoder::Custom(f) => panic::catch_unwind(AssertUnwindSafe(|| f(data)))
                .unwrap_or_else(|_| Err(PgError::Type("custom decoder panicked".to_string()))),
            ColumnDecoder::Builtin(oid, Format::Text) => PgValue::decode_text(*oid, data),
            ColumnDecoder::Builtin(oid, Format::Binary) => PgValue::decode_binary(*oid, data),
        }
    }
}
