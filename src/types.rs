//! PostgreSQL type encoding and decoding.
//!
//! Binary format codecs for the built-in types, plus the process-wide
//! registry mapping pool name x type OID to a codec descriptor. The
//! registry is refreshable on demand through a pluggable hook; the hook
//! owns its own backend session so an in-flight query's protocol stream
//! is never touched.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

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

// ============================================================================
// PostgreSQL Values
// ============================================================================

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
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    // (integer_datetimes is assumed on)
    Timestamp(i64),
    Date(i32),
    Time(i64),
    Json(String),
    // For types without a registered codec - raw bytes pass through
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
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
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => v.as_bytes().to_vec(),
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Get the OID for this value's type.
    ///
    /// NULL does not pin a type; callers must go through statement
    /// description before binding it.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid(0),
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Decode a value from binary format using the built-in codec for
    /// the OID. Unknown OIDs pass through as raw bytes.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        match TypeCodec::for_builtin(oid) {
            Some(codec) => codec.decode(oid, data),
            None => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::Int2(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f32> for PgValue {
    fn from(v: f32) -> Self {
        PgValue::Float4(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for PgValue {
    fn from(v: Vec<u8>) -> Self {
        PgValue::Bytea(v)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => PgValue::Null,
        }
    }
}

/// True if any parameter's runtime value does not unambiguously pin a
/// PostgreSQL type, in which case the extended-query flow fetches a
/// ParameterDescription before binding.
pub fn bind_requires_statement_description(params: &[PgValue]) -> bool {
    params.iter().any(|p| matches!(p, PgValue::Null))
}

// ============================================================================
// Codec descriptors
// ============================================================================

/// Binary-format codec for one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCodec {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytea,
    Uuid,
    Timestamp,
    Date,
    Time,
    Json,
    Jsonb,
}

impl TypeCodec {
    /// The codec for a built-in OID, if there is one.
    pub fn for_builtin(oid: Oid) -> Option<TypeCodec> {
        match oid {
            Oid::BOOL => Some(TypeCodec::Bool),
            Oid::INT2 => Some(TypeCodec::Int2),
            Oid::INT4 | Oid::OID_TYPE => Some(TypeCodec::Int4),
            Oid::INT8 => Some(TypeCodec::Int8),
            Oid::FLOAT4 => Some(TypeCodec::Float4),
            Oid::FLOAT8 => Some(TypeCodec::Float8),
            Oid::BYTEA => Some(TypeCodec::Bytea),
            Oid::UUID => Some(TypeCodec::Uuid),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Some(TypeCodec::Timestamp),
            Oid::DATE => Some(TypeCodec::Date),
            Oid::TIME | Oid::TIMETZ => Some(TypeCodec::Time),
            Oid::JSON => Some(TypeCodec::Json),
            Oid::JSONB => Some(TypeCodec::Jsonb),
            _ if oid.is_text_like() => Some(TypeCodec::Text),
            _ => None,
        }
    }

    /// Decode a binary value. Malformed payloads for a known type are
    /// codec errors; they never pass through silently.
    pub fn decode(self, _oid: Oid, data: &[u8]) -> Result<PgValue> {
        match self {
            TypeCodec::Bool => {
                if data.is_empty() {
                    return Err(Error::Codec("empty data for BOOL".to_string()));
                }
                Ok(PgValue::Bool(data[0] != 0))
            }

            TypeCodec::Int2 => {
                let data: [u8; 2] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid INT2 length: {}", data.len())))?;
                Ok(PgValue::Int2(i16::from_be_bytes(data)))
            }

            TypeCodec::Int4 => {
                let data: [u8; 4] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid INT4 length: {}", data.len())))?;
                Ok(PgValue::Int4(i32::from_be_bytes(data)))
            }

            TypeCodec::Int8 => {
                let data: [u8; 8] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid INT8 length: {}", data.len())))?;
                Ok(PgValue::Int8(i64::from_be_bytes(data)))
            }

            TypeCodec::Float4 => {
                let data: [u8; 4] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid FLOAT4 length: {}", data.len())))?;
                Ok(PgValue::Float4(f32::from_be_bytes(data)))
            }

            TypeCodec::Float8 => {
                let data: [u8; 8] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid FLOAT8 length: {}", data.len())))?;
                Ok(PgValue::Float8(f64::from_be_bytes(data)))
            }

            TypeCodec::Text => match std::str::from_utf8(data) {
                Ok(_) => {
                    // SAFETY: just validated that data is valid UTF-8
                    let s = unsafe { String::from_utf8_unchecked(data.to_vec()) };
                    Ok(PgValue::Text(s))
                }
                Err(e) => Err(Error::Codec(format!("invalid UTF-8 in TEXT: {e}"))),
            },

            TypeCodec::Bytea => Ok(PgValue::Bytea(data.to_vec())),

            TypeCodec::Uuid => {
                let data: [u8; 16] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid UUID length: {}", data.len())))?;
                Ok(PgValue::Uuid(data))
            }

            TypeCodec::Timestamp => {
                let data: [u8; 8] = data.try_into().map_err(|_| {
                    Error::Codec(format!("invalid TIMESTAMP length: {}", data.len()))
                })?;
                Ok(PgValue::Timestamp(i64::from_be_bytes(data)))
            }

            TypeCodec::Date => {
                let data: [u8; 4] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("invalid DATE length: {}", data.len())))?;
                Ok(PgValue::Date(i32::from_be_bytes(data)))
            }

            TypeCodec::Time => {
                if data.len() < 8 {
                    return Err(Error::Codec(format!("invalid TIME length: {}", data.len())));
                }
                Ok(PgValue::Time(i64::from_be_bytes(
                    data[..8].try_into().unwrap(),
                )))
            }

            TypeCodec::Json | TypeCodec::Jsonb => {
                // JSONB has a version byte prefix
                let json_data = if self == TypeCodec::Jsonb && !data.is_empty() {
                    &data[1..]
                } else {
                    data
                };
                match std::str::from_utf8(json_data) {
                    Ok(_) => {
                        // SAFETY: just validated that json_data is valid UTF-8
                        let s = unsafe { String::from_utf8_unchecked(json_data.to_vec()) };
                        Ok(PgValue::Json(s))
                    }
                    Err(e) => Err(Error::Codec(format!("invalid UTF-8 in JSON: {e}"))),
                }
            }
        }
    }
}

/// A registered type: its OID, catalog name, and binary codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    pub oid: Oid,
    pub name: String,
    pub codec: TypeCodec,
}

impl TypeInfo {
    pub fn new(oid: Oid, name: impl Into<String>, codec: TypeCodec) -> Self {
        Self {
            oid,
            name: name.into(),
            codec,
        }
    }
}

// ============================================================================
// Type registry
// ============================================================================

/// Hook for resolving OIDs the registry does not know.
///
/// Implementations typically open a dedicated backend session and query
/// `pg_type`/`pg_range`; the registry publishes whatever they return.
#[async_trait]
pub trait OidRefresh: Send + Sync {
    async fn lookup(&self, pool: &str, oids: &[Oid]) -> Vec<TypeInfo>;
}

type Snapshot = Arc<HashMap<(String, Oid), TypeInfo>>;

/// Process-wide type registry keyed by pool name x OID.
///
/// Reads clone the current snapshot; refresh builds a new map and swaps
/// it in atomically, so in-flight decoders never observe a partial
/// update.
pub struct TypeRegistry {
    snapshot: RwLock<Snapshot>,
    refresher: RwLock<Option<Arc<dyn OidRefresh>>>,
}

impl TypeRegistry {
    fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            refresher: RwLock::new(None),
        }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static TypeRegistry {
        static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();
        REGISTRY.get_or_init(TypeRegistry::new)
    }

    /// Install the refresh hook used for unknown OIDs.
    pub fn set_refresh(&self, hook: Arc<dyn OidRefresh>) {
        *self.refresher.write() = Some(hook);
    }

    /// Seed the built-in types for a pool. Called when the pool starts.
    pub fn register_builtins(&self, pool: &str) {
        let builtins = [
            (Oid::BOOL, "bool"),
            (Oid::BYTEA, "bytea"),
            (Oid::CHAR, "char"),
            (Oid::NAME, "name"),
            (Oid::INT8, "int8"),
            (Oid::INT2, "int2"),
            (Oid::INT4, "int4"),
            (Oid::TEXT, "text"),
            (Oid::OID_TYPE, "oid"),
            (Oid::FLOAT4, "float4"),
            (Oid::FLOAT8, "float8"),
            (Oid::VARCHAR, "varchar"),
            (Oid::BPCHAR, "bpchar"),
            (Oid::DATE, "date"),
            (Oid::TIME, "time"),
            (Oid::TIMESTAMP, "timestamp"),
            (Oid::TIMESTAMPTZ, "timestamptz"),
            (Oid::TIMETZ, "timetz"),
            (Oid::UUID, "uuid"),
            (Oid::JSON, "json"),
            (Oid::JSONB, "jsonb"),
        ];

        let infos = builtins.iter().filter_map(|(oid, name)| {
            TypeCodec::for_builtin(*oid).map(|codec| TypeInfo::new(*oid, *name, codec))
        });
        self.publish(pool, infos);
    }

    /// Look up the descriptor for an OID in a pool's namespace.
    pub fn lookup(&self, pool: &str, oid: Oid) -> Option<TypeInfo> {
        self.snapshot
            .read()
            .get(&(pool.to_string(), oid))
            .cloned()
    }

    /// The subset of `oids` with no registered descriptor.
    pub fn missing(&self, pool: &str, oids: &[Oid]) -> Vec<Oid> {
        let snapshot = self.snapshot.read().clone();
        oids.iter()
            .copied()
            .filter(|oid| oid.as_i32() != 0 && !snapshot.contains_key(&(pool.to_string(), *oid)))
            .collect()
    }

    /// Resolve unknown OIDs through the refresh hook and publish the
    /// results. A registry without a hook leaves them unknown; their
    /// values will pass through as raw bytes.
    pub async fn refresh(&self, pool: &str, oids: &[Oid]) {
        if oids.is_empty() {
            return;
        }
        let hook = self.refresher.read().clone();
        if let Some(hook) = hook {
            let infos = hook.lookup(pool, oids).await;
            self.publish(pool, infos);
        }
    }

    fn publish(&self, pool: &str, infos: impl IntoIterator<Item = TypeInfo>) {
        let mut guard = self.snapshot.write();
        let mut next: HashMap<(String, Oid), TypeInfo> = (**guard).clone();
        for info in infos {
            next.insert((pool.to_string(), info.oid), info);
        }
        *guard = Arc::new(next);
    }

    /// Decode one column value. NULL decodes to `PgValue::Null`; OIDs
    /// without a descriptor pass through as raw bytes and never fail the
    /// query.
    pub fn decode_value(&self, pool: &str, oid: Oid, data: Option<&[u8]>) -> Result<PgValue> {
        let Some(data) = data else {
            return Ok(PgValue::Null);
        };
        match self.lookup(pool, oid) {
            Some(info) => info.codec.decode(oid, data),
            None => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());
    }

    #[test]
    fn test_int4_roundtrip() {
        let original = PgValue::Int4(12345);
        let encoded = original.encode_binary();
        let decoded = PgValue::decode_binary(Oid::INT4, &encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_text_roundtrip() {
        let original = PgValue::Text("hello world".to_string());
        let encoded = original.encode_binary();
        let decoded = PgValue::decode_binary(Oid::TEXT, &encoded).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_bool_roundtrip() {
        let true_val = PgValue::Bool(true);
        let false_val = PgValue::Bool(false);

        assert_eq!(
            PgValue::decode_binary(Oid::BOOL, &true_val.encode_binary()).unwrap(),
            true_val
        );
        assert_eq!(
            PgValue::decode_binary(Oid::BOOL, &false_val.encode_binary()).unwrap(),
            false_val
        );
    }

    #[test]
    fn test_unknown_oid_passes_through_raw() {
        let data = [1u8, 2, 3];
        let decoded = PgValue::decode_binary(Oid(99999), &data).unwrap();
        assert_eq!(
            decoded,
            PgValue::Raw {
                oid: Oid(99999),
                data: data.to_vec()
            }
        );
    }

    #[test]
    fn test_malformed_known_type_is_codec_error() {
        let err = PgValue::decode_binary(Oid::INT4, &[1, 2]).unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_null_requires_describe() {
        assert!(bind_requires_statement_description(&[
            PgValue::Int4(1),
            PgValue::Null
        ]));
        assert!(!bind_requires_statement_description(&[
            PgValue::Int4(1),
            PgValue::Text("x".into())
        ]));
    }

    #[test]
    fn test_registry_decode_and_refresh_publication() {
        let registry = TypeRegistry::new();
        registry.register_builtins("p1");

        // Known OID decodes through its codec
        let v = registry
            .decode_value("p1", Oid::INT4, Some(&7i32.to_be_bytes()))
            .unwrap();
        assert_eq!(v, PgValue::Int4(7));

        // NULL decodes to Null regardless of OID
        assert_eq!(
            registry.decode_value("p1", Oid::INT4, None).unwrap(),
            PgValue::Null
        );

        // Namespaces are per pool
        assert!(registry.lookup("p2", Oid::INT4).is_none());
        assert_eq!(registry.missing("p2", &[Oid::INT4]), vec![Oid::INT4]);
        assert!(registry.missing("p1", &[Oid::INT4]).is_empty());

        // Unknown OID passes through raw until someone registers it
        let custom = Oid(60000);
        let v = registry.decode_value("p1", custom, Some(b"x")).unwrap();
        assert!(matches!(v, PgValue::Raw { .. }));

        registry.publish("p1", [TypeInfo::new(custom, "mytext", TypeCodec::Text)]);
        let v = registry.decode_value("p1", custom, Some(b"x")).unwrap();
        assert_eq!(v, PgValue::Text("x".to_string()));
    }

    #[tokio::test]
    async fn test_refresh_hook_is_invoked() {
        struct Fixed;

        #[async_trait]
        impl OidRefresh for Fixed {
            async fn lookup(&self, _pool: &str, oids: &[Oid]) -> Vec<TypeInfo> {
                oids.iter()
                    .map(|oid| TypeInfo::new(*oid, "citext", TypeCodec::Text))
                    .collect()
            }
        }

        let registry = TypeRegistry::new();
        registry.set_refresh(Arc::new(Fixed));

        let oid = Oid(70000);
        registry.refresh("p1", &[oid]).await;
        assert_eq!(registry.lookup("p1", oid).unwrap().name, "citext");
    }
}
