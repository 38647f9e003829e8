//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Cancel request code, sent in place of a protocol version.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// SSL request code, sent in place of a protocol version.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators from ReadyForQuery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage: Send + Sync {
    fn encode(&self) -> BytesMut;
}

/// Startup message sent at connection start.
///
/// Parameters are an ordered list of key/value pairs; the first two are
/// conventionally `user` and `database`.
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub params: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();

        // Placeholder for length (filled in at the end)
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        for (key, value) in &self.params {
            buf.put_slice(key.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }

        // Terminator
        buf.put_u8(0);

        // Fill in length (includes length field itself)
        let len = buf.len() as i32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());

        buf
    }
}

/// SSL request probe. The server answers with a single byte:
/// 'S' to proceed with TLS, 'N' to refuse.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl FrontendMessage for SslRequest {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
        buf
    }
}

/// Cancel request, sent on a fresh connection in place of a startup
/// message to cancel the query running on another backend.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
        buf
    }
}

/// Password message (for MD5 or cleartext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'p');

        let len = 4 + self.password.len() as i32 + 1;
        buf.put_i32(len);

        buf.put_slice(self.password.as_bytes());
        buf.put_u8(0);

        buf
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Q');

        let len = 4 + self.query.len() as i32 + 1;
        buf.put_i32(len);

        buf.put_slice(self.query.as_bytes());
        buf.put_u8(0);

        buf
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'P');

        let mut body = BytesMut::new();

        body.put_slice(self.name.as_bytes());
        body.put_u8(0);

        body.put_slice(self.query.as_bytes());
        body.put_u8(0);

        body.put_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            body.put_i32(oid.as_i32());
        }

        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(&body);

        buf
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement.
///
/// Parameters arrive pre-encoded in binary format (`None` for NULL);
/// every parameter and every result column is declared binary.
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub params: Vec<Option<Vec<u8>>>,
}

impl FrontendMessage for BindMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');

        let mut body = BytesMut::new();

        body.put_slice(self.portal.as_bytes());
        body.put_u8(0);

        body.put_slice(self.statement.as_bytes());
        body.put_u8(0);

        // One format code per parameter, all binary
        body.put_i16(self.params.len() as i16);
        for _ in &self.params {
            body.put_i16(Format::Binary as i16);
        }

        body.put_i16(self.params.len() as i16);
        for param in &self.params {
            match param {
                Some(data) => {
                    body.put_i32(data.len() as i32);
                    body.put_slice(data);
                }
                None => body.put_i32(-1),
            }
        }

        // A single result format code applies to every result column
        body.put_i16(1);
        body.put_i16(Format::Binary as i16);

        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(&body);

        buf
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'E');

        let mut body = BytesMut::new();

        body.put_slice(self.portal.as_bytes());
        body.put_u8(0);
        body.put_i32(self.max_rows);

        buf.put_i32(body.len() as i32 + 4);
        buf.put_slice(&body);

        buf
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');

        let len = 4 + 1 + self.name.len() as i32 + 1;
        buf.put_i32(len);

        buf.put_u8(self.kind);
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(0);

        buf
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        buf.put_i32(4);
        buf
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'H');
        buf.put_i32(4);
        buf
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(b'X');
        buf.put_i32(4);
        buf
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
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
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationKerberosV5,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationScmCredential,
    AuthenticationGss,
    AuthenticationGssContinue,
    AuthenticationSspi,
    AuthenticationSasl {
        mechanisms: Vec<String>,
    },
    AuthenticationSaslContinue {
        data: Bytes,
    },
    AuthenticationSaslFinal {
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

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 5 {
            return Err(Error::UnexpectedMessage(
                "incomplete message header".to_string(),
            ));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32() as usize;

        if len < 4 || buf.remaining() < len - 4 {
            return Err(Error::UnexpectedMessage(
                "incomplete message body".to_string(),
            ));
        }

        let body = buf.split_to(len - 4);

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Self::decode_command_complete(body),
            b'Z' => Self::decode_ready_for_query(body),
            b'E' => Self::decode_error_response(body),
            b'N' => Self::decode_notice_response(body),
            b'S' => Self::decode_parameter_status(body),
            b'K' => Self::decode_backend_key_data(body),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => Self::decode_notification_response(body),
            _ => Err(Error::UnexpectedMessage(format!(
                "unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    /// Short name used when reporting a message the state machine did not
    /// expect.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationKerberosV5 => "AuthenticationKerberosV5",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationScmCredential => "AuthenticationScmCredential",
            BackendMessage::AuthenticationGss => "AuthenticationGSS",
            BackendMessage::AuthenticationGssContinue => "AuthenticationGSSContinue",
            BackendMessage::AuthenticationSspi => "AuthenticationSSPI",
            BackendMessage::AuthenticationSasl { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationSaslContinue { .. } => "AuthenticationSASLContinue",
            BackendMessage::AuthenticationSaslFinal { .. } => "AuthenticationSASLFinal",
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
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
        }
    }

    fn decode_auth(mut body: Bytes) -> Result<Self> {
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            2 => Ok(BackendMessage::AuthenticationKerberosV5),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                if body.remaining() < 4 {
                    return Err(Error::UnexpectedMessage(
                        "truncated md5 password challenge".to_string(),
                    ));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&body[..4]);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            6 => Ok(BackendMessage::AuthenticationScmCredential),
            7 => Ok(BackendMessage::AuthenticationGss),
            8 => Ok(BackendMessage::AuthenticationGssContinue),
            9 => Ok(BackendMessage::AuthenticationSspi),
            10 => {
                let mut mechanisms = Vec::new();
                while body.remaining() > 0 {
                    let mech = read_cstring(&mut body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSasl { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSaslContinue { data: body }),
            12 => Ok(BackendMessage::AuthenticationSaslFinal { data: body }),
            _ => Err(Error::UnexpectedMessage(format!(
                "unknown authentication type: {auth_type}"
            ))),
        }
    }

    fn decode_row_description(mut body: Bytes) -> Result<Self> {
        let num_fields = body.get_i16() as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            let table_oid = body.get_i32();
            let column_attr = body.get_i16();
            let type_oid = Oid::from_i32(body.get_i32());
            let type_size = body.get_i16();
            let type_modifier = body.get_i32();
            let format = if body.get_i16() == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(mut body: Bytes) -> Result<Self> {
        let num_cols = body.get_i16() as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                let data = body.split_to(len as usize);
                values.push(Some(data));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_command_complete(mut body: Bytes) -> Result<Self> {
        let tag = read_cstring(&mut body)?;
        Ok(BackendMessage::CommandComplete { tag })
    }

    fn decode_ready_for_query(mut body: Bytes) -> Result<Self> {
        let status = TransactionStatus::from(body.get_u8());
        Ok(BackendMessage::ReadyForQuery { status })
    }

    fn decode_error_response(body: Bytes) -> Result<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::ErrorResponse { fields })
    }

    fn decode_notice_response(body: Bytes) -> Result<Self> {
        let fields = read_error_fields(body)?;
        Ok(BackendMessage::NoticeResponse { fields })
    }

    fn decode_parameter_status(mut body: Bytes) -> Result<Self> {
        let name = read_cstring(&mut body)?;
        let value = read_cstring(&mut body)?;
        Ok(BackendMessage::ParameterStatus { name, value })
    }

    fn decode_backend_key_data(mut body: Bytes) -> Result<Self> {
        let process_id = body.get_i32();
        let secret_key = body.get_i32();
        Ok(BackendMessage::BackendKeyData {
            process_id,
            secret_key,
        })
    }

    fn decode_parameter_description(mut body: Bytes) -> Result<Self> {
        let num_params = body.get_i16() as usize;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.get_i32()));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }

    fn decode_notification_response(mut body: Bytes) -> Result<Self> {
        let process_id = body.get_i32();
        let channel = read_cstring(&mut body)?;
        let payload = read_cstring(&mut body)?;

        Ok(BackendMessage::NotificationResponse {
            process_id,
            channel,
            payload,
        })
    }
}

// ============================================================================
// Command Tags
// ============================================================================

/// The verb of a completed command, lowercased into a closed enum with a
/// catch-all for verbs this client does not name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Select,
    Insert,
    Update,
    Delete,
    Fetch,
    Move,
    Copy,
    Commit,
    Rollback,
    Other(String),
}

/// A decoded CommandComplete tag.
///
/// `counts` carries the numeric suffix(es) of counted verbs ("SELECT 5",
/// "INSERT 0 5"); `target` carries the lowercased object of verbs like
/// "CREATE TABLE" with inner spaces replaced by underscores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTag {
    pub command: Command,
    pub counts: Vec<u64>,
    pub target: Option<String>,
}

impl CommandTag {
    /// Parse a CommandComplete tag.
    ///
    /// `BEGIN` maps to `Command::Commit`, matching the system this client
    /// is wire-compatible with; the transaction runner relies on it.
    pub fn parse(tag: &str) -> CommandTag {
        let mut words = tag.split_whitespace();
        let verb = words.next().unwrap_or("");
        let rest: Vec<&str> = words.collect();

        let counted = |command: Command, n: &str| CommandTag {
            command,
            counts: vec![n.parse().unwrap_or(0)],
            target: None,
        };
        let bare = |command: Command| CommandTag {
            command,
            counts: Vec::new(),
            target: None,
        };

        match (verb, rest.as_slice()) {
            ("SELECT", [n]) => counted(Command::Select, n),
            // The oid column of INSERT tags is always discarded
            ("INSERT", [_oid, n]) => counted(Command::Insert, n),
            ("UPDATE", [n]) => counted(Command::Update, n),
            ("DELETE", [n]) => counted(Command::Delete, n),
            ("FETCH", [n]) => counted(Command::Fetch, n),
            ("MOVE", [n]) => counted(Command::Move, n),
            ("COPY", [n]) => counted(Command::Copy, n),
            ("BEGIN", []) | ("COMMIT", []) => bare(Command::Commit),
            ("ROLLBACK", []) => bare(Command::Rollback),
            (verb, []) => bare(Command::Other(verb.to_lowercase())),
            (verb, rest) => {
                let command = Command::Other(verb.to_lowercase());
                if rest[0].starts_with(|c: char| c.is_ascii_digit()) {
                    CommandTag {
                        command,
                        counts: rest.iter().map(|n| n.parse().unwrap_or(0)).collect(),
                        target: None,
                    }
                } else {
                    CommandTag {
                        command,
                        counts: Vec::new(),
                        target: Some(rest.join("_").to_lowercase()),
                    }
                }
            }
        }
    }

    /// Wire form of this tag. `parse(encode(t)) == t` for every tag this
    /// produces.
    pub fn encode(&self) -> String {
        let verb = match &self.command {
            Command::Select => "SELECT",
            Command::Insert => "INSERT",
            Command::Update => "UPDATE",
            Command::Delete => "DELETE",
            Command::Fetch => "FETCH",
            Command::Move => "MOVE",
            Command::Copy => "COPY",
            Command::Commit => "COMMIT",
            Command::Rollback => "ROLLBACK",
            Command::Other(v) => return self.encode_other(v),
        };

        match (self.counts.as_slice(), &self.command) {
            ([n], Command::Insert) => format!("{verb} 0 {n}"),
            ([n], _) => format!("{verb} {n}"),
            _ => verb.to_string(),
        }
    }

    fn encode_other(&self, verb: &str) -> String {
        let verb = verb.to_uppercase();
        if !self.counts.is_empty() {
            let counts: Vec<String> = self.counts.iter().map(|n| n.to_string()).collect();
            format!("{verb} {}", counts.join(" "))
        } else if let Some(target) = &self.target {
            format!("{verb} {}", target.replace('_', " ").to_uppercase())
        } else {
            verb
        }
    }

    /// The row count of counted verbs, 0 otherwise.
    pub fn rows(&self) -> u64 {
        self.counts.first().copied().unwrap_or(0)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Read a null-terminated string from the buffer.
/// Tries direct UTF-8 first, falls back to lossy only if invalid.
pub(crate) fn read_cstring(buf: &mut Bytes) -> Result<String> {
    let mut end = 0;
    while end < buf.remaining() && buf[end] != 0 {
        end += 1;
    }

    if end >= buf.remaining() {
        return Err(Error::UnexpectedMessage(
            "missing null terminator in string".to_string(),
        ));
    }

    let s = std::str::from_utf8(&buf[..end])
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(&buf[..end]).into_owned());

    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(mut body: Bytes) -> Result<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_message_structure() {
        let msg = StartupMessage {
            params: vec![
                ("user".to_string(), "test".to_string()),
                ("database".to_string(), "testdb".to_string()),
            ],
        };

        let encoded = msg.encode();

        // Length field covers the whole message
        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());

        let version = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(version, PROTOCOL_VERSION);

        // Parameter order is preserved and the message ends with the
        // empty-key terminator
        let body = &encoded[8..];
        assert_eq!(&body[..5], b"user\0");
        assert_eq!(encoded[encoded.len() - 1], 0);
    }

    #[test]
    fn test_ssl_request_structure() {
        let encoded = SslRequest.encode();
        assert_eq!(&encoded[..], &[0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F]);
    }

    #[test]
    fn test_cancel_request_structure() {
        let msg = CancelRequestMessage {
            process_id: 42,
            secret_key: 7,
        };
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 16);
        let code = i32::from_be_bytes([encoded[4], encoded[5], encoded[6], encoded[7]]);
        assert_eq!(code, CANCEL_REQUEST_CODE);
        let pid = i32::from_be_bytes([encoded[8], encoded[9], encoded[10], encoded[11]]);
        assert_eq!(pid, 42);
    }

    #[test]
    fn test_query_message_structure() {
        let msg = QueryMessage {
            query: "SELECT 1".to_string(),
        };

        let encoded = msg.encode();

        assert_eq!(encoded[0], b'Q');

        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1); // -1 for message type
    }

    #[test]
    fn test_bind_message_all_binary() {
        let msg = BindMessage {
            portal: String::new(),
            statement: "s1".to_string(),
            params: vec![Some(42i32.to_be_bytes().to_vec()), None],
        };

        let mut encoded = Bytes::from(msg.encode().to_vec());
        assert_eq!(encoded.get_u8(), b'B');
        let _len = encoded.get_i32();
        assert_eq!(read_cstring(&mut encoded).unwrap(), "");
        assert_eq!(read_cstring(&mut encoded).unwrap(), "s1");

        // Two parameter format codes, both binary
        assert_eq!(encoded.get_i16(), 2);
        assert_eq!(encoded.get_i16(), 1);
        assert_eq!(encoded.get_i16(), 1);

        // Two parameters: a 4-byte value and a NULL
        assert_eq!(encoded.get_i16(), 2);
        assert_eq!(encoded.get_i32(), 4);
        assert_eq!(encoded.get_i32(), 42);
        assert_eq!(encoded.get_i32(), -1);

        // One result format code applying to all columns, binary
        assert_eq!(encoded.get_i16(), 1);
        assert_eq!(encoded.get_i16(), 1);
    }

    #[test]
    fn test_authentication_ok_decoding() {
        let data: &[u8] = &[b'R', 0, 0, 0, 8, 0, 0, 0, 0];
        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(data)).unwrap();

        assert!(matches!(msg, BackendMessage::AuthenticationOk));
    }

    #[test]
    fn test_authentication_md5_decoding() {
        let data: &[u8] = &[b'R', 0, 0, 0, 12, 0, 0, 0, 5, 0x12, 0x34, 0x56, 0x78];
        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(data)).unwrap();

        match msg {
            BackendMessage::AuthenticationMD5Password { salt } => {
                assert_eq!(salt, [0x12, 0x34, 0x56, 0x78]);
            }
            _ => panic!("should decode as AuthenticationMD5Password"),
        }
    }

    #[test]
    fn test_ready_for_query_decoding() {
        let data: &[u8] = &[b'Z', 0, 0, 0, 5, b'I'];
        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(data)).unwrap();

        match msg {
            BackendMessage::ReadyForQuery { status } => {
                assert_eq!(status, TransactionStatus::Idle);
            }
            _ => panic!("should decode as ReadyForQuery"),
        }
    }

    #[test]
    fn test_row_description_decoding() {
        // One column "id" of type INT4, binary format
        let mut data = vec![b'T'];
        let mut body = BytesMut::new();

        body.put_i16(1);
        body.put_slice(b"id\0");
        body.put_i32(0); // table oid
        body.put_i16(0); // column attr
        body.put_i32(23); // type oid
        body.put_i16(4); // type size
        body.put_i32(-1); // type modifier
        body.put_i16(1); // format

        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&data)).unwrap();

        match msg {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 1);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].type_oid, Oid::INT4);
                assert_eq!(fields[0].format, Format::Binary);
            }
            _ => panic!("should decode as RowDescription"),
        }
    }

    #[test]
    fn test_data_row_decoding() {
        let mut data = vec![b'D'];
        let mut body = BytesMut::new();

        body.put_i16(2);
        // Column 1: INT4 value 42
        body.put_i32(4);
        body.put_i32(42);
        // Column 2: NULL
        body.put_i32(-1);

        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&data)).unwrap();

        match msg {
            BackendMessage::DataRow { values } => {
                assert_eq!(values.len(), 2);
                assert_eq!(
                    values[0],
                    Some(Bytes::copy_from_slice(&42i32.to_be_bytes()))
                );
                assert_eq!(values[1], None);
            }
            _ => panic!("should decode as DataRow"),
        }
    }

    #[test]
    fn test_command_complete_decoding() {
        let tag = b"SELECT 1\0";
        let mut data = vec![b'C'];
        data.extend_from_slice(&((tag.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(tag);

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&data)).unwrap();

        match msg {
            BackendMessage::CommandComplete { tag } => assert_eq!(tag, "SELECT 1"),
            _ => panic!("should decode as CommandComplete"),
        }
    }

    #[test]
    fn test_error_response_decoding() {
        let mut data = vec![b'E'];
        let mut body = BytesMut::new();

        body.put_slice(b"SERROR\0");
        body.put_slice(b"C42P01\0");
        body.put_slice(b"Mrelation \"foo\" does not exist\0");
        body.put_u8(0);

        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&data)).unwrap();

        match msg {
            BackendMessage::ErrorResponse { fields } => {
                assert_eq!(fields.get(&b'S'), Some(&"ERROR".to_string()));
                assert_eq!(fields.get(&b'C'), Some(&"42P01".to_string()));
                assert_eq!(
                    fields.get(&b'M'),
                    Some(&"relation \"foo\" does not exist".to_string())
                );
            }
            _ => panic!("should decode as ErrorResponse"),
        }
    }

    #[test]
    fn test_parse_and_bind_complete_decoding() {
        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&[b'1', 0, 0, 0, 4])).unwrap();
        assert!(matches!(msg, BackendMessage::ParseComplete));

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&[b'2', 0, 0, 0, 4])).unwrap();
        assert!(matches!(msg, BackendMessage::BindComplete));

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&[b'n', 0, 0, 0, 4])).unwrap();
        assert!(matches!(msg, BackendMessage::NoData));

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&[b's', 0, 0, 0, 4])).unwrap();
        assert!(matches!(msg, BackendMessage::PortalSuspended));
    }

    #[test]
    fn test_parameter_description_decoding() {
        let mut data = vec![b't'];
        let mut body = BytesMut::new();
        body.put_i16(2);
        body.put_i32(25);
        body.put_i32(23);

        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&data)).unwrap();

        match msg {
            BackendMessage::ParameterDescription { type_oids } => {
                assert_eq!(type_oids, vec![Oid::TEXT, Oid::INT4]);
            }
            _ => panic!("should decode as ParameterDescription"),
        }
    }

    #[test]
    fn test_notification_response_decoding() {
        let mut data = vec![b'A'];
        let mut body = BytesMut::new();
        body.put_i32(9001);
        body.put_slice(b"jobs\0");
        body.put_slice(b"wake up\0");

        data.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        data.extend_from_slice(&body);

        let msg = BackendMessage::decode(&mut Bytes::copy_from_slice(&data)).unwrap();

        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                assert_eq!(process_id, 9001);
                assert_eq!(channel, "jobs");
                assert_eq!(payload, "wake up");
            }
            _ => panic!("should decode as NotificationResponse"),
        }
    }

    #[test]
    fn test_command_tag_counted_verbs() {
        assert_eq!(
            CommandTag::parse("SELECT 5"),
            CommandTag {
                command: Command::Select,
                counts: vec![5],
                target: None
            }
        );
        assert_eq!(
            CommandTag::parse("INSERT 0 3"),
            CommandTag {
                command: Command::Insert,
                counts: vec![3],
                target: None
            }
        );
        assert_eq!(CommandTag::parse("UPDATE 2").command, Command::Update);
        assert_eq!(CommandTag::parse("DELETE 1").command, Command::Delete);
        assert_eq!(CommandTag::parse("FETCH 10").rows(), 10);
        assert_eq!(CommandTag::parse("MOVE 4").command, Command::Move);
        assert_eq!(CommandTag::parse("COPY 100").rows(), 100);
    }

    #[test]
    fn test_command_tag_begin_maps_to_commit() {
        assert_eq!(CommandTag::parse("BEGIN").command, Command::Commit);
        assert_eq!(CommandTag::parse("COMMIT").command, Command::Commit);
        assert_eq!(CommandTag::parse("ROLLBACK").command, Command::Rollback);
    }

    #[test]
    fn test_command_tag_freeform() {
        assert_eq!(
            CommandTag::parse("CREATE TABLE"),
            CommandTag {
                command: Command::Other("create".to_string()),
                counts: Vec::new(),
                target: Some("table".to_string()),
            }
        );
        assert_eq!(
            CommandTag::parse("ALTER TABLE"),
            CommandTag {
                command: Command::Other("alter".to_string()),
                counts: Vec::new(),
                target: Some("table".to_string()),
            }
        );
        assert_eq!(
            CommandTag::parse("DROP MATERIALIZED VIEW").target,
            Some("materialized_view".to_string())
        );
        assert_eq!(
            CommandTag::parse("LISTEN"),
            CommandTag {
                command: Command::Other("listen".to_string()),
                counts: Vec::new(),
                target: None,
            }
        );
        assert_eq!(
            CommandTag::parse("MERGE 1 2"),
            CommandTag {
                command: Command::Other("merge".to_string()),
                counts: vec![1, 2],
                target: None,
            }
        );
    }

    #[test]
    fn test_command_tag_round_trip() {
        let tags = [
            "SELECT 5",
            "INSERT 0 3",
            "UPDATE 2",
            "DELETE 0",
            "FETCH 10",
            "MOVE 4",
            "COPY 100",
            "COMMIT",
            "ROLLBACK",
            "CREATE TABLE",
            "DROP MATERIALIZED VIEW",
            "LISTEN",
            "MERGE 1 2",
        ];
        for wire in tags {
            let tag = CommandTag::parse(wire);
            assert_eq!(CommandTag::parse(&tag.encode()), tag, "tag {wire}");
            assert_eq!(tag.encode(), wire);
        }
        // BEGIN is not producible by the encoder; its parse collapses
        // into the COMMIT tag
        assert_eq!(CommandTag::parse("BEGIN").encode(), "COMMIT");
    }
}
