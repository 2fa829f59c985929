//! Server response packets: OK (with session-state tracking), ERR, EOF,
//! column definitions and the COM_STMT_PREPARE reply header.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::packet::{capabilities::*, status::*, Packet};

/// Wire-level decode failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet shorter than its declared payload")]
    Truncated,

    #[error("length-encoded value overruns the packet")]
    LengthOverrun,

    #[error("unexpected packet where {0} was required")]
    UnexpectedPacket(&'static str),

    #[error("malformed {0} packet")]
    Malformed(&'static str),

    #[error("empty payload")]
    EmptyPayload,
}

/// Read a length-encoded integer: `<0xfb` literal, `0xfc` u16, `0xfd` u24,
/// `0xfe` u64.
pub fn get_lenenc_int(buf: &mut &[u8]) -> Result<u64, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::LengthOverrun);
    }
    let first = buf.get_u8();
    match first {
        0..=0xFA => Ok(first as u64),
        0xFC => {
            if buf.remaining() < 2 {
                return Err(ProtocolError::LengthOverrun);
            }
            Ok(buf.get_u16_le() as u64)
        }
        0xFD => {
            if buf.remaining() < 3 {
                return Err(ProtocolError::LengthOverrun);
            }
            let mut v = buf.get_u16_le() as u64;
            v |= (buf.get_u8() as u64) << 16;
            Ok(v)
        }
        0xFE => {
            if buf.remaining() < 8 {
                return Err(ProtocolError::LengthOverrun);
            }
            Ok(buf.get_u64_le())
        }
        // 0xFB is the NULL marker, 0xFF never starts an integer
        _ => Err(ProtocolError::Malformed("length-encoded integer")),
    }
}

/// Write a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Read a length-encoded byte string
pub fn get_lenenc_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = get_lenenc_int(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::LengthOverrun);
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

/// Read a length-encoded string (lossy UTF-8)
pub fn get_lenenc_str(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    Ok(String::from_utf8_lossy(&get_lenenc_bytes(buf)?).to_string())
}

/// Write a length-encoded string
pub fn put_lenenc_str(buf: &mut BytesMut, s: &str) {
    put_lenenc_int(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// One entry of the session-state tracking trailer of an OK packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// SESSION_TRACK_SYSTEM_VARIABLES
    SystemVariable { name: String, value: String },
    /// SESSION_TRACK_SCHEMA
    Schema(String),
    /// SESSION_TRACK_STATE_CHANGE
    Tracked(bool),
    /// SESSION_TRACK_GTIDS
    Gtid(String),
    /// SESSION_TRACK_TRANSACTION_CHARACTERISTICS
    TransactionCharacteristics(String),
    /// SESSION_TRACK_TRANSACTION_STATE (8-character state string)
    TransactionState(String),
    /// Unknown tracker type, payload ignored
    Other(u8),
}

const TRACK_SYSTEM_VARIABLES: u8 = 0x00;
const TRACK_SCHEMA: u8 = 0x01;
const TRACK_STATE_CHANGE: u8 = 0x02;
const TRACK_GTIDS: u8 = 0x03;
const TRACK_TRANSACTION_CHARACTERISTICS: u8 = 0x04;
const TRACK_TRANSACTION_STATE: u8 = 0x05;

/// Parse the session-state tracking blob of an OK packet
pub fn parse_session_track(mut buf: &[u8]) -> Result<Vec<StateChange>, ProtocolError> {
    let mut changes = Vec::new();

    while !buf.is_empty() {
        let ty = buf.get_u8();
        let data = get_lenenc_bytes(&mut buf)?;
        let mut data = &data[..];

        let change = match ty {
            TRACK_SYSTEM_VARIABLES => StateChange::SystemVariable {
                name: get_lenenc_str(&mut data)?,
                value: get_lenenc_str(&mut data)?,
            },
            TRACK_SCHEMA => StateChange::Schema(get_lenenc_str(&mut data)?),
            TRACK_STATE_CHANGE => StateChange::Tracked(get_lenenc_bytes(&mut data)? == b"1"),
            TRACK_GTIDS => {
                // One byte of encoding spec, then the GTID text
                if data.is_empty() {
                    return Err(ProtocolError::Malformed("session track GTID"));
                }
                data.advance(1);
                StateChange::Gtid(get_lenenc_str(&mut data)?)
            }
            TRACK_TRANSACTION_CHARACTERISTICS => {
                StateChange::TransactionCharacteristics(get_lenenc_str(&mut data)?)
            }
            TRACK_TRANSACTION_STATE => StateChange::TransactionState(get_lenenc_str(&mut data)?),
            other => StateChange::Other(other),
        };

        changes.push(change);
    }

    Ok(changes)
}

/// Encode state changes into a session-track blob
pub fn encode_session_track(changes: &[StateChange]) -> BytesMut {
    let mut buf = BytesMut::new();

    for change in changes {
        let mut data = BytesMut::new();
        let ty = match change {
            StateChange::SystemVariable { name, value } => {
                put_lenenc_str(&mut data, name);
                put_lenenc_str(&mut data, value);
                TRACK_SYSTEM_VARIABLES
            }
            StateChange::Schema(schema) => {
                put_lenenc_str(&mut data, schema);
                TRACK_SCHEMA
            }
            StateChange::Tracked(t) => {
                put_lenenc_str(&mut data, if *t { "1" } else { "0" });
                TRACK_STATE_CHANGE
            }
            StateChange::Gtid(gtid) => {
                data.put_u8(0);
                put_lenenc_str(&mut data, gtid);
                TRACK_GTIDS
            }
            StateChange::TransactionCharacteristics(c) => {
                put_lenenc_str(&mut data, c);
                TRACK_TRANSACTION_CHARACTERISTICS
            }
            StateChange::TransactionState(s) => {
                put_lenenc_str(&mut data, s);
                TRACK_TRANSACTION_STATE
            }
            StateChange::Other(ty) => *ty,
        };
        buf.put_u8(ty);
        put_lenenc_int(&mut buf, data.len() as u64);
        buf.extend_from_slice(&data);
    }

    buf
}

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
    pub state_changes: Vec<StateChange>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Default::default()
        }
    }

    /// Parse from packet payload. The header byte may be 0x00 (OK) or 0xFE
    /// (result-set terminator under CLIENT_DEPRECATE_EOF).
    pub fn parse(payload: &[u8], capabilities: u32) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }
        if payload[0] != 0x00 && payload[0] != 0xFE {
            return Err(ProtocolError::UnexpectedPacket("OK"));
        }

        let mut buf = &payload[1..];
        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;

        let (mut status_flags, mut warnings) = (0u16, 0u16);
        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            if buf.remaining() < 4 {
                return Err(ProtocolError::Truncated);
            }
            status_flags = buf.get_u16_le();
            warnings = buf.get_u16_le();
        }

        let mut info = String::new();
        let mut state_changes = Vec::new();

        if capabilities & CLIENT_SESSION_TRACK != 0 {
            if !buf.is_empty() {
                info = get_lenenc_str(&mut buf)?;
            }
            if status_flags & SERVER_SESSION_STATE_CHANGED != 0 {
                let blob = get_lenenc_bytes(&mut buf)?;
                state_changes = parse_session_track(&blob)?;
            }
        } else {
            info = String::from_utf8_lossy(buf).to_string();
        }

        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            state_changes,
        })
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        if capabilities & CLIENT_SESSION_TRACK != 0 {
            put_lenenc_str(&mut buf, &self.info);
            if self.status_flags & SERVER_SESSION_STATE_CHANGED != 0 {
                let blob = encode_session_track(&self.state_changes);
                put_lenenc_int(&mut buf, blob.len() as u64);
                buf.extend_from_slice(&blob);
            }
        } else {
            buf.extend_from_slice(self.info.as_bytes());
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// ERR packet
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// An 08xxx SQL state marks the connection itself as unusable
    pub fn is_connection_fatal(&self) -> bool {
        self.sql_state.starts_with("08")
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Result<Self, ProtocolError> {
        if payload.is_empty() || payload[0] != 0xFF {
            return Err(ProtocolError::UnexpectedPacket("ERR"));
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return Err(ProtocolError::Truncated);
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) =
            if capabilities & CLIENT_PROTOCOL_41 != 0 && !buf.is_empty() && buf[0] == b'#' {
                buf.advance(1);
                if buf.len() >= 5 {
                    let sql_state = String::from_utf8_lossy(&buf[..5]).to_string();
                    buf.advance(5);
                    (sql_state, String::from_utf8_lossy(buf).to_string())
                } else {
                    ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
                }
            } else {
                ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
            };

        Ok(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// EOF packet (pre-DEPRECATE_EOF result set delimiter)
#[derive(Debug, Clone, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() || payload[0] != 0xFE || payload.len() >= 9 {
            return Err(ProtocolError::UnexpectedPacket("EOF"));
        }
        if payload.len() < 5 {
            // Pre-4.1 EOF carries no flags
            return Ok(Self::default());
        }
        let mut buf = &payload[1..];
        Ok(Self {
            warnings: buf.get_u16_le(),
            status_flags: buf.get_u16_le(),
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Protocol-41 column definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub catalog: String,
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = payload;

        let catalog = get_lenenc_str(&mut buf)?;
        let schema = get_lenenc_str(&mut buf)?;
        let table = get_lenenc_str(&mut buf)?;
        let org_table = get_lenenc_str(&mut buf)?;
        let name = get_lenenc_str(&mut buf)?;
        let org_name = get_lenenc_str(&mut buf)?;

        // Fixed-length fields, preceded by their length (always 0x0c)
        let fixed_len = get_lenenc_int(&mut buf)?;
        if fixed_len != 0x0c || buf.remaining() < 0x0c {
            return Err(ProtocolError::Malformed("column definition"));
        }

        let character_set = buf.get_u16_le();
        let column_length = buf.get_u32_le();
        let column_type = buf.get_u8();
        let flags = buf.get_u16_le();
        let decimals = buf.get_u8();
        // Two filler bytes follow

        Ok(Self {
            catalog,
            schema,
            table,
            org_table,
            name,
            org_name,
            character_set,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        put_lenenc_str(&mut buf, &self.catalog);
        put_lenenc_str(&mut buf, &self.schema);
        put_lenenc_str(&mut buf, &self.table);
        put_lenenc_str(&mut buf, &self.org_table);
        put_lenenc_str(&mut buf, &self.name);
        put_lenenc_str(&mut buf, &self.org_name);

        put_lenenc_int(&mut buf, 0x0c);
        buf.put_u16_le(self.character_set);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);

        Packet::new(sequence_id, buf.freeze())
    }
}

/// First packet of a successful COM_STMT_PREPARE response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warning_count: u16,
}

impl StmtPrepareOk {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() || payload[0] != 0x00 {
            return Err(ProtocolError::UnexpectedPacket("STMT_PREPARE_OK"));
        }
        if payload.len() < 12 {
            return Err(ProtocolError::Truncated);
        }

        let mut buf = &payload[1..];
        let statement_id = buf.get_u32_le();
        let num_columns = buf.get_u16_le();
        let num_params = buf.get_u16_le();
        buf.advance(1); // filler
        let warning_count = buf.get_u16_le();

        Ok(Self {
            statement_id,
            num_columns,
            num_params,
            warning_count,
        })
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(0x00);
        buf.put_u32_le(self.statement_id);
        buf.put_u16_le(self.num_columns);
        buf.put_u16_le(self.num_params);
        buf.put_u8(0);
        buf.put_u16_le(self.warning_count);
        Packet::new(sequence_id, buf.freeze())
    }
}

/// Check if packet is OK packet
pub fn is_ok_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

/// Check if packet is ERR packet
pub fn is_err_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

/// Check if packet is a legacy EOF packet
pub fn is_eof_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
}

/// Check if packet is a LOCAL INFILE request (0xFB + filename)
pub fn is_local_infile(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFB
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: u32 = CLIENT_PROTOCOL_41 | CLIENT_SESSION_TRACK;

    #[test]
    fn lenenc_int_boundaries() {
        let mut buf = BytesMut::new();
        for v in [0u64, 250, 251, 65535, 65536, 16777215, 16777216, u64::MAX] {
            buf.clear();
            put_lenenc_int(&mut buf, v);
            let mut slice = &buf[..];
            assert_eq!(get_lenenc_int(&mut slice).unwrap(), v);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn lenenc_int_overrun() {
        // Declares a u16 but only one byte follows
        let mut buf: &[u8] = &[0xFC, 0x01];
        assert!(matches!(
            get_lenenc_int(&mut buf),
            Err(ProtocolError::LengthOverrun)
        ));
    }

    #[test]
    fn lenenc_null_marker_is_not_an_int() {
        let mut buf: &[u8] = &[0xFB];
        assert!(get_lenenc_int(&mut buf).is_err());
    }

    #[test]
    fn ok_packet_roundtrip() {
        let ok = OkPacket {
            affected_rows: 3,
            last_insert_id: 77,
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            warnings: 1,
            info: String::new(),
            state_changes: vec![],
        };
        let pkt = ok.encode(1, CAPS);
        let parsed = OkPacket::parse(&pkt.payload, CAPS).unwrap();
        assert_eq!(parsed.affected_rows, 3);
        assert_eq!(parsed.last_insert_id, 77);
        assert_eq!(parsed.warnings, 1);
        assert!(parsed.state_changes.is_empty());
    }

    #[test]
    fn ok_packet_with_session_track() {
        let ok = OkPacket {
            affected_rows: 0,
            last_insert_id: 0,
            status_flags: SERVER_STATUS_AUTOCOMMIT | SERVER_SESSION_STATE_CHANGED,
            warnings: 0,
            info: String::new(),
            state_changes: vec![
                StateChange::Schema("shop".to_string()),
                StateChange::SystemVariable {
                    name: "autocommit".to_string(),
                    value: "OFF".to_string(),
                },
                StateChange::TransactionState("T_______".to_string()),
            ],
        };

        let pkt = ok.encode(1, CAPS);
        let parsed = OkPacket::parse(&pkt.payload, CAPS).unwrap();
        assert_eq!(parsed.state_changes, ok.state_changes);
    }

    #[test]
    fn ok_without_session_track_capability() {
        let ok = OkPacket::new();
        let pkt = ok.encode(1, CLIENT_PROTOCOL_41);
        let parsed = OkPacket::parse(&pkt.payload, CLIENT_PROTOCOL_41).unwrap();
        assert!(parsed.state_changes.is_empty());
    }

    #[test]
    fn err_packet_roundtrip() {
        let err = ErrPacket::new(1064, "42000", "syntax error");
        let pkt = err.encode(1, CLIENT_PROTOCOL_41);
        let parsed = ErrPacket::parse(&pkt.payload, CLIENT_PROTOCOL_41).unwrap();
        assert_eq!(parsed.error_code, 1064);
        assert_eq!(parsed.sql_state, "42000");
        assert_eq!(parsed.error_message, "syntax error");
        assert!(!parsed.is_connection_fatal());

        let fatal = ErrPacket::new(1927, "08S01", "connection killed");
        assert!(fatal.is_connection_fatal());
    }

    #[test]
    fn eof_packet_roundtrip() {
        let eof = EofPacket {
            warnings: 2,
            status_flags: SERVER_MORE_RESULTS_EXISTS,
        };
        let pkt = eof.encode(4);
        assert!(is_eof_packet(&pkt.payload));
        let parsed = EofPacket::parse(&pkt.payload).unwrap();
        assert_eq!(parsed.warnings, 2);
        assert_eq!(parsed.status_flags, SERVER_MORE_RESULTS_EXISTS);
    }

    #[test]
    fn column_definition_roundtrip() {
        let col = ColumnDefinition {
            catalog: "def".to_string(),
            schema: "d".to_string(),
            table: "t".to_string(),
            org_table: "t".to_string(),
            name: "1".to_string(),
            org_name: String::new(),
            character_set: 0x3f,
            column_length: 1,
            column_type: 0x08,
            flags: 0x0081,
            decimals: 0,
        };
        let pkt = col.encode(2);
        let parsed = ColumnDefinition::parse(&pkt.payload).unwrap();
        assert_eq!(parsed, col);
    }

    #[test]
    fn stmt_prepare_ok_roundtrip() {
        let ok = StmtPrepareOk {
            statement_id: 7,
            num_columns: 1,
            num_params: 1,
            warning_count: 0,
        };
        let pkt = ok.encode(1);
        let parsed = StmtPrepareOk::parse(&pkt.payload).unwrap();
        assert_eq!(parsed, ok);
    }

    #[test]
    fn stmt_prepare_ok_rejects_err() {
        let err = ErrPacket::new(1064, "42000", "bad").encode(1, CLIENT_PROTOCOL_41);
        assert!(StmtPrepareOk::parse(&err.payload).is_err());
    }
}
