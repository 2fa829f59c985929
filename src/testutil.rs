//! Shared helpers for protocol-level tests: raw packet I/O and a scripted
//! MariaDB server good enough to drive the backend engine.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{
    capabilities::*, ColumnDefinition, EofPacket, ErrPacket, InitialHandshake, OkPacket, Packet,
    StmtPrepareOk,
};

/// Capabilities advertised by the scripted server (EOF-delimited result sets)
pub fn server_caps() -> u32 {
    CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CLIENT_SESSION_TRACK
        | CLIENT_LOCAL_FILES
        | CLIENT_CONNECT_WITH_DB
}

pub async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> Packet {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    Packet::new(header[3], payload)
}

pub async fn write_packet<S: AsyncWrite + Unpin>(stream: &mut S, packet: Packet) {
    let mut buf = BytesMut::new();
    packet.encode(&mut buf);
    stream.write_all(&buf).await.unwrap();
}

/// The initial handshake of the scripted server: protocol 10, MariaDB
/// version string, thread id 42, native password with a fixed scramble.
pub fn server_handshake(caps: u32) -> InitialHandshake {
    InitialHandshake {
        protocol_version: 10,
        server_version: "10.6.0-MariaDB".to_string(),
        connection_id: 42,
        auth_plugin_data_part1: [1u8; 8],
        capability_flags: caps,
        character_set: 0x21,
        status_flags: 0x0002,
        auth_plugin_data_part2: vec![2u8; 12],
        auth_plugin_name: "mysql_native_password".to_string(),
    }
}

/// Run the server side of the connection setup: send the handshake, check
/// the response and confirm with OK. Returns the negotiated capabilities.
pub async fn serve_connection_setup<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> u32 {
    let caps = server_caps();
    write_packet(stream, server_handshake(caps).encode()).await;

    let response = read_packet(stream).await;
    assert_eq!(response.sequence_id, 1);
    let parsed = crate::protocol::HandshakeResponse::parse(&response.payload).unwrap();
    let negotiated = parsed.capability_flags;

    write_packet(stream, OkPacket::new().encode(2, negotiated)).await;
    negotiated
}

pub fn col_count(n: u64) -> Packet {
    let mut buf = BytesMut::new();
    crate::protocol::put_lenenc_int(&mut buf, n);
    Packet::new(1, buf.freeze())
}

pub fn coldef(name: &str, seq: u8) -> Packet {
    ColumnDefinition {
        catalog: "def".to_string(),
        schema: "d".to_string(),
        table: String::new(),
        org_table: String::new(),
        name: name.to_string(),
        org_name: String::new(),
        character_set: 0x3f,
        column_length: 1,
        column_type: 0x08, // LONGLONG
        flags: 0x0081,
        decimals: 0,
    }
    .encode(seq)
}

pub fn eof(seq: u8, status: u16) -> Packet {
    EofPacket {
        warnings: 0,
        status_flags: status,
    }
    .encode(seq)
}

pub fn text_row(values: &[&str], seq: u8) -> Packet {
    let mut buf = BytesMut::new();
    for v in values {
        crate::protocol::put_lenenc_str(&mut buf, v);
    }
    Packet::new(seq, buf.freeze())
}

pub fn ok(seq: u8, caps: u32) -> Packet {
    OkPacket::new().encode(seq, caps)
}

pub fn err(seq: u8, caps: u32, code: u16, state: &str, msg: &str) -> Packet {
    ErrPacket::new(code, state, msg).encode(seq, caps)
}

/// Serve the classic `SELECT 1` result set: column count, one column
/// definition, EOF, one row, EOF
pub async fn serve_select_one<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    write_packet(stream, col_count(1)).await;
    write_packet(stream, coldef("1", 2)).await;
    write_packet(stream, eof(3, 0x0002)).await;
    write_packet(stream, text_row(&["1"], 4)).await;
    write_packet(stream, eof(5, 0x0002)).await;
}

pub fn prepare_ok(seq: u8, statement_id: u32, num_columns: u16, num_params: u16) -> Packet {
    StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warning_count: 0,
    }
    .encode(seq)
}
