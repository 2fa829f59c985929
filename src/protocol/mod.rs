mod handshake;
mod packet;
mod response;

pub use handshake::{AuthSwitchRequest, HandshakeResponse, InitialHandshake, SslRequest};
pub use packet::{
    capabilities, status, Command, Packet, PacketCodec, MAX_PACKET_SIZE, PACKET_HEADER_SIZE,
    PS_ID_OFFSET,
};
pub use response::{
    get_lenenc_bytes, get_lenenc_int, get_lenenc_str, is_eof_packet, is_err_packet,
    is_local_infile, is_ok_packet, parse_session_track, put_lenenc_int, put_lenenc_str,
    ColumnDefinition, EofPacket, ErrPacket, OkPacket, ProtocolError, StateChange, StmtPrepareOk,
};
