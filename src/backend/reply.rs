//! In-flight response tracking: reconstructs reply boundaries from the
//! backend byte stream, one tracked command at a time.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::protocol::{
    capabilities::CLIENT_DEPRECATE_EOF, get_lenenc_int, is_eof_packet, is_local_infile, status::*,
    Command, EofPacket, ErrPacket, OkPacket, Packet, ProtocolError, StateChange, StmtPrepareOk,
    MAX_PACKET_SIZE,
};

/// Cursor flag bit of the COM_STMT_EXECUTE flags byte
const CURSOR_TYPE_READ_ONLY: u8 = 0x01;

/// Where the tracker is inside the current reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyState {
    #[default]
    Start,
    /// Counting column definitions of a result set
    RsetColdef,
    /// Consuming row packets
    RsetRows,
    /// Counting COM_STMT_PREPARE metadata packets
    PsMeta,
    /// LOAD DATA LOCAL relay, waiting for the final OK
    LoadData,
    Done,
}

/// A reconstructed server reply
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub state: ReplyState,
    pub rows_read: u64,
    pub error: Option<ErrPacket>,
    pub is_ok: bool,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub server_status: u16,
    pub warnings: u16,
    pub state_changes: Vec<StateChange>,
    /// Set when the command was a COM_STMT_PREPARE
    pub ps_response: Option<StmtPrepareOk>,
    /// Session-internal id the prepare was tracked under
    pub internal_ps_id: Option<u32>,
}

/// The information needed to parse the response of one written command
#[derive(Debug, Clone)]
pub struct TrackedCommand {
    pub command: Command,
    pub payload_len: u32,
    pub opening_cursor: bool,
    /// Session-internal id of the statement being prepared
    pub internal_ps_id: Option<u32>,
}

impl TrackedCommand {
    pub fn from_packet(packet: &Packet) -> Self {
        let command = packet.command_code().unwrap_or(Command::Unknown);
        let opening_cursor = command == Command::StmtExecute
            && packet
                .payload
                .get(5)
                .is_some_and(|flags| flags & CURSOR_TYPE_READ_ONLY != 0);

        Self {
            command,
            payload_len: packet.payload.len() as u32,
            opening_cursor,
            internal_ps_id: None,
        }
    }

    pub fn with_ps_id(mut self, internal_id: u32) -> Self {
        self.internal_ps_id = Some(internal_id);
        self
    }
}

/// Result of feeding one server packet to the tracker
#[derive(Debug)]
pub enum TrackerEvent {
    /// More packets belong to the current reply
    Partial,
    /// The reply is complete
    Complete(Reply),
    /// The server requests LOAD DATA LOCAL file content (0xFB)
    LoadDataRequest,
}

/// Reconstructs reply boundaries for a backend connection.
///
/// Commands are tracked in write order; every received packet is attributed
/// to the oldest unanswered command. Packets arriving with no command in
/// flight are a protocol error, except during LOAD DATA relay.
#[derive(Debug)]
pub struct ResponseTracker {
    capabilities: u32,
    current: Option<TrackedCommand>,
    queue: VecDeque<TrackedCommand>,
    reply: Reply,
    state: ReplyState,
    num_coldefs: u64,
    coldefs_seen: u64,
    expect_coldef_eof: bool,
    ps_packets: i64,
    /// The previous packet was maximal, the next one continues it
    skip_next: bool,
    open_cursor: bool,
    last_server_status: u16,
}

impl ResponseTracker {
    pub fn new(capabilities: u32) -> Self {
        Self {
            capabilities,
            current: None,
            queue: VecDeque::new(),
            reply: Reply::default(),
            state: ReplyState::Start,
            num_coldefs: 0,
            coldefs_seen: 0,
            expect_coldef_eof: false,
            ps_packets: 0,
            skip_next: false,
            open_cursor: false,
            last_server_status: SERVER_STATUS_AUTOCOMMIT,
        }
    }

    pub fn set_capabilities(&mut self, capabilities: u32) {
        self.capabilities = capabilities;
    }

    /// Register a written command so its response can be parsed
    pub fn track(&mut self, cmd: TrackedCommand) {
        trace!(command = ?cmd.command, "tracking command");

        if matches!(cmd.command, Command::StmtClose | Command::StmtReset) {
            self.open_cursor = false;
        }

        if self.current.is_none() {
            self.begin(cmd);
        } else {
            self.queue.push_back(cmd);
        }
    }

    /// Number of commands with unfinished replies
    pub fn in_flight(&self) -> usize {
        self.current.is_some() as usize + self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn has_open_cursor(&self) -> bool {
        self.open_cursor
    }

    /// The statement holding the cursor was closed or reset
    pub fn clear_cursor(&mut self) {
        self.open_cursor = false;
    }

    /// Status flags of the most recently completed reply
    pub fn last_server_status(&self) -> u16 {
        self.last_server_status
    }

    pub fn current_command(&self) -> Option<Command> {
        self.current.as_ref().map(|c| c.command)
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    /// Feed one server packet
    pub fn process(&mut self, packet: &Packet) -> Result<TrackerEvent, ProtocolError> {
        if self.current.is_none() {
            return Err(ProtocolError::UnexpectedPacket("an in-flight command"));
        }

        if self.skip_next {
            // Continuation of a packet larger than 2^24-1 bytes
            if !packet.is_full() {
                self.skip_next = false;
            }
            return Ok(TrackerEvent::Partial);
        }

        let payload = &packet.payload;

        match self.state {
            ReplyState::Start => self.process_reply_start(payload),
            ReplyState::RsetColdef => self.process_coldef(payload, packet),
            ReplyState::RsetRows => self.process_row(payload, packet),
            ReplyState::PsMeta => self.process_ps_meta(payload),
            ReplyState::LoadData => self.process_load_data_end(payload),
            ReplyState::Done => Err(ProtocolError::UnexpectedPacket("an in-flight command")),
        }
    }

    fn deprecate_eof(&self) -> bool {
        self.capabilities & CLIENT_DEPRECATE_EOF != 0
    }

    fn begin(&mut self, cmd: TrackedCommand) {
        self.current = Some(cmd);
        self.reply = Reply::default();
        self.state = ReplyState::Start;
        self.num_coldefs = 0;
        self.coldefs_seen = 0;
        self.expect_coldef_eof = false;
        self.ps_packets = 0;
    }

    fn complete(&mut self) -> TrackerEvent {
        self.reply.state = ReplyState::Done;
        self.state = ReplyState::Done;
        self.reply.internal_ps_id = self.current.as_ref().and_then(|c| c.internal_ps_id);
        self.last_server_status = self.reply.server_status;

        let reply = std::mem::take(&mut self.reply);
        debug!(
            is_ok = reply.is_ok,
            rows = reply.rows_read,
            error = reply.error.as_ref().map(|e| e.error_code),
            "reply complete"
        );

        self.current = None;
        if let Some(next) = self.queue.pop_front() {
            self.begin(next);
        }

        TrackerEvent::Complete(reply)
    }

    fn apply_ok(&mut self, ok: OkPacket) {
        self.reply.is_ok = true;
        self.reply.affected_rows = ok.affected_rows;
        self.reply.last_insert_id = ok.last_insert_id;
        self.reply.server_status = ok.status_flags;
        self.reply.warnings = ok.warnings;
        self.reply.state_changes.extend(ok.state_changes);
    }

    fn process_reply_start(&mut self, payload: &bytes::Bytes) -> Result<TrackerEvent, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        let command = self.current.as_ref().map(|c| c.command);

        match command {
            Some(Command::StmtPrepare) => return self.process_prepare_start(payload),
            Some(Command::Statistics) => {
                // COM_STATISTICS answers with a bare string packet
                self.reply.is_ok = true;
                return Ok(self.complete());
            }
            Some(Command::FieldList) => return self.process_field_list(payload),
            _ => {}
        }

        match payload[0] {
            0x00 => {
                let ok = OkPacket::parse(payload, self.capabilities)?;
                let more = ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0;
                self.apply_ok(ok);
                if more {
                    // Next result set of a multi-result reply
                    Ok(TrackerEvent::Partial)
                } else {
                    Ok(self.complete())
                }
            }
            0xFF => {
                self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
                Ok(self.complete())
            }
            0xFB if is_local_infile(payload) => {
                self.state = ReplyState::LoadData;
                self.reply.state = ReplyState::LoadData;
                Ok(TrackerEvent::LoadDataRequest)
            }
            0xFE if is_eof_packet(payload) => {
                // Legacy EOF directly in reply position
                let eof = EofPacket::parse(payload)?;
                self.reply.is_ok = true;
                self.reply.server_status = eof.status_flags;
                self.reply.warnings = eof.warnings;
                Ok(self.complete())
            }
            _ => {
                let mut buf = &payload[..];
                let count = get_lenenc_int(&mut buf)?;
                if count == 0 {
                    return Err(ProtocolError::UnexpectedPacket("a column count"));
                }
                self.num_coldefs = count;
                self.coldefs_seen = 0;
                self.expect_coldef_eof = !self.deprecate_eof();
                self.state = ReplyState::RsetColdef;
                self.reply.state = ReplyState::RsetColdef;
                Ok(TrackerEvent::Partial)
            }
        }
    }

    fn process_prepare_start(&mut self, payload: &bytes::Bytes) -> Result<TrackerEvent, ProtocolError> {
        match payload[0] {
            0xFF => {
                self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
                Ok(self.complete())
            }
            0x00 => {
                let ok = StmtPrepareOk::parse(payload)?;

                let mut packets = ok.num_params as i64 + ok.num_columns as i64;
                if !self.deprecate_eof() {
                    if ok.num_params > 0 {
                        packets += 1;
                    }
                    if ok.num_columns > 0 {
                        packets += 1;
                    }
                }

                self.reply.is_ok = true;
                self.reply.ps_response = Some(ok);

                if packets == 0 {
                    Ok(self.complete())
                } else {
                    self.ps_packets = packets;
                    self.state = ReplyState::PsMeta;
                    self.reply.state = ReplyState::PsMeta;
                    Ok(TrackerEvent::Partial)
                }
            }
            _ => Err(ProtocolError::UnexpectedPacket("a STMT_PREPARE response")),
        }
    }

    fn process_field_list(&mut self, payload: &bytes::Bytes) -> Result<TrackerEvent, ProtocolError> {
        // COM_FIELD_LIST: column definitions straight away, ended by EOF
        match payload[0] {
            0xFF => {
                self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
                Ok(self.complete())
            }
            0xFE if is_eof_packet(payload) => {
                let eof = EofPacket::parse(payload)?;
                self.reply.is_ok = true;
                self.reply.server_status = eof.status_flags;
                Ok(self.complete())
            }
            _ => Ok(TrackerEvent::Partial),
        }
    }

    fn process_coldef(
        &mut self,
        payload: &bytes::Bytes,
        _packet: &Packet,
    ) -> Result<TrackerEvent, ProtocolError> {
        if !payload.is_empty() && payload[0] == 0xFF {
            self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
            return Ok(self.complete());
        }

        if self.coldefs_seen < self.num_coldefs {
            self.coldefs_seen += 1;
            if self.coldefs_seen == self.num_coldefs && !self.expect_coldef_eof {
                self.state = ReplyState::RsetRows;
                self.reply.state = ReplyState::RsetRows;
            }
            return Ok(TrackerEvent::Partial);
        }

        // The delimiter after the column definitions
        let eof = EofPacket::parse(payload)?;
        self.reply.server_status = eof.status_flags;
        self.reply.warnings = eof.warnings;

        let opening_cursor = self.current.as_ref().is_some_and(|c| c.opening_cursor);
        if opening_cursor && eof.status_flags & SERVER_STATUS_CURSOR_EXISTS != 0 {
            // Cursor opened: the reply ends after the metadata
            self.open_cursor = true;
            self.reply.is_ok = true;
            return Ok(self.complete());
        }

        self.state = ReplyState::RsetRows;
        self.reply.state = ReplyState::RsetRows;
        Ok(TrackerEvent::Partial)
    }

    fn process_row(
        &mut self,
        payload: &bytes::Bytes,
        packet: &Packet,
    ) -> Result<TrackerEvent, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        match payload[0] {
            0xFF => {
                self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
                return Ok(self.complete());
            }
            0xFE if self.deprecate_eof() && payload.len() < MAX_PACKET_SIZE => {
                // Result sets end with an OK packet carrying the 0xFE header
                let ok = OkPacket::parse(payload, self.capabilities)?;
                let status = ok.status_flags;
                let warnings = ok.warnings;
                self.apply_ok(ok);
                return self.finish_result_set(status, warnings);
            }
            0xFE if is_eof_packet(payload) => {
                let eof = EofPacket::parse(payload)?;
                return self.finish_result_set(eof.status_flags, eof.warnings);
            }
            _ => {}
        }

        self.reply.rows_read += 1;
        if packet.is_full() {
            // The rest of this row arrives in continuation packets
            self.skip_next = true;
        }

        Ok(TrackerEvent::Partial)
    }

    fn finish_result_set(
        &mut self,
        status: u16,
        warnings: u16,
    ) -> Result<TrackerEvent, ProtocolError> {
        self.reply.server_status = status;
        self.reply.warnings = warnings;
        self.reply.is_ok = true;

        if status & SERVER_MORE_RESULTS_EXISTS != 0 {
            self.state = ReplyState::Start;
            self.reply.state = ReplyState::Start;
            return Ok(TrackerEvent::Partial);
        }

        if status & SERVER_STATUS_CURSOR_EXISTS != 0
            && self.current.as_ref().is_some_and(|c| c.opening_cursor)
        {
            self.open_cursor = true;
        }

        Ok(self.complete())
    }

    fn process_ps_meta(&mut self, payload: &bytes::Bytes) -> Result<TrackerEvent, ProtocolError> {
        if !payload.is_empty() && payload[0] == 0xFF {
            self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
            return Ok(self.complete());
        }

        self.ps_packets -= 1;
        if self.ps_packets <= 0 {
            Ok(self.complete())
        } else {
            Ok(TrackerEvent::Partial)
        }
    }

    fn process_load_data_end(&mut self, payload: &bytes::Bytes) -> Result<TrackerEvent, ProtocolError> {
        match payload.first() {
            Some(0x00) => {
                let ok = OkPacket::parse(payload, self.capabilities)?;
                self.apply_ok(ok);
                Ok(self.complete())
            }
            Some(0xFF) => {
                self.reply.error = Some(ErrPacket::parse(payload, self.capabilities)?);
                Ok(self.complete())
            }
            _ => Err(ProtocolError::UnexpectedPacket("a LOAD DATA result")),
        }
    }
}
