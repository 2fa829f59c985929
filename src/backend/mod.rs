//! Backend protocol engine: one instance per backend TCP connection.
//!
//! Drives the multi-phase connection setup (handshake, authentication with
//! plugin switch, optional TLS upgrade, connection-init queries, delayed
//! packet drain) as a hierarchical state machine, then tracks in-flight
//! command replies while routing.

mod auth;
mod reply;

pub use auth::{
    caching_sha2_scramble, create_plugin, native_password_scramble, AuthError, AuthPlugin,
    PluginStep, CACHING_SHA2_PASSWORD, MYSQL_NATIVE_PASSWORD,
};
pub use reply::{Reply, ReplyState, ResponseTracker, TrackedCommand, TrackerEvent};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::classifier::{extract_ps_id, is_ps_command};
use crate::config::BackendSettings;
use crate::protocol::{
    capabilities::*, is_err_packet, is_ok_packet, status::SERVER_STATUS_IN_TRANS,
    AuthSwitchRequest, Command, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet,
    PacketCodec, ProtocolError, SslRequest,
};

/// Top-level connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Handshaking,
    Authenticating,
    ConnectionInit,
    SendDelayq,
    Routing,
    Failed,
}

/// Handshake sub-machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    SendProxyHdr,
    ExpectHs,
    StartSsl,
    SslNeg,
    SendHsResp,
    Complete,
    Fail,
}

/// How an error should be surfaced to the router
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The backend is lost but the client session may survive
    Transient,
    /// The backend should be taken out of rotation
    Permanent,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("server error {code} (#{sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },

    #[error("backend disconnected")]
    Disconnected,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackendError {
    pub fn from_err_packet(err: ErrPacket) -> Self {
        BackendError::Server {
            code: err.error_code,
            sql_state: err.sql_state,
            message: err.error_message,
        }
    }

    /// Classify for the router: setup-phase failures remove the backend from
    /// rotation, steady-state failures are retryable elsewhere.
    pub fn error_type(&self, state: BackendState) -> ErrorType {
        if state == BackendState::Routing {
            ErrorType::Transient
        } else {
            ErrorType::Permanent
        }
    }
}

/// External TLS provider: upgrades the byte stream after the engine has sent
/// the SSLRequest packet. The engine itself never implements TLS.
pub trait TlsUpgrade<S>: Send + Sync {
    fn upgrade<'a>(
        &'a self,
        stream: S,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<S>> + Send + 'a>>
    where
        S: 'a;
}

/// Event produced by reading one backend packet
#[derive(Debug)]
pub enum BackendEvent {
    /// Response packet belonging to the current reply, forward upstream
    Forward(Packet),
    /// Final packet of the reply plus the reconstructed `Reply`
    Complete(Packet, Reply),
    /// The server requests LOAD DATA LOCAL file content
    LoadDataRequest(Packet),
    /// Packet consumed internally (ping replies, change-user chatter)
    Consumed,
}

struct DelayedPacket {
    packet: Packet,
    internal_ps_id: Option<u32>,
}

/// One backend connection and its protocol state machine.
///
/// Generic over the stream so tests can drive it with in-memory duplex
/// pipes; production uses `TcpStream`.
pub struct BackendConnection<S> {
    framed: Option<Framed<S, PacketCodec>>,
    state: BackendState,
    hs_state: HandshakeState,
    settings: Arc<BackendSettings>,
    server_name: String,
    tls: Option<Arc<dyn TlsUpgrade<S>>>,
    proxy_header: Option<String>,
    /// Replies are forwarded verbatim, so DEPRECATE_EOF may only be used
    /// against this backend when the client side negotiated it too
    allow_deprecate_eof: bool,

    server_capabilities: u32,
    capabilities: u32,
    thread_id: u32,
    scramble: Vec<u8>,
    auth_plugin_name: String,
    sequence: u8,

    delayed: VecDeque<DelayedPacket>,
    init_oks_expected: usize,
    init_oks_received: usize,

    tracker: ResponseTracker,
    /// Session-internal statement id -> id issued by this backend
    ps_map: HashMap<u32, u32>,
    ignore_replies: u32,
    changing_user: bool,
    pending_auth: Option<Box<dyn AuthPlugin>>,
    large_query: bool,

    created_at: Instant,
    last_used_at: Instant,
}

impl BackendConnection<TcpStream> {
    /// Open the TCP connection to a backend. The protocol setup runs in
    /// `establish`; commands written before that are queued.
    pub async fn connect(
        addr: &str,
        server_name: &str,
        settings: Arc<BackendSettings>,
    ) -> Result<Self, BackendError> {
        debug!(addr = %addr, server = %server_name, "connecting to backend");

        let connect = TcpStream::connect(addr);
        let stream = tokio::time::timeout(settings.connect_timeout(), connect)
            .await
            .map_err(|_| BackendError::Connect(format!("connect to {addr} timed out")))?
            .map_err(|e| {
                error!(addr = %addr, error = %e, "failed to connect to backend");
                BackendError::Connect(e.to_string())
            })?;
        stream
            .set_nodelay(true)
            .map_err(|e| BackendError::Connect(e.to_string()))?;

        Ok(Self::new(stream, server_name, settings))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> BackendConnection<S> {
    pub fn new(stream: S, server_name: &str, settings: Arc<BackendSettings>) -> Self {
        let now = Instant::now();
        Self {
            framed: Some(Framed::new(stream, PacketCodec)),
            state: BackendState::Handshaking,
            hs_state: HandshakeState::SendProxyHdr,
            settings,
            server_name: server_name.to_string(),
            tls: None,
            proxy_header: None,
            allow_deprecate_eof: true,
            server_capabilities: 0,
            capabilities: 0,
            thread_id: 0,
            scramble: Vec::new(),
            auth_plugin_name: MYSQL_NATIVE_PASSWORD.to_string(),
            sequence: 1,
            delayed: VecDeque::new(),
            init_oks_expected: 0,
            init_oks_received: 0,
            tracker: ResponseTracker::new(0),
            ps_map: HashMap::new(),
            ignore_replies: 0,
            changing_user: false,
            pending_auth: None,
            large_query: false,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Attach the external TLS provider used when `settings.ssl` is set
    pub fn with_tls(mut self, provider: Arc<dyn TlsUpgrade<S>>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Set the proxy-protocol preamble written before the handshake
    pub fn set_proxy_header(&mut self, header: String) {
        self.proxy_header = Some(header);
    }

    /// Forbid DEPRECATE_EOF negotiation when the client side lacks it
    pub fn set_deprecate_eof(&mut self, allowed: bool) {
        self.allow_deprecate_eof = allowed;
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == BackendState::Routing
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// Capabilities negotiated with the backend
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn seconds_idle(&self) -> u64 {
        self.last_used_at.elapsed().as_secs()
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    pub fn is_idle_too_long(&self, max_idle: Duration) -> bool {
        self.last_used_at.elapsed() > max_idle
    }

    /// Number of commands queued while the connection was not routable
    pub fn delayed_len(&self) -> usize {
        self.delayed.len()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Whether the connection can be detached from its session: routing,
    /// nothing in flight, no open cursor, not mid-reauthentication and not
    /// inside a server-side transaction.
    pub fn can_close(&self) -> bool {
        self.state == BackendState::Routing
            && self.tracker.is_idle()
            && !self.tracker.has_open_cursor()
            && !self.changing_user
            && self.tracker.last_server_status() & SERVER_STATUS_IN_TRANS == 0
    }

    /// Rebind the connection to a new session without re-handshaking.
    /// Prepared-statement mappings are discarded and the server-side state
    /// is reset; the reply to COM_RESET_CONNECTION is consumed silently.
    pub async fn reuse(&mut self) -> Result<(), BackendError> {
        if !self.can_close() {
            return Err(BackendError::Internal(
                "reuse of a busy backend connection".to_string(),
            ));
        }

        self.ps_map.clear();
        self.delayed.clear();
        self.large_query = false;

        let packet = Packet::command(Command::ResetConnection, &[]);
        self.tracker.track(TrackedCommand::from_packet(&packet));
        self.ignore_replies += 1;
        self.send(packet).await
    }

    /// Idle keepalive; the reply is consumed and never forwarded upstream
    pub async fn ping(&mut self) -> Result<(), BackendError> {
        if self.state != BackendState::Routing {
            return Ok(());
        }
        let packet = Packet::command(Command::Ping, &[]);
        self.tracker.track(TrackedCommand::from_packet(&packet));
        self.ignore_replies += 1;
        self.send(packet).await
    }

    /// Close the connection, politely when possible
    pub async fn finish(&mut self) {
        if self.state == BackendState::Routing {
            let _ = self.send(Packet::command(Command::Quit, &[])).await;
        }
        self.state = BackendState::Failed;
    }

    /// Drive the connection state machine until the backend is routable
    pub async fn establish(&mut self) -> Result<(), BackendError> {
        let result = self.run_to_routing().await;
        if let Err(ref e) = result {
            error!(server = %self.server_name, error = %e, "backend connection failed");
            self.state = BackendState::Failed;
            self.hs_state = HandshakeState::Fail;
        }
        result
    }

    async fn run_to_routing(&mut self) -> Result<(), BackendError> {
        loop {
            match self.state {
                BackendState::Handshaking => {
                    self.handshake().await?;
                    self.state = BackendState::Authenticating;
                }
                BackendState::Authenticating => {
                    self.authenticate().await?;
                    self.state = BackendState::ConnectionInit;
                }
                BackendState::ConnectionInit => {
                    self.connection_init().await?;
                    self.state = BackendState::SendDelayq;
                }
                BackendState::SendDelayq => {
                    self.send_delayed_packets().await?;
                    self.state = BackendState::Routing;
                    info!(
                        server = %self.server_name,
                        thread_id = self.thread_id,
                        "backend ready for routing"
                    );
                }
                BackendState::Routing => return Ok(()),
                BackendState::Failed => {
                    return Err(BackendError::Internal(
                        "connection already failed".to_string(),
                    ));
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), BackendError> {
        // Optional proxy-protocol v1 preamble, written exactly once
        if self.hs_state == HandshakeState::SendProxyHdr {
            if self.settings.proxy_protocol {
                let header = self
                    .proxy_header
                    .clone()
                    .unwrap_or_else(|| "PROXY UNKNOWN\r\n".to_string());
                debug!(server = %self.server_name, "sending proxy protocol header");
                self.framed_mut()?
                    .send(header.as_bytes())
                    .await
                    .map_err(BackendError::Io)?;
            }
            self.hs_state = HandshakeState::ExpectHs;
        }

        // Initial handshake from the server
        let packet = self.read_packet().await?;
        if is_err_packet(&packet.payload) {
            let err = ErrPacket::parse(&packet.payload, CLIENT_PROTOCOL_41)?;
            return Err(BackendError::from_err_packet(err));
        }

        let handshake = InitialHandshake::parse(&packet.payload)
            .ok_or(ProtocolError::Malformed("initial handshake"))?;

        debug!(
            server = %self.server_name,
            version = %handshake.server_version,
            thread_id = handshake.connection_id,
            plugin = %handshake.auth_plugin_name,
            "received backend handshake"
        );

        self.server_capabilities = handshake.capability_flags;
        self.thread_id = handshake.connection_id;
        self.scramble = handshake.auth_plugin_data();
        self.auth_plugin_name = handshake.auth_plugin_name.clone();
        self.sequence = packet.sequence_id.wrapping_add(1);

        // Capability negotiation: intersection of ours and the server's
        let mut caps = BASE_CAPABILITIES & handshake.capability_flags;
        if !self.allow_deprecate_eof {
            caps &= !CLIENT_DEPRECATE_EOF;
        }
        if self.settings.multi_statements {
            caps |= CLIENT_MULTI_STATEMENTS & handshake.capability_flags;
        }
        if self.settings.database.is_some() {
            caps |= CLIENT_CONNECT_WITH_DB;
        }

        if self.settings.ssl {
            if handshake.capability_flags & CLIENT_SSL == 0 {
                return Err(BackendError::Connect(
                    "TLS required but the server does not support it".to_string(),
                ));
            }
            caps |= CLIENT_SSL;
            self.capabilities = caps;
            self.tracker.set_capabilities(caps);

            self.hs_state = HandshakeState::StartSsl;
            let request = SslRequest::new(caps, 0x21).encode(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            self.send(request).await?;

            self.hs_state = HandshakeState::SslNeg;
            self.upgrade_tls().await?;
        } else {
            self.capabilities = caps;
            self.tracker.set_capabilities(caps);
        }

        self.hs_state = HandshakeState::SendHsResp;
        Ok(())
    }

    /// Hand the plain stream to the external TLS provider, keeping any
    /// buffered bytes
    async fn upgrade_tls(&mut self) -> Result<(), BackendError> {
        let provider = self.tls.clone().ok_or_else(|| {
            BackendError::Connect("TLS configured but no TLS provider is attached".to_string())
        })?;

        let framed = self
            .framed
            .take()
            .ok_or_else(|| BackendError::Internal("stream detached".to_string()))?;

        let parts = framed.into_parts();
        let upgraded = provider.upgrade(parts.io).await.map_err(|e| {
            BackendError::Connect(format!("TLS negotiation failed: {e}"))
        })?;

        let mut new_parts =
            tokio_util::codec::FramedParts::new::<Packet>(upgraded, PacketCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        self.framed = Some(Framed::from_parts(new_parts));

        debug!(server = %self.server_name, "TLS established");
        Ok(())
    }

    async fn authenticate(&mut self) -> Result<(), BackendError> {
        let mut plugin = create_plugin(
            &self.auth_plugin_name,
            &self.settings.password,
            &self.scramble,
            self.settings.ssl,
        )?;

        let response = HandshakeResponse {
            capability_flags: self.capabilities,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21, // utf8_general_ci
            username: self.settings.user.clone(),
            auth_response: plugin.initial_response(),
            database: self.settings.database.clone(),
            auth_plugin_name: plugin.name().to_string(),
        };

        let packet = response.encode(self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        self.send(packet).await?;
        self.hs_state = HandshakeState::Complete;

        loop {
            let packet = self.read_packet().await?;
            self.sequence = packet.sequence_id.wrapping_add(1);
            let payload = &packet.payload;

            if payload.is_empty() {
                return Err(ProtocolError::EmptyPayload.into());
            }

            match payload[0] {
                0x00 => {
                    debug!(server = %self.server_name, "backend authentication successful");
                    return Ok(());
                }
                0xFF => {
                    let err = ErrPacket::parse(payload, self.capabilities)?;
                    warn!(
                        server = %self.server_name,
                        code = err.error_code,
                        message = %err.error_message,
                        "backend authentication failed"
                    );
                    return Err(AuthError::Rejected(err.error_message).into());
                }
                0xFE => {
                    // Auth switch: restart with the named plugin
                    let switch = AuthSwitchRequest::parse(payload)
                        .ok_or(ProtocolError::Malformed("auth switch request"))?;
                    debug!(
                        server = %self.server_name,
                        plugin = %switch.plugin_name,
                        "authentication plugin switch"
                    );
                    self.auth_plugin_name = switch.plugin_name.clone();
                    self.scramble = switch.plugin_data.clone();
                    plugin = create_plugin(
                        &self.auth_plugin_name,
                        &self.settings.password,
                        &self.scramble,
                        self.settings.ssl,
                    )?;
                    let data = plugin.initial_response();
                    let reply = Packet::new(self.sequence, data);
                    self.sequence = self.sequence.wrapping_add(1);
                    self.send(reply).await?;
                }
                0x01 => {
                    // Plugin-specific continuation
                    let step = plugin.on_server_data(&payload[1..])?;
                    if let Some(data) = step.write {
                        let reply = Packet::new(self.sequence, data);
                        self.sequence = self.sequence.wrapping_add(1);
                        self.send(reply).await?;
                    }
                }
                _ => {
                    return Err(ProtocolError::UnexpectedPacket("an authentication packet").into())
                }
            }
        }
    }

    /// Send the configured connection-init queries and count their OK
    /// packets; the transition happens on the counted total, never inferred.
    async fn connection_init(&mut self) -> Result<(), BackendError> {
        if self.settings.init_queries.is_empty() {
            return Ok(());
        }

        self.init_oks_expected = self.settings.init_queries.len();
        self.init_oks_received = 0;

        let queries = self.settings.init_queries.clone();
        for query in &queries {
            debug!(server = %self.server_name, query = %query, "sending connection init query");
            self.send(Packet::command(Command::Query, query.as_bytes()))
                .await?;
        }

        while self.init_oks_received < self.init_oks_expected {
            let packet = self.read_packet().await?;
            if is_ok_packet(&packet.payload) {
                self.init_oks_received += 1;
            } else if is_err_packet(&packet.payload) {
                let err = ErrPacket::parse(&packet.payload, self.capabilities)?;
                return Err(BackendError::from_err_packet(err));
            } else {
                return Err(ProtocolError::UnexpectedPacket("an init query OK packet").into());
            }
        }

        Ok(())
    }

    /// Drain the queue of commands that arrived before the connection became
    /// routable, in arrival order. Delayed packets are never re-classified.
    async fn send_delayed_packets(&mut self) -> Result<(), BackendError> {
        while let Some(delayed) = self.delayed.pop_front() {
            self.write_routed(delayed.packet, delayed.internal_ps_id)
                .await?;
        }
        Ok(())
    }

    /// Queue-or-send one command packet
    pub async fn write(&mut self, packet: Packet) -> Result<(), BackendError> {
        self.write_ps(packet, None).await
    }

    /// Queue-or-send a command that references a prepared statement by its
    /// session-internal id (COM_STMT_PREPARE passes the id assigned at
    /// classification time so the response can be registered).
    pub async fn write_ps(
        &mut self,
        packet: Packet,
        internal_ps_id: Option<u32>,
    ) -> Result<(), BackendError> {
        match self.state {
            BackendState::Routing => self.write_routed(packet, internal_ps_id).await,
            BackendState::Failed => {
                Err(BackendError::Internal("write on a failed connection".to_string()))
            }
            _ => {
                self.delayed.push_back(DelayedPacket {
                    packet,
                    internal_ps_id,
                });
                Ok(())
            }
        }
    }

    async fn write_routed(
        &mut self,
        mut packet: Packet,
        internal_ps_id: Option<u32>,
    ) -> Result<(), BackendError> {
        self.last_used_at = Instant::now();

        // LOAD DATA relay: client data packets pass through untracked and
        // keep their sequence numbers
        if self.tracker.state() == ReplyState::LoadData {
            return self.send(packet).await;
        }

        // Continuation of a logical message larger than 2^24-1 bytes
        if self.large_query {
            self.large_query = packet.is_full();
            return self.send(packet).await;
        }

        let mut tracked = TrackedCommand::from_packet(&packet);

        if is_ps_command(tracked.command) {
            let internal = extract_ps_id(&packet.payload)?;
            tracked = tracked.with_ps_id(internal);
            match self.ps_map.get(&internal) {
                Some(&external) => {
                    packet = Packet {
                        sequence_id: packet.sequence_id,
                        payload: rewrite_ps_id(&packet.payload, external),
                    };
                }
                None => {
                    warn!(
                        server = %self.server_name,
                        internal_id = internal,
                        "no backend statement id for internal id, forwarding unchanged"
                    );
                }
            }
        } else if let Some(id) = internal_ps_id {
            tracked = tracked.with_ps_id(id);
        }

        self.large_query = packet.is_full();
        packet.sequence_id = 0;

        if tracked.command == Command::StmtClose {
            self.tracker.clear_cursor();
        }

        // Fire-and-forget commands are never tracked
        if tracked.command.expects_response() {
            self.tracker.track(tracked);
        }
        self.send(packet).await
    }

    /// Whether this backend holds a server-side statement for the internal id
    pub fn has_ps(&self, internal_id: u32) -> bool {
        self.ps_map.contains_key(&internal_id)
    }

    /// COM_CHANGE_USER passthrough: a mini re-authentication. Intermediate
    /// packets are handled internally; only the final OK or ERR surfaces.
    pub async fn change_user(&mut self, mut packet: Packet) -> Result<(), BackendError> {
        self.changing_user = true;
        self.ps_map.clear();
        packet.sequence_id = 0;
        self.send(packet).await
    }

    /// Read one backend packet and advance the reply state
    pub async fn next_event(&mut self) -> Result<BackendEvent, BackendError> {
        let packet = self.read_packet().await?;

        if self.changing_user {
            return self.on_change_user_packet(packet).await;
        }

        match self.tracker.process(&packet)? {
            TrackerEvent::Partial => {
                if self.ignore_replies > 0 {
                    Ok(BackendEvent::Consumed)
                } else {
                    Ok(BackendEvent::Forward(packet))
                }
            }
            TrackerEvent::LoadDataRequest => Ok(BackendEvent::LoadDataRequest(packet)),
            TrackerEvent::Complete(reply) => {
                // Register the backend's statement id for later rewriting
                if let (Some(ps), Some(internal)) = (&reply.ps_response, reply.internal_ps_id) {
                    debug!(
                        server = %self.server_name,
                        internal_id = internal,
                        external_id = ps.statement_id,
                        "prepared statement registered"
                    );
                    self.ps_map.insert(internal, ps.statement_id);
                }

                if self.ignore_replies > 0 {
                    self.ignore_replies -= 1;
                    Ok(BackendEvent::Consumed)
                } else {
                    Ok(BackendEvent::Complete(packet, reply))
                }
            }
        }
    }

    async fn on_change_user_packet(&mut self, packet: Packet) -> Result<BackendEvent, BackendError> {
        let payload = &packet.payload;
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload.into());
        }

        match payload[0] {
            0x00 => {
                self.changing_user = false;
                self.pending_auth = None;
                let ok = OkPacket::parse(payload, self.capabilities)?;
                let reply = Reply {
                    state: ReplyState::Done,
                    is_ok: true,
                    server_status: ok.status_flags,
                    warnings: ok.warnings,
                    state_changes: ok.state_changes,
                    ..Default::default()
                };
                Ok(BackendEvent::Complete(packet, reply))
            }
            0xFF => {
                self.changing_user = false;
                self.pending_auth = None;
                let err = ErrPacket::parse(payload, self.capabilities)?;
                let reply = Reply {
                    state: ReplyState::Done,
                    error: Some(err),
                    ..Default::default()
                };
                Ok(BackendEvent::Complete(packet, reply))
            }
            0xFE => {
                // Challenge for the new user, answered with our credentials
                let switch = AuthSwitchRequest::parse(payload)
                    .ok_or(ProtocolError::Malformed("auth switch request"))?;
                let mut plugin = create_plugin(
                    &switch.plugin_name,
                    &self.settings.password,
                    &switch.plugin_data,
                    self.settings.ssl,
                )?;
                let data = plugin.initial_response();
                self.pending_auth = Some(plugin);
                let reply = Packet::new(packet.sequence_id.wrapping_add(1), data);
                self.send(reply).await?;
                Ok(BackendEvent::Consumed)
            }
            0x01 => {
                let plugin = self.pending_auth.as_mut().ok_or_else(|| {
                    BackendError::Internal("auth continuation without a plugin".to_string())
                })?;
                let step = plugin.on_server_data(&payload[1..])?;
                if let Some(data) = step.write {
                    let reply = Packet::new(packet.sequence_id.wrapping_add(1), data);
                    self.send(reply).await?;
                }
                Ok(BackendEvent::Consumed)
            }
            _ => Err(ProtocolError::UnexpectedPacket("a change-user response").into()),
        }
    }

    async fn read_packet(&mut self) -> Result<Packet, BackendError> {
        match self.framed_mut()?.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(BackendError::Io(e)),
            None => Err(BackendError::Disconnected),
        }
    }

    /// Write one packet; a stalled socket fails the connection
    async fn send(&mut self, packet: Packet) -> Result<(), BackendError> {
        let timeout = self.settings.write_timeout();
        let write = self.framed_mut()?.send(packet);
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result.map_err(BackendError::Io),
            Err(_) => Err(BackendError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "backend write timed out",
            ))),
        }
    }

    fn framed_mut(&mut self) -> Result<&mut Framed<S, PacketCodec>, BackendError> {
        self.framed
            .as_mut()
            .ok_or_else(|| BackendError::Internal("stream detached".to_string()))
    }
}

fn rewrite_ps_id(payload: &Bytes, id: u32) -> Bytes {
    let mut buf = payload.to_vec();
    buf[1..5].copy_from_slice(&id.to_le_bytes());
    Bytes::from(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ps_id_rewrite() {
        let payload = Bytes::from(vec![0x17, 1, 0, 0, 0, 0, 1, 0, 0, 0]);
        let rewritten = rewrite_ps_id(&payload, 7);
        assert_eq!(&rewritten[1..5], &[7, 0, 0, 0]);
        assert_eq!(rewritten[0], 0x17);
        assert_eq!(&rewritten[5..], &payload[5..]);
    }

    #[test]
    fn error_type_classification() {
        let err = BackendError::Disconnected;
        assert_eq!(
            err.error_type(BackendState::Authenticating),
            ErrorType::Permanent
        );
        assert_eq!(err.error_type(BackendState::Routing), ErrorType::Transient);
    }
}
