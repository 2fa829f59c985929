mod ps;
mod state;

pub use ps::{PreparedStatement, PsRegistry, PS_ID_LATEST};
pub use state::{LoadDataState, SessionState};

use std::collections::HashMap;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use crate::backend::{
    native_password_scramble, BackendConnection, BackendError, BackendEvent,
};
use crate::classifier::{
    extract_ps_id, is_ps_command, query_continues_ps, Classifier, Operation, TypeMask,
};
use crate::config::Config;
use crate::metrics::metrics;
use crate::pool::ConnectionPool;
use crate::protocol::{
    capabilities, Command, ErrPacket, HandshakeResponse, InitialHandshake, OkPacket, Packet,
    PacketCodec, ProtocolError,
};
use crate::router::{select, Hint, RouteTarget, TargetResolver};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("no server available for target {0}")]
    NoServer(RouteTarget),

    #[error("session state error: {0}")]
    Internal(String),
}

/// One client connection: owns the client-side protocol exchange, the
/// session routing state and the backends opened on the session's behalf.
pub struct Session {
    pub id: u32,
    pub state: SessionState,
    classifier: Classifier,
    resolver: TargetResolver,
    config: Arc<Config>,
    pool: Arc<ConnectionPool>,

    /// Open backends, by index into `config.servers`
    backends: HashMap<usize, BackendConnection<TcpStream>>,
    /// Server that produced the previous result
    last_used: Option<usize>,
    /// Backend receiving LOAD DATA LOCAL content
    load_data_target: Option<usize>,
    /// Target of a client command spanning multiple wire packets
    large_query_target: Option<usize>,
    /// Previous command, for prepared-statement continuation
    prev_command: Command,
    /// Statement id -> server that executed the previous step
    prev_ps_target: HashMap<u32, usize>,
    /// Schema switch to apply when the current reply succeeds
    pending_db: Option<String>,
    /// Packets of the current reply have already reached the client
    reply_started: bool,
}

impl Session {
    pub fn new(id: u32, config: Arc<Config>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            id,
            state: SessionState::new(),
            classifier: Classifier::new(),
            resolver: TargetResolver::default(),
            config,
            pool,
            backends: HashMap::new(),
            last_used: None,
            load_data_target: None,
            large_query_target: None,
            prev_command: Command::Sleep,
            prev_ps_target: HashMap::new(),
            pending_db: None,
            reply_started: false,
        }
    }

    /// Run the session over the client connection
    pub async fn run<C>(mut self, client_stream: C) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        // Client-side handshake
        let handshake = InitialHandshake::new(self.id);
        let scramble = handshake.auth_plugin_data();
        client.send(handshake.encode()).await?;

        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or(ProtocolError::Malformed("handshake response"))?;

        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            "received client handshake response"
        );

        if !self.verify_client(&response, &scramble) {
            warn!(session_id = self.id, username = %response.username, "client authentication failed");
            let err = ErrPacket::new(
                1045,
                "28000",
                &format!("Access denied for user '{}'", response.username),
            );
            client.send(err.encode(2, response.capability_flags)).await?;
            return Ok(());
        }

        let multi_statements = self.config.routing.multi_statements
            && response.capability_flags & capabilities::CLIENT_MULTI_STATEMENTS != 0;

        self.state.set_from_handshake(
            response.username.clone(),
            response.database.clone(),
            response.capability_flags,
            response.character_set,
            multi_statements,
        );

        let ok = OkPacket::new();
        client.send(ok.encode(2, self.state.capability_flags)).await?;

        info!(session_id = self.id, username = %self.state.username, "client authenticated");
        metrics().record_connection_accepted();

        let result = self.command_loop(&mut client).await;

        self.close_backends().await;
        metrics().record_connection_closed();

        result
    }

    fn verify_client(&self, response: &HandshakeResponse, scramble: &[u8]) -> bool {
        let expected_user = &self.config.client.user;
        if expected_user.is_empty() {
            // No client credentials configured, accept anyone
            return true;
        }
        if &response.username != expected_user {
            return false;
        }
        let expected = native_password_scramble(&self.config.client.password, scramble);
        response.auth_response == expected
    }

    /// Main command processing loop
    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = match client.next().await {
                Some(Ok(p)) => p,
                Some(Err(e)) => {
                    warn!(session_id = self.id, error = %e, "client read error");
                    return Err(e.into());
                }
                None => {
                    info!(session_id = self.id, "client disconnected");
                    return Ok(());
                }
            };

            // LOAD DATA LOCAL: relay data packets verbatim to the backend
            // that requested them
            if self.state.load_data == LoadDataState::Active {
                self.relay_load_data(client, packet).await?;
                continue;
            }

            // Continuation packets of a logical message larger than 2^24-1
            // bytes follow their head to the same backend, unclassified
            if let Some(server) = self.large_query_target {
                let done = !packet.is_full();
                self.backend_write(server, packet, None).await?;
                if done {
                    self.large_query_target = None;
                    self.forward_reply(client, server, None, false).await?;
                }
                continue;
            }

            if packet.command_code() == Some(Command::Quit) {
                info!(session_id = self.id, "client sent QUIT");
                return Ok(());
            }

            self.handle_command(client, packet).await?;
        }
    }

    #[instrument(skip_all, fields(session_id = self.id))]
    async fn handle_command<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        mut packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        self.reply_started = false;

        let mut classification = self
            .classifier
            .classify(&packet.payload, self.state.multi_statements_allowed)?;

        // Binary prepared-statement commands: resolve the client id to the
        // session-internal id and take the stored type mask
        let mut internal_ps: Option<u32> = None;
        let mut continuation: Option<usize> = None;

        if is_ps_command(classification.command) {
            let external = extract_ps_id(&packet.payload)?;
            match self.state.ps.resolve(external) {
                Some(internal) => {
                    internal_ps = Some(internal);
                    if classification.command == Command::StmtExecute
                        || classification.command == Command::StmtBulkExecute
                    {
                        classification.type_mask =
                            self.state.ps.type_of(internal) | TypeMask::EXEC_STMT;
                    }
                    set_ps_id(&mut packet, internal);

                    let params = self.state.ps.param_count(internal);
                    if query_continues_ps(
                        self.prev_command,
                        classification.command,
                        params,
                        &packet.payload,
                    ) {
                        continuation = self.prev_ps_target.get(&internal).copied();
                    }
                }
                None => {
                    // Unknown statement: route to the primary and let the
                    // server produce the error
                    warn!(session_id = self.id, external, "unknown prepared statement id");
                    classification.type_mask = TypeMask::UNKNOWN;
                }
            }
        }

        // Text-protocol EXECUTE takes the mask stored at PREPARE time
        if classification.command == Command::Query
            && classification.operation == Operation::Execute
        {
            if let Some(name) = &classification.ps_name {
                classification.type_mask = self.state.ps.type_of_text(name);
            }
        }

        if classification.command == Command::InitDb {
            let db = String::from_utf8_lossy(&packet.payload[1..]).to_string();
            self.pending_db = Some(db);
        }

        classification.type_mask = self.state.observe_classification(&classification);

        // Routing hints are produced upstream (comment filters, admin
        // interfaces); none originate here.
        let hints: &[Hint] = &[];
        let target = match continuation {
            Some(_) => RouteTarget::LAST_USED,
            None => select(
                &classification,
                &self.state,
                hints,
                self.config.routing.use_sql_variables_in,
            ),
        };

        debug!(
            session_id = self.id,
            command = ?classification.command,
            type_mask = %classification.type_mask,
            target = %target,
            "command classified"
        );
        metrics().record_route(&target.to_string());

        // Named prepared statements bookkeeping. The stored mask describes
        // the statement body, not the PREPARE itself.
        if classification.type_mask.contains(TypeMask::PREPARE_NAMED_STMT) {
            if let Some(name) = &classification.ps_name {
                self.state.ps.store_text(
                    name,
                    classification.type_mask.without(TypeMask::PREPARE_NAMED_STMT),
                );
            }
        }
        if classification.operation == Operation::Deallocate {
            if let Some(name) = &classification.ps_name {
                self.state.ps.erase_text(name);
            }
        }

        // Binary PREPARE: assign the internal id before dispatch
        if classification.command == Command::StmtPrepare {
            internal_ps = Some(
                self.state
                    .ps
                    .store(classification.type_mask.without(TypeMask::PREPARE_STMT)),
            );
        }

        let result = if classification.command == Command::ChangeUser {
            self.change_user(client, packet).await
        } else if let Some(server) = continuation {
            self.execute_on(client, server, packet, internal_ps).await
        } else if target.contains(RouteTarget::ALL) {
            self.broadcast(client, packet, internal_ps).await
        } else {
            let mut server = self
                .resolver
                .resolve(&self.config.servers, target, None, self.last_used)
                .ok_or(SessionError::NoServer(target))?;

            // A statement can only execute on a backend that prepared it
            if let Some(internal) = internal_ps {
                if is_ps_command(classification.command)
                    && !self
                        .backends
                        .get(&server)
                        .is_some_and(|c| c.has_ps(internal))
                {
                    if let Some(&prev) = self.prev_ps_target.get(&internal) {
                        server = prev;
                    }
                }
            }

            self.execute_with_failover(client, server, packet, internal_ps)
                .await
        };

        match result {
            Ok(()) => {
                self.prev_command = classification.command;
                if let Some(internal) = internal_ps {
                    if classification.command == Command::StmtClose {
                        self.state.ps.erase(internal);
                        self.prev_ps_target.remove(&internal);
                    }
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Execute on the chosen server; a failed read outside a transaction is
    /// retried once on the primary before giving up.
    async fn execute_with_failover<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        server: usize,
        packet: Packet,
        internal_ps: Option<u32>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let retry_packet = packet.clone();

        match self.execute_on(client, server, packet, internal_ps).await {
            Ok(()) => Ok(()),
            Err(SessionError::Backend(e)) => {
                warn!(
                    session_id = self.id,
                    server,
                    error = %e,
                    "backend failed while executing command"
                );
                metrics().record_backend_error("routing");
                self.backends.remove(&server);

                let primary = self
                    .resolver
                    .resolve(&self.config.servers, RouteTarget::PRIMARY, None, None);

                // Never retry once reply packets have reached the client
                let can_retry = !self.reply_started
                    && !self.state.is_trx_active()
                    && self.load_data_target.is_none()
                    && primary.is_some_and(|p| p != server);

                if can_retry {
                    let primary = primary.ok_or(SessionError::NoServer(RouteTarget::PRIMARY))?;
                    info!(session_id = self.id, "retrying command on the primary");
                    return self
                        .execute_on(client, primary, retry_packet, internal_ps)
                        .await;
                }

                // Surface the failure to the client; mid-transaction this is
                // unrecoverable
                let err = ErrPacket::new(
                    1927,
                    "HY000",
                    &format!("Connection to backend server lost (hermes proxy): {e}"),
                );
                client.send(err.encode(1, self.state.capability_flags)).await?;

                if self.state.is_trx_active() {
                    Err(SessionError::Backend(e))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn execute_on<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        server: usize,
        packet: Packet,
        internal_ps: Option<u32>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let command = packet.command_code();
        let is_full = packet.is_full();

        self.backend_write(server, packet, internal_ps).await?;

        if is_full {
            // The rest of the logical message follows; reply comes later
            self.large_query_target = Some(server);
            return Ok(());
        }

        if command.is_some_and(|c| !c.expects_response()) {
            // Long data has no reply, but the follow-up EXECUTE must reach
            // the same backend
            if command == Some(Command::StmtSendLongData) {
                if let Some(internal) = internal_ps {
                    self.prev_ps_target.insert(internal, server);
                }
            }
            return Ok(());
        }

        let is_prepare = command == Some(Command::StmtPrepare);
        self.forward_reply(client, server, internal_ps, is_prepare).await
    }

    /// Write to a backend, opening or reusing a connection if needed. The
    /// write is queued by the engine while the connection is still being
    /// established; `establish` drains the queue.
    async fn backend_write(
        &mut self,
        server: usize,
        packet: Packet,
        internal_ps: Option<u32>,
    ) -> Result<(), SessionError> {
        self.ensure_backend(server).await?;

        let conn = self
            .backends
            .get_mut(&server)
            .ok_or_else(|| SessionError::Internal("backend vanished".to_string()))?;

        conn.write_ps(packet, internal_ps).await?;

        if !conn.is_established() {
            conn.establish().await?;
        }

        Ok(())
    }

    async fn ensure_backend(&mut self, server: usize) -> Result<(), SessionError> {
        if self.backends.contains_key(&server) {
            return Ok(());
        }

        let target = self
            .config
            .servers
            .get(server)
            .ok_or_else(|| SessionError::Internal(format!("no server with index {server}")))?;

        if let Some(mut conn) = self.pool.checkout(server).await {
            conn.reuse().await?;
            self.backends.insert(server, conn);
            return Ok(());
        }

        let mut conn = BackendConnection::connect(
            &target.addr(),
            &target.name,
            Arc::new(self.config.backend.clone()),
        )
        .await?;
        conn.set_deprecate_eof(
            self.state.capability_flags & capabilities::CLIENT_DEPRECATE_EOF != 0,
        );
        self.backends.insert(server, conn);
        Ok(())
    }

    /// Forward one complete reply from a backend to the client. When the
    /// reply answers a COM_STMT_PREPARE, its header is rewritten so the
    /// client sees the session-internal statement id.
    async fn forward_reply<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        server: usize,
        internal_ps: Option<u32>,
        rewrite_prepare: bool,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut first = true;

        loop {
            let event = {
                let conn = self
                    .backends
                    .get_mut(&server)
                    .ok_or_else(|| SessionError::Internal("backend vanished".to_string()))?;
                conn.next_event().await?
            };

            match event {
                BackendEvent::Consumed => continue,
                BackendEvent::Forward(mut pkt) => {
                    if first {
                        if rewrite_prepare {
                            rewrite_prepare_response(&mut pkt, internal_ps);
                        }
                        first = false;
                    }
                    self.reply_started = true;
                    client.send(pkt).await?;
                }
                BackendEvent::LoadDataRequest(pkt) => {
                    debug!(session_id = self.id, server, "LOAD DATA LOCAL requested");
                    client.send(pkt).await?;
                    self.state.load_data = LoadDataState::Active;
                    self.state.load_data_sent = 0;
                    self.load_data_target = Some(server);
                    return Ok(());
                }
                BackendEvent::Complete(mut pkt, reply) => {
                    // Connection-fatal server errors (08xxx) are not user
                    // errors: the backend is lost, let the failover path
                    // decide what the client sees
                    if let Some(err) = &reply.error {
                        if err.is_connection_fatal() {
                            warn!(
                                session_id = self.id,
                                server,
                                code = err.error_code,
                                "backend reported a connection-fatal error"
                            );
                            return Err(BackendError::from_err_packet(err.clone()).into());
                        }
                    }

                    if first && rewrite_prepare {
                        rewrite_prepare_response(&mut pkt, internal_ps);
                    }
                    client.send(pkt).await?;
                    self.finish_reply(server, internal_ps, &reply);
                    return Ok(());
                }
            }
        }
    }

    /// Consume a broadcast reply without forwarding it
    async fn drain_reply(&mut self, server: usize) -> Result<(), SessionError> {
        loop {
            let conn = self
                .backends
                .get_mut(&server)
                .ok_or_else(|| SessionError::Internal("backend vanished".to_string()))?;

            match conn.next_event().await? {
                BackendEvent::Complete(_, _) => return Ok(()),
                BackendEvent::LoadDataRequest(_) => {
                    return Err(SessionError::Internal(
                        "LOAD DATA in a broadcast reply".to_string(),
                    ))
                }
                _ => continue,
            }
        }
    }

    fn finish_reply(&mut self, server: usize, internal_ps: Option<u32>, reply: &crate::backend::Reply) {
        self.last_used = Some(server);

        if reply.is_ok {
            // Apply observed server state: status flags and session tracking
            let ok = OkPacket {
                status_flags: reply.server_status,
                warnings: reply.warnings,
                state_changes: reply.state_changes.clone(),
                ..Default::default()
            };
            self.state.observe_ok(&ok);

            if let Some(db) = self.pending_db.take() {
                self.state.change_database(db);
            }
        } else {
            self.pending_db = None;
        }

        if let (Some(ps), Some(internal)) = (&reply.ps_response, internal_ps) {
            self.state.ps.store_response(internal, ps.num_params);
            self.prev_ps_target.insert(internal, server);
        } else if let Some(internal) = internal_ps {
            self.prev_ps_target.insert(internal, server);
        }

        self.state.command_complete();
        metrics().record_reply(reply.error.is_none());
    }

    /// Send a command to every configured server; the first reply (primary
    /// preferred) is forwarded, the rest are drained and discarded.
    async fn broadcast<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
        internal_ps: Option<u32>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        // Broadcast reaches the backends this session has open, and always
        // the primary so its session state never goes stale
        let primary = self
            .resolver
            .resolve(&self.config.servers, RouteTarget::PRIMARY, None, None)
            .ok_or(SessionError::NoServer(RouteTarget::ALL))?;
        self.ensure_backend(primary).await?;

        // Primaries first so the authoritative reply is the one forwarded
        let mut order: Vec<usize> = self.backends.keys().copied().collect();
        order.sort_by_key(|&i| !self.config.servers[i].is_primary());

        let command = packet.command_code();

        for &server in &order {
            self.backend_write(server, packet.clone(), internal_ps).await?;
        }

        if command.is_some_and(|c| !c.expects_response()) {
            return Ok(());
        }

        let is_prepare = command == Some(Command::StmtPrepare);
        let mut forwarded = false;
        for &server in &order {
            if !forwarded {
                self.forward_reply(client, server, internal_ps, is_prepare)
                    .await?;
                forwarded = true;
            } else {
                self.drain_reply(server).await?;
            }
        }

        Ok(())
    }

    /// COM_CHANGE_USER: a mini re-authentication against every open backend.
    /// The engines suppress the intermediate exchange; only the final OK or
    /// ERR reaches the client. All prepared statements die with the old user.
    async fn change_user<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let primary = self
            .resolver
            .resolve(&self.config.servers, RouteTarget::PRIMARY, None, None)
            .ok_or(SessionError::NoServer(RouteTarget::PRIMARY))?;
        self.ensure_established(primary).await?;

        let mut order: Vec<usize> = self.backends.keys().copied().collect();
        order.sort_by_key(|&i| !self.config.servers[i].is_primary());

        for &server in &order {
            self.ensure_established(server).await?;
            let conn = self
                .backends
                .get_mut(&server)
                .ok_or_else(|| SessionError::Internal("backend vanished".to_string()))?;
            conn.change_user(packet.clone()).await?;
        }

        self.state.ps = PsRegistry::new();
        self.prev_ps_target.clear();

        let mut forwarded = false;
        for &server in &order {
            if !forwarded {
                self.forward_reply(client, server, None, false).await?;
                forwarded = true;
            } else {
                self.drain_reply(server).await?;
            }
        }

        Ok(())
    }

    async fn ensure_established(&mut self, server: usize) -> Result<(), SessionError> {
        self.ensure_backend(server).await?;
        let conn = self
            .backends
            .get_mut(&server)
            .ok_or_else(|| SessionError::Internal("backend vanished".to_string()))?;
        if !conn.is_established() {
            conn.establish().await?;
        }
        Ok(())
    }

    /// Relay one LOAD DATA LOCAL data packet from the client
    async fn relay_load_data<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        packet: Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let server = self
            .load_data_target
            .ok_or_else(|| SessionError::Internal("LOAD DATA without a target".to_string()))?;

        self.state.load_data_sent += packet.payload.len() as u64;
        let is_terminator = packet.payload.is_empty();

        self.backend_write(server, packet, None).await?;

        if is_terminator {
            debug!(
                session_id = self.id,
                bytes = self.state.load_data_sent,
                "LOAD DATA LOCAL finished"
            );
            self.state.load_data = LoadDataState::End;
            // The backend answers the whole statement with one final OK
            self.forward_reply(client, server, None, false).await?;
            self.state.load_data = LoadDataState::Inactive;
            self.load_data_target = None;
        }

        Ok(())
    }

    async fn close_backends(&mut self) {
        for (server, mut conn) in self.backends.drain() {
            if conn.can_close() {
                // Reusable: park in the pool, reset happens at checkout
                self.pool.checkin(server, conn).await;
            } else {
                conn.finish().await;
            }
        }
    }
}

/// Overwrite the statement id of a COM_STMT_* payload
fn set_ps_id(packet: &mut Packet, id: u32) {
    if packet.payload.len() >= 5 {
        let mut buf = packet.payload.to_vec();
        buf[1..5].copy_from_slice(&id.to_le_bytes());
        packet.payload = buf.into();
    }
}

/// Rewrite the statement id of a forwarded STMT_PREPARE_OK header so the
/// client sees the session-internal id
fn rewrite_prepare_response(packet: &mut Packet, internal_ps: Option<u32>) {
    if let Some(internal) = internal_ps {
        if packet.payload.len() >= 12 && packet.payload[0] == 0x00 {
            let mut buf = packet.payload.to_vec();
            buf[1..5].copy_from_slice(&internal.to_le_bytes());
            packet.payload = buf.into();
        }
    }
}


/// End-to-end tests: a full session between a scripted client and scripted
/// backend servers listening on loopback TCP.
#[cfg(test)]
mod proxy_tests {
    use super::*;
    use crate::config::{BackendSettings, PoolConfig, ServerConfig, ServerRole, ServerTarget};
    use crate::protocol::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
    use crate::testutil::*;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;

    fn test_config(servers: Vec<ServerTarget>) -> Arc<Config> {
        Arc::new(Config {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 0,
            },
            client: Default::default(),
            routing: Default::default(),
            backend: BackendSettings {
                user: "u".to_string(),
                password: "p".to_string(),
                database: None,
                init_queries: vec![],
                proxy_protocol: false,
                ssl: false,
                multi_statements: false,
                connect_timeout_secs: 5,
                write_timeout_secs: 5,
            },
            pool: PoolConfig::default(),
            servers,
        })
    }

    fn target(name: &str, port: u16, role: ServerRole) -> ServerTarget {
        ServerTarget {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            role,
        }
    }

    async fn bind() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn spawn_session(config: Arc<Config>) -> DuplexStream {
        let (client_end, session_end) = duplex(1 << 20);
        let pool = Arc::new(ConnectionPool::new(config.pool.clone()));
        let session = Session::new(1, config, pool);
        tokio::spawn(async move {
            let _ = session.run(session_end).await;
        });
        client_end
    }

    /// Client-side handshake against the proxy
    async fn client_connect(stream: &mut DuplexStream) {
        let handshake = read_packet(stream).await;
        assert_eq!(handshake.payload[0], 10); // protocol version

        let response = crate::protocol::HandshakeResponse {
            capability_flags: crate::protocol::capabilities::CLIENT_PROTOCOL_41
                | crate::protocol::capabilities::CLIENT_SECURE_CONNECTION
                | crate::protocol::capabilities::CLIENT_PLUGIN_AUTH,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "app".to_string(),
            auth_response: vec![],
            database: None,
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        write_packet(stream, response.encode(1)).await;

        let ok = read_packet(stream).await;
        assert_eq!(ok.payload[0], 0x00);
    }

    async fn client_query(stream: &mut DuplexStream, sql: &str) {
        write_packet(stream, Packet::command(Command::Query, sql.as_bytes())).await;
    }

    /// Read a full result set (column count through final EOF), returning
    /// the number of row packets
    async fn client_read_result_set(stream: &mut DuplexStream) -> usize {
        let count_packet = read_packet(stream).await;
        let cols = count_packet.payload[0] as usize;

        for _ in 0..cols {
            read_packet(stream).await;
        }
        let eof = read_packet(stream).await;
        assert_eq!(eof.payload[0], 0xFE);

        let mut rows = 0;
        loop {
            let packet = read_packet(stream).await;
            if packet.payload[0] == 0xFE && packet.payload.len() < 9 {
                return rows;
            }
            rows += 1;
        }
    }

    #[tokio::test]
    async fn select_routes_to_replica() {
        let (primary_listener, primary_port) = bind().await;
        let (replica_listener, replica_port) = bind().await;

        let config = test_config(vec![
            target("primary-1", primary_port, ServerRole::Primary),
            target("replica-1", replica_port, ServerRole::Replica),
        ]);

        let replica = tokio::spawn(async move {
            let (stream, _) = replica_listener.accept().await.unwrap();
            let mut stream = stream;
            serve_connection_setup(&mut stream).await;

            let query = read_packet(&mut stream).await;
            assert_eq!(&query.payload[1..], b"SELECT 1");
            serve_select_one(&mut stream).await;
        });

        let mut client = spawn_session(config);
        client_connect(&mut client).await;

        client_query(&mut client, "SELECT 1").await;
        let rows = client_read_result_set(&mut client).await;
        assert_eq!(rows, 1);

        write_packet(&mut client, Packet::command(Command::Quit, &[])).await;
        replica.await.unwrap();

        // The primary was never contacted
        let unused = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            primary_listener.accept(),
        )
        .await;
        assert!(unused.is_err());
    }

    #[tokio::test]
    async fn transaction_sticks_to_primary() {
        let (primary_listener, primary_port) = bind().await;
        let (replica_listener, replica_port) = bind().await;

        let config = test_config(vec![
            target("primary-1", primary_port, ServerRole::Primary),
            target("replica-1", replica_port, ServerRole::Replica),
        ]);

        let primary = tokio::spawn(async move {
            let (mut stream, _) = primary_listener.accept().await.unwrap();
            let caps = serve_connection_setup(&mut stream).await;
            let mut commands = vec![];

            // BEGIN
            let q = read_packet(&mut stream).await;
            commands.push(String::from_utf8_lossy(&q.payload[1..]).to_string());
            let in_trans = crate::protocol::OkPacket {
                status_flags: SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_IN_TRANS,
                ..Default::default()
            };
            write_packet(&mut stream, in_trans.encode(1, caps)).await;

            // SELECT inside the transaction
            let q = read_packet(&mut stream).await;
            commands.push(String::from_utf8_lossy(&q.payload[1..]).to_string());
            write_packet(&mut stream, col_count(1)).await;
            write_packet(&mut stream, coldef("1", 2)).await;
            write_packet(
                &mut stream,
                eof(3, SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_IN_TRANS),
            )
            .await;
            write_packet(&mut stream, text_row(&["1"], 4)).await;
            write_packet(
                &mut stream,
                eof(5, SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_IN_TRANS),
            )
            .await;

            // COMMIT
            let q = read_packet(&mut stream).await;
            commands.push(String::from_utf8_lossy(&q.payload[1..]).to_string());
            write_packet(&mut stream, ok(1, caps)).await;

            commands
        });

        let replica = tokio::spawn(async move {
            let (mut stream, _) = replica_listener.accept().await.unwrap();
            serve_connection_setup(&mut stream).await;
            let query = read_packet(&mut stream).await;
            let sql = String::from_utf8_lossy(&query.payload[1..]).to_string();
            serve_select_one(&mut stream).await;
            sql
        });

        let mut client = spawn_session(config);
        client_connect(&mut client).await;

        client_query(&mut client, "BEGIN").await;
        let ok_packet = read_packet(&mut client).await;
        assert_eq!(ok_packet.payload[0], 0x00);

        client_query(&mut client, "SELECT * FROM t").await;
        assert_eq!(client_read_result_set(&mut client).await, 1);

        client_query(&mut client, "COMMIT").await;
        let ok_packet = read_packet(&mut client).await;
        assert_eq!(ok_packet.payload[0], 0x00);

        // Outside the transaction, reads move to the replica
        client_query(&mut client, "SELECT 2").await;
        assert_eq!(client_read_result_set(&mut client).await, 1);

        write_packet(&mut client, Packet::command(Command::Quit, &[])).await;

        let primary_commands = primary.await.unwrap();
        assert_eq!(primary_commands, vec!["BEGIN", "SELECT * FROM t", "COMMIT"]);
        assert_eq!(replica.await.unwrap(), "SELECT 2");
    }

    #[tokio::test]
    async fn prepared_statement_lifecycle() {
        let (primary_listener, primary_port) = bind().await;

        let config = test_config(vec![target("primary-1", primary_port, ServerRole::Primary)]);

        let primary = tokio::spawn(async move {
            let (mut stream, _) = primary_listener.accept().await.unwrap();
            let caps = serve_connection_setup(&mut stream).await;

            // PREPARE: the backend assigns statement id 7
            let prepare = read_packet(&mut stream).await;
            assert_eq!(prepare.payload[0], 0x16);
            assert_eq!(&prepare.payload[1..], b"SELECT ?");
            write_packet(&mut stream, prepare_ok(1, 7, 1, 1)).await;
            write_packet(&mut stream, coldef("?", 2)).await;
            write_packet(&mut stream, eof(3, SERVER_STATUS_AUTOCOMMIT)).await;
            write_packet(&mut stream, coldef("1", 4)).await;
            write_packet(&mut stream, eof(5, SERVER_STATUS_AUTOCOMMIT)).await;

            // EXECUTE must arrive with the backend's id
            let execute = read_packet(&mut stream).await;
            assert_eq!(execute.payload[0], 0x17);
            assert_eq!(&execute.payload[1..5], &[7, 0, 0, 0]);
            write_packet(&mut stream, ok(1, caps)).await;

            // CLOSE is fire-and-forget, also with the backend's id
            let close = read_packet(&mut stream).await;
            assert_eq!(close.payload[0], 0x19);
            assert_eq!(&close.payload[1..5], &[7, 0, 0, 0]);
        });

        let mut client = spawn_session(config);
        client_connect(&mut client).await;

        // Prepare; the client sees the proxy's internal statement id 1
        write_packet(
            &mut client,
            Packet::command(Command::StmtPrepare, b"SELECT ?"),
        )
        .await;
        let response = read_packet(&mut client).await;
        assert_eq!(response.payload[0], 0x00);
        assert_eq!(&response.payload[1..5], &[1, 0, 0, 0]);
        // param def + EOF + column def + EOF
        for _ in 0..4 {
            read_packet(&mut client).await;
        }

        // Execute with the client-visible id 1
        let mut execute = vec![0x17];
        execute.extend_from_slice(&1u32.to_le_bytes());
        execute.extend_from_slice(&[0x00, 1, 0, 0, 0]);
        write_packet(&mut client, Packet::new(0, execute)).await;
        let ok_packet = read_packet(&mut client).await;
        assert_eq!(ok_packet.payload[0], 0x00);

        // Close with the client-visible id
        let mut close = vec![0x19];
        close.extend_from_slice(&1u32.to_le_bytes());
        write_packet(&mut client, Packet::new(0, close)).await;

        write_packet(&mut client, Packet::command(Command::Quit, &[])).await;
        primary.await.unwrap();
    }

    #[tokio::test]
    async fn load_data_local_infile_relay() {
        let (primary_listener, primary_port) = bind().await;

        let config = test_config(vec![target("primary-1", primary_port, ServerRole::Primary)]);

        let primary = tokio::spawn(async move {
            let (mut stream, _) = primary_listener.accept().await.unwrap();
            let caps = serve_connection_setup(&mut stream).await;

            let query = read_packet(&mut stream).await;
            assert!(query.payload.starts_with(b"\x03LOAD DATA LOCAL INFILE"));

            let mut request = vec![0xFB];
            request.extend_from_slice(b"/tmp/rows.csv");
            write_packet(&mut stream, Packet::new(1, request)).await;

            let d1 = read_packet(&mut stream).await;
            assert_eq!(&d1.payload[..], b"a,b\n");
            let d2 = read_packet(&mut stream).await;
            assert_eq!(&d2.payload[..], b"c,d\n");
            let terminator = read_packet(&mut stream).await;
            assert!(terminator.payload.is_empty());

            write_packet(&mut stream, ok(5, caps)).await;
        });

        let mut client = spawn_session(config);
        client_connect(&mut client).await;

        client_query(
            &mut client,
            "LOAD DATA LOCAL INFILE '/tmp/rows.csv' INTO TABLE t",
        )
        .await;

        // The proxy forwards the file request
        let request = read_packet(&mut client).await;
        assert_eq!(request.payload[0], 0xFB);

        write_packet(&mut client, Packet::new(2, &b"a,b\n"[..])).await;
        write_packet(&mut client, Packet::new(3, &b"c,d\n"[..])).await;
        write_packet(&mut client, Packet::new(4, bytes::Bytes::new())).await;

        let final_ok = read_packet(&mut client).await;
        assert_eq!(final_ok.payload[0], 0x00);

        write_packet(&mut client, Packet::command(Command::Quit, &[])).await;
        primary.await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_reaches_all_open_backends() {
        let (primary_listener, primary_port) = bind().await;
        let (replica_listener, replica_port) = bind().await;

        let config = test_config(vec![
            target("primary-1", primary_port, ServerRole::Primary),
            target("replica-1", replica_port, ServerRole::Replica),
        ]);

        let primary = tokio::spawn(async move {
            let (mut stream, _) = primary_listener.accept().await.unwrap();
            let caps = serve_connection_setup(&mut stream).await;
            let q = read_packet(&mut stream).await;
            let sql = String::from_utf8_lossy(&q.payload[1..]).to_string();
            write_packet(&mut stream, ok(1, caps)).await;
            sql
        });

        let replica = tokio::spawn(async move {
            let (mut stream, _) = replica_listener.accept().await.unwrap();
            let caps = serve_connection_setup(&mut stream).await;

            // First the read that opened this backend, then the broadcast
            let q = read_packet(&mut stream).await;
            assert_eq!(&q.payload[1..], b"SELECT 1");
            serve_select_one(&mut stream).await;

            let q = read_packet(&mut stream).await;
            let sql = String::from_utf8_lossy(&q.payload[1..]).to_string();
            write_packet(&mut stream, ok(1, caps)).await;
            sql
        });

        let mut client = spawn_session(config);
        client_connect(&mut client).await;

        // Open the replica with a read
        client_query(&mut client, "SELECT 1").await;
        client_read_result_set(&mut client).await;

        // A session write is broadcast; exactly one OK reaches the client
        client_query(&mut client, "SET NAMES utf8mb4").await;
        let ok_packet = read_packet(&mut client).await;
        assert_eq!(ok_packet.payload[0], 0x00);

        write_packet(&mut client, Packet::command(Command::Quit, &[])).await;

        assert_eq!(primary.await.unwrap(), "SET NAMES utf8mb4");
        assert_eq!(replica.await.unwrap(), "SET NAMES utf8mb4");
    }
}
