//! Backend side of a session: one `BackendConn` per server, driving the
//! handshake/auth sequence, connection-init queries, history replay and the
//! routing phase, with PS id rewriting on every forwarded statement.

use crate::backend::reply::{Reply, ReplyBuilder};
use crate::backend::{BackendInstance, BackendState, DelayedQueue};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::auth_plugin::native_password_token;
use crate::protocol::mysql::basic::{err_packet, initial_handshake};
use crate::protocol::mysql::constants::{AuthPluginName, CommandCode};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{writers, Packet};
use crate::session::history::SessionHistory;
use crate::session::ps_map::{
    execute_metadata, extract_ps_id, rewrite_ps_id, splice_execute_metadata, PsMap,
};
use crate::session::BackendId;

use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use std::collections::VecDeque;
use std::io::Write;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Capability bits that change how the protocol works; a pooled connection
/// can only serve a session whose bits match, and a backend must advertise a
/// superset of what the session negotiated.
pub const RELEVANT_CAPS: CapabilityFlags = CapabilityFlags::CLIENT_DEPRECATE_EOF
    .union(CapabilityFlags::CLIENT_MULTI_RESULTS)
    .union(CapabilityFlags::CLIENT_MULTI_STATEMENTS)
    .union(CapabilityFlags::CLIENT_SESSION_TRACK)
    .union(CapabilityFlags::CLIENT_PS_MULTI_RESULTS);

/// Session identity a backend connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnIdentity {
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    pub capabilities: CapabilityFlags,
    /// Client address, compared when the PROXY protocol is in use.
    pub client_remote: Option<String>,
}

impl ConnIdentity {
    pub fn user_and_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// What happened to one backend while connecting, surfaced so the caller can
/// act on well-known server errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// ER_HOST_IS_BLOCKED: put the server in maintenance.
    HostBlocked,
    /// ER_ACCESS_DENIED_ERROR: request a rate-limited user-data refresh.
    AccessDenied,
    Other,
}

pub fn classify_connect_error(code: u16) -> ConnectFailure {
    match code {
        c if c == ErrorKind::ER_HOST_IS_BLOCKED as u16 => ConnectFailure::HostBlocked,
        c if c == ErrorKind::ER_ACCESS_DENIED_ERROR as u16 => ConnectFailure::AccessDenied,
        _ => ConnectFailure::Other,
    }
}

pub struct BackendConn<R, W> {
    pub id: BackendId,
    pub instance: BackendInstance,
    pub state: BackendState,
    pub reader: PacketReader<R>,
    pub writer: PacketWriter<W>,
    /// Capabilities advertised by the server in its greeting.
    pub server_capabilities: CapabilityFlags,
    pub identity: ConnIdentity,
    pub delayed: DelayedQueue,
    /// History entry ids whose replay replies are still outstanding.
    history_outstanding: VecDeque<u32>,
    idle_since: coarsetime::Instant,
}

impl<R, W> BackendConn<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(id: BackendId, instance: BackendInstance, reader: R, writer: W) -> Self {
        Self {
            id,
            instance,
            state: BackendState::Handshaking,
            reader: PacketReader::new(reader),
            writer: PacketWriter::new(writer),
            server_capabilities: CapabilityFlags::empty(),
            identity: ConnIdentity::default(),
            delayed: DelayedQueue::default(),
            history_outstanding: VecDeque::new(),
            idle_since: coarsetime::Instant::now(),
        }
    }

    fn fail(&mut self, reason: impl Into<String>) -> ProxyError {
        self.state = BackendState::Failed;
        ProxyError::backend_permanent(self.instance.name.clone(), reason)
    }

    /// Optional PROXY protocol v1 line, the very first bytes on the socket.
    pub async fn send_proxy_header(
        &mut self,
        client: &std::net::SocketAddr,
        server: &std::net::SocketAddr,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        let line = writers::proxy_protocol_v1_header(client, server);
        self.writer.inner_writer.write_all(line.as_bytes()).await?;
        self.writer.flush_all().await?;
        Ok(())
    }

    /// Drive the handshake and authentication with the backend, using the
    /// native password exchange (with an auth-switch round trip when the
    /// server asks for a different plugin).
    pub async fn authenticate(&mut self, identity: ConnIdentity, password: &[u8]) -> Result<()> {
        debug_assert_eq!(self.state, BackendState::Handshaking);
        let (greeting_seq, greeting) = self.read_packet().await?;
        let (_, server_greeting) = initial_handshake(&greeting)
            .map_err(|e| self.fail(format!("malformed server greeting: {e:?}")))?;

        self.server_capabilities = server_greeting.capabilities;

        // The backend must support every protocol-shaping capability the
        // session negotiated, otherwise replies cannot be relayed verbatim.
        let session_relevant = identity.capabilities & RELEVANT_CAPS;
        if self.server_capabilities & session_relevant != session_relevant {
            return Err(self.fail(format!(
                "capability mismatch: session needs {:?}, server offers {:?}",
                session_relevant,
                self.server_capabilities & RELEVANT_CAPS
            )));
        }

        self.state = BackendState::Authenticating;

        let token = native_password_token(password, &server_greeting.scramble);
        let response_caps = (identity.capabilities & self.server_capabilities)
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PROTOCOL_41;

        self.writer.set_seq(greeting_seq.wrapping_add(1));
        self.write_handshake_response(&identity, response_caps, &token)?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await?;

        loop {
            let (seq, packet) = self.read_packet().await?;
            if packet.is_ok_packet() {
                break;
            } else if packet.is_err_packet() {
                let code = err_packet(&packet)
                    .map(|(_, e)| e.code)
                    .unwrap_or_default();
                let failure = classify_connect_error(code);
                warn!(
                    "Backend {} refused authentication (error {code}, {failure:?})",
                    self.instance.name
                );
                return Err(self.fail(format!("authentication failed with error {code}")));
            } else if packet.first() == Some(&0xfe) {
                // AuthSwitchRequest: plugin name, NUL, fresh scramble
                let body = &packet[1..];
                let plugin_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                let plugin = AuthPluginName::from_bytes(&body[..plugin_end]);
                let scramble: Vec<u8> = body[plugin_end + 1..]
                    .iter()
                    .copied()
                    .filter(|b| *b != 0)
                    .collect();
                let response = match plugin {
                    AuthPluginName::AuthNativePassword => {
                        native_password_token(password, &scramble).to_vec()
                    }
                    AuthPluginName::AuthClearPassword => {
                        let mut cleartext = password.to_vec();
                        cleartext.push(0);
                        cleartext
                    }
                    other => {
                        return Err(self.fail(format!(
                            "unsupported auth switch to {:?}",
                            other.as_ref()
                        )))
                    }
                };
                self.writer.set_seq(seq.wrapping_add(1));
                self.writer.write_all(&response)?;
                self.writer.end_packet().await?;
                self.writer.flush_all().await?;
            } else {
                return Err(self.fail("unexpected packet during authentication"));
            }
        }

        self.identity = identity;
        self.state = BackendState::ConnectionInit;
        Ok(())
    }

    fn write_handshake_response(
        &mut self,
        identity: &ConnIdentity,
        caps: CapabilityFlags,
        token: &[u8],
    ) -> Result<()> {
        let mut caps = caps;
        if identity.db.is_some() {
            caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        self.writer.write_all(&caps.bits().to_le_bytes())?;
        self.writer.write_all(&16_777_216_u32.to_le_bytes())?;
        self.writer
            .write_all(&[crate::protocol::mysql::charset::DEFAULT_COLLATION_ID])?;
        self.writer.write_all(&[0u8; 23])?;
        self.writer.write_all(identity.user.as_bytes())?;
        self.writer.write_all(&[0])?;
        self.writer.write_all(&[token.len() as u8])?;
        self.writer.write_all(token)?;
        if let Some(db) = &identity.db {
            self.writer.write_all(db.as_bytes())?;
            self.writer.write_all(&[0])?;
        }
        self.writer
            .write_all(AuthPluginName::AuthNativePassword.as_ref().as_bytes())?;
        self.writer.write_all(&[0])?;
        Ok(())
    }

    /// Listener-level connection-init SQL: one OK expected per query; any
    /// error aborts the backend permanently.
    pub async fn run_connection_init(&mut self, init_sql: &[String]) -> Result<()> {
        debug_assert_eq!(self.state, BackendState::ConnectionInit);
        for sql in init_sql {
            self.writer.reset_seq();
            writers::write_query_request(&mut self.writer, sql.as_bytes()).await?;
            self.writer.flush_all().await?;
            let (_, reply) = self.read_packet().await?;
            if !reply.is_ok_packet() {
                return Err(self.fail(format!("connection init query failed: {sql}")));
            }
        }
        self.state = BackendState::SendHistory;
        Ok(())
    }

    /// Write the whole session command history in order.
    pub async fn send_history(&mut self, history: &SessionHistory) -> Result<()> {
        self.history_outstanding.clear();
        for entry in history.replay_entries() {
            info!(
                "Execute sescmd {} on '{}': {} bytes",
                entry.id,
                self.instance.name,
                entry.packet.len()
            );
            self.writer.reset_seq();
            self.writer.write_all(&entry.packet)?;
            self.writer.end_packet().await?;
            self.history_outstanding.push_back(entry.id);
        }
        self.writer.flush_all().await?;
        self.state = BackendState::ReadHistory;
        Ok(())
    }

    /// Consume one reply per replayed history entry, comparing each with the
    /// response the client already accepted. A mismatch closes this backend
    /// with a diagnostic naming the diverging entry.
    pub async fn read_history_responses(&mut self, history: &mut SessionHistory) -> Result<()> {
        debug_assert_eq!(self.state, BackendState::ReadHistory);
        while let Some(id) = self.history_outstanding.pop_front() {
            let reply = self.read_one_reply(CommandCode::ComQuery).await?;
            if history.verify_replay(id, reply.is_ok).is_err() {
                let expected = history.response(id);
                return Err(self.fail(format!(
                    "history replay diverged at command {id}: \
                     expected is_ok={expected:?}, got is_ok={}",
                    reply.is_ok
                )));
            }
            history.advance_position(self.id, id);
        }
        self.state = BackendState::SendDelayq;
        Ok(())
    }

    /// Replay packets that were routed here while the backend was still
    /// initializing, then enter the routing phase.
    pub async fn flush_delayed(&mut self, ps_map: &mut PsMap) -> Result<()> {
        while let Some(packet) = self.delayed.pop() {
            self.forward(&packet, ps_map).await?;
        }
        self.state = BackendState::Routing;
        self.idle_since = coarsetime::Instant::now();
        Ok(())
    }

    /// Forward one routed packet, rewriting the PS id to this backend's
    /// external id and splicing execute metadata when the client omitted it.
    pub async fn forward(&mut self, packet: &Packet, ps_map: &mut PsMap) -> Result<()> {
        let mut payload = packet.as_ref().to_vec();

        let cmd = packet.command().and_then(CommandCode::from_u8);
        if let Some(cmd) = cmd {
            if cmd.is_ps_command() && !packet.is_multi_part() {
                let internal = extract_ps_id(&payload)
                    .map(|id| ps_map.resolve(id))
                    .unwrap_or(0);
                if cmd == CommandCode::ComStmtExecute {
                    self.prepare_execute_payload(&mut payload, internal, ps_map);
                }
                if let Some(external) = ps_map.external_id(internal, self.id) {
                    rewrite_ps_id(&mut payload, external);
                } else {
                    warn!(
                        "No external id for ps {internal} on backend {}",
                        self.instance.name
                    );
                }
            }
        }

        self.writer.reset_seq();
        if packet.is_multi_part() {
            // continuation frames of a large query pass through unparsed
            debug!("Forwarding large request of {} bytes", payload.len());
        }
        self.writer.write_all(&payload)?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await?;
        self.idle_since = coarsetime::Instant::now();
        Ok(())
    }

    fn prepare_execute_payload(&self, payload: &mut Vec<u8>, internal: u32, ps_map: &mut PsMap) {
        let Some(entry) = ps_map.get(internal) else {
            return;
        };
        let param_count = entry.param_count;
        if param_count == 0 {
            return;
        }
        if let Some(meta) = execute_metadata(payload, param_count) {
            let meta = meta.to_vec();
            if let Some(entry) = ps_map.get_mut(internal) {
                entry.exec_metadata = Some(meta);
            }
        } else {
            let metadata = ps_map.get(internal).and_then(|e| e.exec_metadata.clone());
            match metadata {
                Some(meta) => {
                    if let Some(spliced) = splice_execute_metadata(payload, param_count, &meta) {
                        *payload = spliced;
                    }
                }
                None => warn!(
                    "Could not find previous parameter metadata for ps {internal}; \
                     the server will likely reject the execute"
                ),
            }
        }
    }

    /// Read the complete reply of one command, driving a fresh builder.
    pub async fn read_one_reply(&mut self, command: CommandCode) -> Result<Reply> {
        let mut builder = ReplyBuilder::new(command, self.identity.capabilities);
        while !builder.is_complete() {
            let (_, packet) = self.read_packet().await?;
            let mut packet = packet;
            builder.process(&mut packet);
        }
        Ok(builder.reply().clone())
    }

    /// COM_PING an idle connection; its OK returns it to routing.
    pub async fn ping(&mut self) -> Result<()> {
        self.state = BackendState::Pinging;
        writers::write_com_ping(&mut self.writer).await?;
        let (_, reply) = self.read_packet().await?;
        if reply.is_ok_packet() {
            self.state = BackendState::Routing;
            self.idle_since = coarsetime::Instant::now();
            Ok(())
        } else {
            Err(self.fail("ping failed"))
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.idle_since.elapsed().as_millis())
    }

    /// Begin a RESET_CONNECTION reuse. With no connection-init queries the
    /// fast path sends the history while the reset's single OK is still in
    /// flight.
    pub async fn start_reset(
        &mut self,
        history: &SessionHistory,
        has_init_sql: bool,
    ) -> Result<()> {
        writers::write_reset_connection(&mut self.writer).await?;
        if !has_init_sql {
            self.send_history(history).await?;
            self.state = BackendState::ResetConnectionFast;
        } else {
            self.state = BackendState::ResetConnection;
        }
        Ok(())
    }

    /// Consume the COM_RESET_CONNECTION reply and move to the next phase.
    pub async fn finish_reset(&mut self) -> Result<()> {
        let (_, reply) = self.read_packet().await?;
        if reply.is_err_packet() {
            return Err(self.fail("reset connection failed"));
        }
        self.state = match self.state {
            BackendState::ResetConnectionFast => BackendState::ReadHistory,
            _ => BackendState::ConnectionInit,
        };
        Ok(())
    }

    /// Send a COM_CHANGE_USER carrying the new identity.
    pub async fn change_user(&mut self, identity: ConnIdentity, password: &[u8]) -> Result<()> {
        self.state = BackendState::SendChangeUser;
        self.writer.reset_seq();
        self.writer.write_all(&[CommandCode::ComChangeUser as u8])?;
        self.writer.write_all(identity.user.as_bytes())?;
        self.writer.write_all(&[0])?;
        // empty auth response forces an AuthSwitchRequest with a fresh
        // scramble, which is required as we never saw the original one
        self.writer.write_all(&[0])?;
        if let Some(db) = &identity.db {
            self.writer.write_all(db.as_bytes())?;
        }
        self.writer.write_all(&[0])?;
        self.writer
            .write_all(&crate::protocol::mysql::charset::UTF8_MB4_GENERAL_CI.to_le_bytes())?;
        self.writer.write_all(&[0])?;
        self.writer
            .write_all(AuthPluginName::AuthNativePassword.as_ref().as_bytes())?;
        self.writer.write_all(&[0])?;
        self.writer.end_packet().await?;
        self.writer.flush_all().await?;

        self.state = BackendState::ReadChangeUser;
        loop {
            let (seq, packet) = self.read_packet().await?;
            if packet.is_ok_packet() {
                break;
            } else if packet.is_err_packet() {
                return Err(self.fail("change user failed"));
            } else if packet.first() == Some(&0xfe) {
                let body = &packet[1..];
                let plugin_end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
                let scramble: Vec<u8> = body[plugin_end + 1..]
                    .iter()
                    .copied()
                    .filter(|b| *b != 0)
                    .collect();
                let token = native_password_token(password, &scramble);
                self.writer.set_seq(seq.wrapping_add(1));
                self.writer.write_all(&token)?;
                self.writer.end_packet().await?;
                self.writer.flush_all().await?;
            } else {
                return Err(self.fail("unexpected packet during change user"));
            }
        }
        self.identity = identity;
        self.state = BackendState::ConnectionInit;
        Ok(())
    }

    /// Re-initialize a pooled connection for a new session in the classified
    /// reuse mode. After this, the caller runs connection-init (unless the
    /// fast reset path skipped straight to the history) and replays the new
    /// session's history.
    pub async fn begin_reuse(
        &mut self,
        mode: crate::backend::pool::ReuseType,
        identity: ConnIdentity,
        password: &[u8],
        history: &SessionHistory,
        has_init_sql: bool,
    ) -> Result<()> {
        use crate::backend::pool::ReuseType;
        let mode_label = match mode {
            ReuseType::Direct => "direct",
            ReuseType::ResetConnection => "reset_connection",
            ReuseType::ChangeUser => "change_user",
            ReuseType::None => "none",
        };
        common::metrics::pool_reused(mode_label);
        match mode {
            ReuseType::Direct => {
                // identity already matches; only the history needs replaying
                self.state = BackendState::SendHistory;
                Ok(())
            }
            ReuseType::ResetConnection => self.start_reset(history, has_init_sql).await,
            ReuseType::ChangeUser => self.change_user(identity, password).await,
            ReuseType::None => Err(self.fail("connection does not qualify for reuse")),
        }
    }

    /// Hand the connection to the pool; a pooled connection has no session.
    pub fn release_to_pool(&mut self) {
        self.state = BackendState::Pooled;
        self.delayed = DelayedQueue::default();
        self.history_outstanding.clear();
    }

    /// A COM_QUIT is always written to a backend being closed; it makes the
    /// server drop the connection faster.
    pub async fn close(&mut self) {
        let _ = writers::write_com_quit(&mut self.writer).await;
        self.state = BackendState::Failed;
    }

    async fn read_packet(&mut self) -> Result<(u8, Packet)> {
        match self.reader.next_async().await {
            Ok(Some(pair)) => Ok(pair),
            Ok(None) => Err(ProxyError::backend_transient(
                self.instance.name.clone(),
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "backend closed the connection",
                ),
            )),
            Err(e) => Err(ProxyError::backend_transient(self.instance.name.clone(), e)),
        }
    }
}
