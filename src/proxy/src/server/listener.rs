//! The read/write-splitting session loop: accepts a client, authenticates
//! it, attaches backend connections from the per-user pools, then classifies
//! and routes every command while keeping session state replicated.

use crate::backend::conn::ConnIdentity;
use crate::backend::pool::{BackendPools, PooledConnMgr, TcpBackendConn};
use crate::backend::reply::{Reply, ReplyBuilder, ReplyState};
use crate::backend::{BackendInstance, ServerRole};
use crate::config::ListenerConfig;
use crate::error::{ProxyError, Result};
use crate::parser::classifier::MariaDbClassifier;
use crate::parser::hint::{parse_hints, Hint};
use crate::parser::type_mask::TypeMask;
use crate::parser::{CollectLevel, ParserOptions, ParserPlugin};
use crate::protocol::mysql::basic::HandshakeResponse;
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{writers, Packet};
use crate::router::causal_reads::{
    CausalReadCoordinator, GlobalGtid, WaitGtidState, RO_TRX_TIMEOUT_CODE,
    RO_TRX_TIMEOUT_MESSAGE, RO_TRX_TIMEOUT_SQLSTATE,
};
use crate::router::{BackendBalancer, LoadDataState, RandomBalancer, RoutePlanner, TargetMask};
use crate::server::auth::authenticator::Authenticator;
use crate::server::auth::{gen_user_salt, UserAccountStore};
use crate::server::forwarder::query_forward::{forward_reply, ReplyOutcome};
use crate::server::forwarder::stmt_forward::forward_prepare_reply;
use crate::server::ProxyServer;
use crate::session::history::{ResponseOutcome, SessionHistory};
use crate::session::ps_map::{extract_ps_id, CloseOutcome, PsMap, TextPsEntry};
use crate::session::{BackendId, ClientState, TrxTracker};

use async_trait::async_trait;
use deadpool::managed::Object;
use mysql_common::constants::CapabilityFlags;
use num_traits::FromPrimitive;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-tick client read budget, matching the write queue high-water mark.
const WRITEQ_HIGH_WATER: usize = 65_536;

/// Credentials the proxy uses towards the backends. Client passwords are
/// never recoverable from the wire exchange, so backend connections run
/// under a service account.
#[derive(Debug, Clone, Default)]
pub struct BackendAuth {
    pub user: String,
    pub password: String,
}

pub struct RwSplitServer<A> {
    config: ListenerConfig,
    accounts: Arc<UserAccountStore>,
    servers: Vec<BackendInstance>,
    pools: Arc<BackendPools>,
    backend_auth: BackendAuth,
    authenticator: A,
    global_gtid: GlobalGtid,
    balancer: RandomBalancer,
    next_conn_id: AtomicU64,
}

struct SessionBackend {
    id: BackendId,
    instance: BackendInstance,
    object: Object<PooledConnMgr>,
}

fn shared_conn(backends: &[SessionBackend], id: BackendId) -> Option<Arc<Mutex<TcpBackendConn>>> {
    backends
        .iter()
        .find(|b| b.id == id)
        .map(|b| Arc::clone(&b.object.conn))
}

/// Everything one client connection owns.
struct RwSplitSession {
    caps: CapabilityFlags,
    current_db: String,
    planner: RoutePlanner,
    trx: TrxTracker,
    history: SessionHistory,
    ps_map: PsMap,
    causal: CausalReadCoordinator,
    backends: Vec<SessionBackend>,
    last_used: Option<BackendId>,
    load_data_target: Option<BackendId>,
}

impl RwSplitSession {
    fn master_id(&self) -> Option<BackendId> {
        self.backends
            .iter()
            .find(|b| b.instance.role == ServerRole::Master)
            .map(|b| b.id)
    }

    fn is_master(&self, id: BackendId) -> bool {
        self.backends
            .iter()
            .any(|b| b.id == id && b.instance.role == ServerRole::Master)
    }

    fn remove_backend(&mut self, id: BackendId) {
        if let Some(backend) = self.backends.iter().find(|b| b.id == id) {
            common::metrics::backend_failed(&backend.instance.name);
        }
        self.history.forget_backend(id);
        if self.last_used == Some(id) {
            self.last_used = None;
        }
        self.backends.retain(|b| b.id != id);
    }

    /// Resolve the target mask to one concrete backend.
    fn pick_backend(
        &self,
        target: TargetMask,
        named: Option<&str>,
        balancer: &dyn BackendBalancer,
    ) -> Option<BackendId> {
        if target.contains(TargetMask::NAMED_SERVER) {
            if let Some(backend) = named.and_then(|name| {
                self.backends.iter().find(|b| b.instance.name == name)
            }) {
                return Some(backend.id);
            }
        }
        if target.contains(TargetMask::LAST_USED) {
            if let Some(id) = self.last_used {
                return Some(id);
            }
            return self.master_id();
        }
        if target.contains(TargetMask::SLAVE) {
            let replicas: Vec<&SessionBackend> = self
                .backends
                .iter()
                .filter(|b| b.instance.role == ServerRole::Replica)
                .collect();
            if !replicas.is_empty() {
                return Some(replicas[balancer.balance(replicas.len())].id);
            }
            // no replica available: reads fall back to the primary
            return self.master_id();
        }
        self.master_id()
    }
}

impl<A: Authenticator> RwSplitServer<A> {
    pub fn new(
        config: ListenerConfig,
        accounts: Arc<UserAccountStore>,
        servers: Vec<BackendInstance>,
        backend_auth: BackendAuth,
        authenticator: A,
    ) -> Self {
        let pools = Arc::new(BackendPools::new(config.connection_init_sql.clone(), 16));
        Self {
            config,
            accounts,
            servers,
            pools,
            backend_auth,
            authenticator,
            global_gtid: GlobalGtid::default(),
            balancer: RandomBalancer::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Serve one accepted client connection to completion.
    pub async fn connect<R, W>(
        &self,
        reader: R,
        mut writer: W,
        client_addr: Option<SocketAddr>,
    ) -> Result<(), std::io::Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let mut client_state = ClientState::HandshakeWait;
        debug!("Client accepted, state {client_state:?}");
        let salt = gen_user_salt();
        let (seq, mut handshake, _pkt, mut client_reader) =
            self.on_conn(reader, &mut writer, salt).await?;
        client_state = ClientState::Authenticating;
        debug!("Handshake response read, state {client_state:?}");

        let mut client_writer = PacketWriter::new(writer);
        let client_host = client_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "localhost".to_string());

        self.authenticator
            .verify(
                &self.accounts,
                &self.config,
                &client_host,
                salt,
                &mut handshake,
                seq,
                &mut client_reader,
                &mut client_writer,
            )
            .await?;
        client_state = ClientState::Routing;
        debug!("Client authenticated, state {client_state:?}");

        // cap per-tick reads at the write queue's high-water mark so a slow
        // client slows its backends down instead of buffering unboundedly
        client_reader.set_read_limit(WRITEQ_HIGH_WATER);

        common::metrics::session_opened();
        let result = self
            .on_com(
                &mut client_reader,
                &mut client_writer,
                &handshake,
                client_addr,
            )
            .await;
        common::metrics::session_closed();
        client_state = ClientState::Closed;
        debug!("Session finished, state {client_state:?}");
        result
    }

    async fn open_session(
        &self,
        handshake: &HandshakeResponse,
        client_addr: Option<SocketAddr>,
    ) -> Result<RwSplitSession> {
        let identity = ConnIdentity {
            user: self.backend_auth.user.clone(),
            host: client_addr
                .map(|a| a.ip().to_string())
                .unwrap_or_else(|| "localhost".to_string()),
            db: handshake.database_string(),
            capabilities: handshake.client_flag,
            client_remote: client_addr.map(|a| a.to_string()),
        };

        let mut backends = Vec::new();
        for server in self.servers.iter().filter(|s| s.is_usable()) {
            let pool = self
                .pools
                .pool_for(server, &identity, self.backend_auth.password.as_bytes());
            match pool.get().await {
                Ok(object) => {
                    let id = { object.conn.lock().await.id };
                    backends.push(SessionBackend {
                        id,
                        instance: server.clone(),
                        object,
                    });
                }
                Err(e) => {
                    warn!("Could not attach backend {}: {e}", server.name);
                }
            }
        }
        if !backends
            .iter()
            .any(|b| b.instance.role == ServerRole::Master)
        {
            return Err(ProxyError::Internal(
                "no usable primary backend".to_string(),
            ));
        }

        let mut plugin = MariaDbClassifier::default();
        plugin.setup(ParserOptions::default());
        let multi_statements_allowed = handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_STATEMENTS);

        let mut session = RwSplitSession {
            caps: handshake.client_flag,
            current_db: handshake.database_string().unwrap_or_default(),
            planner: RoutePlanner::new(
                Box::new(plugin),
                self.config.use_sql_variables_in,
                multi_statements_allowed,
            ),
            trx: TrxTracker::default(),
            history: SessionHistory::new(self.config.history.clone()),
            ps_map: PsMap::new(),
            causal: CausalReadCoordinator::new(
                self.config.causal_reads,
                self.config.causal_reads_timeout,
                self.global_gtid.clone(),
            ),
            backends,
            last_used: None,
            load_data_target: None,
        };

        // fresh sessions have no history yet: pin each backend at the start
        // and move it to the routing phase
        for backend in &session.backends {
            session.history.pin(backend.id);
            let mut conn = backend.object.conn.lock().await;
            if !conn.state.is_routable() {
                conn.flush_delayed(&mut session.ps_map).await?;
            }
        }
        Ok(session)
    }

    /// Fan a session command out to every backend; the first (primary)
    /// response is delivered, the others are verified against it.
    async fn route_to_all<W>(
        &self,
        session: &mut RwSplitSession,
        client_writer: &mut PacketWriter<W>,
        mut packet: Packet,
        cmd: CommandCode,
    ) -> Result<Reply>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let id = session.history.allocate_id();
        packet.set_id(id);
        session.history.record(id, packet.as_ref().to_vec());

        let mut accepted: Option<Reply> = None;
        let mut diverged: Vec<BackendId> = Vec::new();

        let backend_ids: Vec<BackendId> = session.backends.iter().map(|b| b.id).collect();
        for backend_id in backend_ids {
            let Some(shared) = shared_conn(&session.backends, backend_id) else {
                continue;
            };
            let mut conn = shared.lock().await;
            conn.forward(&packet, &mut session.ps_map).await?;
            let mut builder = ReplyBuilder::new(cmd, session.caps);
            let deliver = accepted.is_none();
            let (reply, _) = forward_reply(
                &mut conn.reader,
                client_writer,
                &mut builder,
                deliver,
                None,
                false,
            )
            .await?;
            drop(conn);

            match session.history.deliver_response(id, reply.is_ok) {
                ResponseOutcome::Accepted => {
                    session.history.advance_position(backend_id, id);
                    accepted = Some(reply);
                }
                ResponseOutcome::Match => {
                    session.history.advance_position(backend_id, id);
                }
                ResponseOutcome::Mismatch => {
                    warn!("Session command {id} diverged on backend {backend_id}, closing it");
                    diverged.push(backend_id);
                }
            }
        }

        for backend_id in diverged {
            if let Some(shared) = shared_conn(&session.backends, backend_id) {
                tokio::spawn(async move {
                    shared.lock().await.close().await;
                });
            }
            session.remove_backend(backend_id);
        }
        session.history.prune();
        common::metrics::history_len(session.history.len());

        accepted.ok_or_else(|| ProxyError::Internal("no backend answered".to_string()))
    }

    /// Route one packet to a single backend and stream the reply back. A
    /// causal-read wait timeout loops back once, retrying on the primary.
    async fn route_to_one<W>(
        &self,
        session: &mut RwSplitSession,
        client_writer: &mut PacketWriter<W>,
        packet: &Packet,
        cmd: CommandCode,
        backend_id: BackendId,
    ) -> Result<Reply>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut packet = packet.clone();
        let mut backend_id = backend_id;

        loop {
            let is_master = session.is_master(backend_id);

            // UNIVERSAL causal reads probe the primary's GTID position once
            // per session before the first replica read.
            if cmd == CommandCode::ComQuery
                && !is_master
                && session.causal.mode() == crate::config::CausalReadsMode::Universal
                && session.causal.needs_gtid_probe()
            {
                self.run_gtid_probe(session).await?;
            }

            // Interpose the GTID wait when a read is about to hit a replica.
            let mut outgoing = packet.clone();
            let wants_causal = cmd == CommandCode::ComQuery
                && !is_master
                && session.causal.should_do_causal_read()
                && !session.trx.is_trx_active();
            if wants_causal {
                if let Some(prefixed) = session.causal.add_prefix_wait_gtid(&packet) {
                    let mut with_prefix = Packet::from_vec(prefixed);
                    with_prefix.set_hints(packet.hints().to_vec());
                    outgoing = with_prefix;
                }
            }

            let Some(shared) = shared_conn(&session.backends, backend_id) else {
                return Err(ProxyError::Internal(format!("backend {backend_id} vanished")));
            };
            let mut conn = shared.lock().await;
            conn.forward(&outgoing, &mut session.ps_map).await?;
            let mut builder = ReplyBuilder::new(cmd, session.caps);
            let in_ro_trx = session.trx.is_trx_read_only();
            let causal_active = session.causal.state() != WaitGtidState::None;
            let (reply, outcome) = forward_reply(
                &mut conn.reader,
                client_writer,
                &mut builder,
                true,
                causal_active.then_some(&mut session.causal),
                in_ro_trx,
            )
            .await?;
            drop(conn);

            match outcome {
                ReplyOutcome::Delivered => {
                    session.last_used = Some(backend_id);
                    if reply.state == ReplyState::LoadData {
                        session
                            .planner
                            .route_info_mut()
                            .set_load_data_state(LoadDataState::Active);
                        session.load_data_target = Some(backend_id);
                    }
                    if is_master {
                        if let Some(gtid) = reply.last_gtid() {
                            session.causal.record_write_gtid(gtid);
                        }
                    }
                    return Ok(reply);
                }
                ReplyOutcome::CausalSyntheticError => {
                    client_writer.set_seq(1);
                    writers::write_err_packet_raw(
                        RO_TRX_TIMEOUT_CODE,
                        RO_TRX_TIMEOUT_SQLSTATE.as_bytes(),
                        RO_TRX_TIMEOUT_MESSAGE.as_bytes(),
                        client_writer,
                    )
                    .await?;
                    client_writer.flush_all().await?;
                    return Ok(reply);
                }
                ReplyOutcome::CausalRetry => {
                    common::metrics::causal_retry();
                    packet = session.causal.take_retry_query().ok_or_else(|| {
                        ProxyError::Internal("causal retry without a stashed query".into())
                    })?;
                    backend_id = session
                        .master_id()
                        .ok_or_else(|| ProxyError::Internal("no primary".into()))?;
                    debug!("Retrying causal read on the primary");
                }
            }
        }
    }

    /// One-time UNIVERSAL-mode probe: read `@@gtid_current_pos` from the
    /// primary and stash it; the client never sees the probe's resultset.
    async fn run_gtid_probe(&self, session: &mut RwSplitSession) -> Result<()> {
        let probe = session.causal.start_gtid_probe();
        let master_id = session
            .master_id()
            .ok_or_else(|| ProxyError::Internal("no primary for GTID probe".into()))?;
        let Some(shared) = shared_conn(&session.backends, master_id) else {
            return Err(ProxyError::Internal("primary vanished during probe".into()));
        };
        let mut conn = shared.lock().await;
        conn.forward(&probe, &mut session.ps_map).await?;

        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, session.caps);
        let mut gtid = String::new();
        while !builder.is_complete() {
            let Some((_, mut pkt)) = conn.reader.next_async().await? else {
                return Err(ProxyError::backend_transient(
                    "primary".to_string(),
                    std::io::Error::new(
                        std::io::ErrorKind::ConnectionAborted,
                        "backend closed during GTID probe",
                    ),
                ));
            };
            let rows_before = builder.reply().rows_read;
            builder.process(&mut pkt);
            if builder.reply().rows_read > rows_before {
                // single text column: lenenc length then the value
                if let Ok((value, len)) =
                    crate::protocol::mysql::basic::read_length_encoded_number(&pkt)
                {
                    let len = len as usize;
                    if value.len() >= len {
                        gtid = String::from_utf8_lossy(&value[..len]).to_string();
                    }
                }
            }
        }
        if let Some(error) = &builder.reply().error {
            return Err(ProxyError::backend_permanent(
                "primary".to_string(),
                format!("GTID probe failed: {}", error.message),
            ));
        }
        session.causal.complete_gtid_probe(&gtid);
        session.last_used = Some(master_id);
        Ok(())
    }

    /// Raw passthrough of LOAD DATA LOCAL INFILE content packets.
    async fn route_load_data<W>(
        &self,
        session: &mut RwSplitSession,
        client_writer: &mut PacketWriter<W>,
        packet: &Packet,
    ) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let Some(target) = session.load_data_target else {
            return Err(ProxyError::ProtocolViolation(
                "LOAD DATA continuation without a target".to_string(),
            ));
        };
        let Some(shared) = shared_conn(&session.backends, target) else {
            return Err(ProxyError::Internal("LOAD DATA target vanished".into()));
        };
        let mut conn = shared.lock().await;
        conn.forward(packet, &mut session.ps_map).await?;

        if packet.is_empty() {
            // the terminating empty packet: the server now sends OK/ERR
            let mut builder = ReplyBuilder::new(CommandCode::ComQuery, session.caps);
            let (_reply, _) = forward_reply(
                &mut conn.reader,
                client_writer,
                &mut builder,
                true,
                None,
                false,
            )
            .await?;
            session.load_data_target = None;
        }
        Ok(())
    }

    async fn handle_stmt_prepare<W>(
        &self,
        session: &mut RwSplitSession,
        client_writer: &mut PacketWriter<W>,
        packet: Packet,
    ) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        // The command id doubles as the internal PS id, which lets a later
        // COM_STMT_CLOSE be checked against the recorded history responses.
        let id = session.history.allocate_id();
        let body_mask = session.planner.route_info().type_mask() & !TypeMask::PREPARE_STMT;
        let relates = packet
            .sql()
            .map(|sql| {
                session
                    .planner
                    .plugin()
                    .parse(sql, CollectLevel::ESSENTIALS)
                    .relates_to_previous
            })
            .unwrap_or(false);
        session.ps_map.register_prepare_with_id(id, body_mask, relates);

        let mut tagged = packet.clone();
        tagged.set_id(id);
        session.history.record(id, tagged.as_ref().to_vec());

        let mut accepted_ok: Option<bool> = None;
        let backend_ids: Vec<BackendId> = session.backends.iter().map(|b| b.id).collect();
        for backend_id in backend_ids {
            let Some(shared) = shared_conn(&session.backends, backend_id) else {
                continue;
            };
            let mut conn = shared.lock().await;
            conn.forward(&tagged, &mut session.ps_map).await?;
            let reply = forward_prepare_reply(
                &mut conn.reader,
                client_writer,
                session.caps,
                id,
                backend_id,
                &mut session.ps_map,
                accepted_ok.is_none(),
            )
            .await?;
            drop(conn);

            match session.history.deliver_response(id, reply.is_ok) {
                ResponseOutcome::Accepted => {
                    accepted_ok = Some(reply.is_ok);
                    session.history.advance_position(backend_id, id);
                }
                ResponseOutcome::Match => {
                    session.history.advance_position(backend_id, id);
                }
                ResponseOutcome::Mismatch => {
                    warn!("PREPARE {id} diverged on backend {backend_id}");
                    session.remove_backend(backend_id);
                }
            }
        }
        session.history.prune();
        common::metrics::history_len(session.history.len());
        Ok(())
    }

    async fn handle_stmt_close<W>(
        &self,
        session: &mut RwSplitSession,
        client_writer: &mut PacketWriter<W>,
        packet: Packet,
    ) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let internal = extract_ps_id(&packet)
            .map(|id| session.ps_map.resolve(id))
            .unwrap_or(0);
        let known_backends: Vec<BackendId> = session
            .backends
            .iter()
            .filter(|b| session.ps_map.external_id(internal, b.id).is_some())
            .map(|b| b.id)
            .collect();

        // COM_STMT_CLOSE is fire-and-forget; forward before erasing the map
        for backend_id in known_backends {
            if let Some(shared) = shared_conn(&session.backends, backend_id) {
                let mut conn = shared.lock().await;
                conn.forward(&packet, &mut session.ps_map).await?;
            }
        }

        let has_history_response = session.history.response(internal).is_some();
        match session.ps_map.close(internal, has_history_response) {
            CloseOutcome::Closed | CloseOutcome::SilentlyIgnored => Ok(()),
            CloseOutcome::UnknownId => {
                client_writer.set_seq(1);
                writers::write_err_packet(
                    ErrorKind::ER_UNKNOWN_STMT_HANDLER,
                    format!(
                        "Unknown prepared statement handler ({internal}) given to mysqld_stmt_close"
                    )
                    .as_bytes(),
                    client_writer,
                )
                .await?;
                client_writer.flush_all().await?;
                Ok(())
            }
        }
    }

    async fn com_loop<R, W>(
        &self,
        session: &mut RwSplitSession,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let sql_com_names = CommandCode::all_sql_com();
        loop {
            let idle_ping = tokio::time::sleep(self.config.idle_ping_interval);
            let next = tokio::select! {
                read = client_reader.next_async() => read?,
                _ = idle_ping => {
                    for backend in &session.backends {
                        let mut conn = backend.object.conn.lock().await;
                        if conn.state.is_routable()
                            && conn.idle_for() >= self.config.idle_ping_interval
                        {
                            conn.ping().await?;
                        }
                    }
                    continue;
                }
            };
            let Some((_seq, mut packet)) = next else {
                // peer hangup
                return Ok(());
            };

            // LOAD DATA content bypasses classification entirely
            if session.load_data_target.is_some() {
                session.planner.update_route_info(
                    &packet,
                    &session.trx,
                    &session.ps_map,
                    &session.current_db,
                );
                self.route_load_data(session, client_writer, &packet).await?;
                continue;
            }

            let cmd = packet
                .command()
                .and_then(CommandCode::from_u8)
                .unwrap_or(CommandCode::ComSleep);

            if cmd == CommandCode::ComQuery {
                if let Some(sql) = packet.sql() {
                    let hints = parse_hints(sql);
                    packet.set_hints(hints);
                }
            }

            if cmd == CommandCode::ComQuit {
                debug!("Client sent COM_QUIT, releasing backends to the pool");
                // dropping the pool objects recycles the connections
                return Ok(());
            }

            // A client COM_CHANGE_USER would have to re-run the whole
            // authentication exchange against every backend; the proxy
            // terminates authentication, so reject it cleanly instead of
            // corrupting the reply stream.
            if cmd == CommandCode::ComChangeUser {
                client_writer.set_seq(1);
                writers::write_err_packet(
                    ErrorKind::ER_NOT_SUPPORTED_AUTH_MODE,
                    b"COM_CHANGE_USER is not supported through this listener",
                    client_writer,
                )
                .await?;
                client_writer.flush_all().await?;
                continue;
            }

            let _latency = sql_com_names
                .get(&(cmd as u8))
                .map(|com_name| common::metrics::command_timer(*com_name));

            let route = session
                .planner
                .update_route_info(&packet, &session.trx, &session.ps_map, &session.current_db)
                .clone();
            session.trx.track_statement(route.type_mask());

            // default database changes ride on COM_INIT_DB
            if cmd == CommandCode::ComInitDB {
                if let Some(db) = packet.sql() {
                    let mut db = String::from_utf8_lossy(db).to_string();
                    // lower_case_table_names 1/2 compare schema names folded
                    if self.config.lower_case_table_names > 0 {
                        db = db.to_lowercase();
                    }
                    session.current_db = db;
                }
            }

            let target = route.target();
            let target_label = if target.contains(TargetMask::ALL) {
                "all"
            } else if target.contains(TargetMask::LAST_USED) {
                "last_used"
            } else if target.contains(TargetMask::SLAVE) {
                "slave"
            } else {
                "master"
            };
            common::metrics::query_routed(target_label);
            let named = packet.hints().iter().find_map(|h| match h {
                Hint::RouteToNamedServer(name) => Some(name.clone()),
                _ => None,
            });

            // text prepared statements are registered under their name; the
            // stored mask is that of the prepared body
            if cmd == CommandCode::ComQuery
                && route
                    .type_mask()
                    .intersects(TypeMask::PREPARE_NAMED_STMT | TypeMask::DEALLOC_PREPARE)
            {
                if let Some(sql) = packet.sql() {
                    let info = session.planner.plugin().parse(sql, CollectLevel::ESSENTIALS);
                    if let Some(name) = info.prepare_name.clone() {
                        if route.type_mask().contains(TypeMask::DEALLOC_PREPARE) {
                            session.ps_map.erase_text(&name);
                        } else {
                            let body = info.preparable_stmt.as_deref();
                            let body_info = body.map(|body| {
                                session
                                    .planner
                                    .plugin()
                                    .parse(body, CollectLevel::ESSENTIALS)
                            });
                            session.ps_map.register_text(
                                &name,
                                TextPsEntry {
                                    type_mask: body_info
                                        .as_ref()
                                        .map(|i| i.type_mask)
                                        .unwrap_or(TypeMask::UNKNOWN),
                                    route_to_last_used: body_info
                                        .map(|i| i.relates_to_previous)
                                        .unwrap_or(false),
                                },
                            );
                        }
                    }
                }
            }

            let reply = if cmd == CommandCode::ComStmtPrepare {
                self.handle_stmt_prepare(session, client_writer, packet).await?;
                None
            } else if cmd == CommandCode::ComStmtClose {
                self.handle_stmt_close(session, client_writer, packet).await?;
                None
            } else if target.contains(TargetMask::ALL) {
                Some(self.route_to_all(session, client_writer, packet, cmd).await?)
            } else {
                let Some(backend_id) =
                    session.pick_backend(target, named.as_deref(), &self.balancer)
                else {
                    client_writer.set_seq(1);
                    writers::write_err_packet(
                        ErrorKind::ER_UNKNOWN_COM_ERROR,
                        b"no backend available for this query",
                        client_writer,
                    )
                    .await?;
                    client_writer.flush_all().await?;
                    continue;
                };
                match self
                    .route_to_one(session, client_writer, &packet, cmd, backend_id)
                    .await
                {
                    Ok(reply) => Some(reply),
                    Err(e) if e.is_transient() => {
                        // the router may recover a transient backend error by
                        // retrying on the primary
                        warn!("Transient backend error, retrying on the primary: {e}");
                        session.remove_backend(backend_id);
                        let master_id = session
                            .master_id()
                            .ok_or(ProxyError::Internal("no primary left".into()))?;
                        Some(
                            self.route_to_one(session, client_writer, &packet, cmd, master_id)
                                .await?,
                        )
                    }
                    Err(e) if e.closes_backend_only() => {
                        warn!("Closing failed backend: {e}");
                        session.remove_backend(backend_id);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            if let Some(reply) = reply {
                session.trx.track_status_flags(reply.server_status);
                session.trx.track_session_state(&reply.tracked);
                // a successful reset invalidates every prepared statement
                if cmd == CommandCode::ComResetConnection && reply.is_ok {
                    session.ps_map.clear();
                }
            }
            session.trx.statement_done();
        }
    }
}

#[async_trait]
impl<A: Authenticator> ProxyServer for RwSplitServer<A> {
    async fn on_conn<R, W>(
        &self,
        r: R,
        w: &mut W,
        scramble: [u8; 20],
    ) -> Result<(u8, HandshakeResponse, Packet, PacketReader<R>), std::io::Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let mut client_reader = PacketReader::new(r);
        let mut client_writer = PacketWriter::new(w);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (seq, handshake_response, pkt) = self
            .authenticator
            .initial_handshake(conn_id, scramble, &mut client_reader, &mut client_writer)
            .await?;
        Ok((seq, handshake_response, pkt, client_reader))
    }

    async fn on_com<R, W>(
        &self,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
        handshake_response: &HandshakeResponse,
        client_addr: Option<SocketAddr>,
    ) -> Result<(), std::io::Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let mut session = self
            .open_session(handshake_response, client_addr)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e))?;

        match self.com_loop(&mut session, client_reader, client_writer).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Session ended with error: {e}");
                Err(std::io::Error::other(e))
            }
        }
    }

    async fn close(&self) {}
}
