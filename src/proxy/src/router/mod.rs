pub mod causal_reads;

use crate::config::UseSqlVariablesIn;
use crate::parser::hint::Hint;
use crate::parser::multistmt::is_multi_stmt;
use crate::parser::type_mask::{Operation, TypeMask};
use crate::parser::{ClassifyCache, CollectLevel, ParserPlugin};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::Packet;
use crate::session::ps_map::{extract_ps_id, PsMap};
use crate::session::TrxTracker;
use bitflags::bitflags;
use hashbrown::HashSet;
use num_traits::FromPrimitive;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use tracing::{debug, info};

bitflags! {
    /// Where a packet may be routed. `SLAVE` and `MASTER` may be refined by
    /// `NAMED_SERVER` / `RLAG_MAX` from hints.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TargetMask: u8 {
        const MASTER       = 0b00_0001;
        const SLAVE        = 0b00_0010;
        const ALL          = 0b00_0100;
        const NAMED_SERVER = 0b00_1000;
        const LAST_USED    = 0b01_0000;
        const RLAG_MAX     = 0b10_0000;
        const UNDEFINED    = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    #[default]
    Inactive,
    Active,
    End,
}

/// Per-session routing state derived from the current packet and the
/// transaction tracker.
#[derive(Debug, Clone, Default)]
pub struct RouteInfo {
    command: Option<CommandCode>,
    stmt_id: u32,
    target: TargetMask,
    type_mask: TypeMask,
    load_data_state: LoadDataState,
    load_data_sent: u64,
    tmp_tables: HashSet<String>,
    multi_part_packet: bool,
    ps_continuation: bool,
    trx_still_read_only: bool,
}

impl RouteInfo {
    pub fn command(&self) -> Option<CommandCode> {
        self.command
    }

    pub fn stmt_id(&self) -> u32 {
        self.stmt_id
    }

    pub fn target(&self) -> TargetMask {
        self.target
    }

    pub fn type_mask(&self) -> TypeMask {
        self.type_mask
    }

    pub fn load_data_state(&self) -> LoadDataState {
        self.load_data_state
    }

    pub fn load_data_sent(&self) -> u64 {
        self.load_data_sent
    }

    pub fn set_load_data_state(&mut self, state: LoadDataState) {
        if state == LoadDataState::Active && self.load_data_state != LoadDataState::Active {
            self.load_data_sent = 0;
        }
        self.load_data_state = state;
    }

    pub fn multi_part_packet(&self) -> bool {
        self.multi_part_packet
    }

    pub fn is_ps_continuation(&self) -> bool {
        self.ps_continuation
    }

    pub fn is_trx_still_read_only(&self) -> bool {
        self.trx_still_read_only
    }

    pub fn add_tmp_table(&mut self, table: String) {
        info!("Added temporary table {table}");
        self.tmp_tables.insert(table);
    }

    pub fn remove_tmp_table(&mut self, table: &str) {
        self.tmp_tables.remove(table);
    }

    pub fn is_tmp_table(&self, table: &str) -> bool {
        self.tmp_tables.contains(table)
    }

    pub fn have_tmp_tables(&self) -> bool {
        !self.tmp_tables.is_empty()
    }
}

/// Converts classification, transaction state, session locks, hints and
/// prepared-statement metadata into a target selector.
pub struct RoutePlanner {
    plugin: Box<dyn ParserPlugin>,
    use_sql_variables_in: UseSqlVariablesIn,
    multi_statements_allowed: bool,
    locked_to_master: bool,
    route_info: RouteInfo,
    prev_route_info: RouteInfo,
}

impl RoutePlanner {
    pub fn new(
        plugin: Box<dyn ParserPlugin>,
        use_sql_variables_in: UseSqlVariablesIn,
        multi_statements_allowed: bool,
    ) -> Self {
        Self {
            plugin,
            use_sql_variables_in,
            multi_statements_allowed,
            locked_to_master: false,
            route_info: RouteInfo::default(),
            prev_route_info: RouteInfo::default(),
        }
    }

    pub fn route_info(&self) -> &RouteInfo {
        &self.route_info
    }

    pub fn route_info_mut(&mut self) -> &mut RouteInfo {
        &mut self.route_info
    }

    pub fn plugin(&self) -> &dyn ParserPlugin {
        &*self.plugin
    }

    pub fn is_locked_to_master(&self) -> bool {
        self.locked_to_master
    }

    pub fn lock_to_master(&mut self) {
        self.locked_to_master = true;
    }

    /// Restore the state stashed by the previous `update_route_info`, used
    /// when a routing decision must be rolled back (e.g. a GTID probe).
    pub fn revert_update(&mut self) {
        self.route_info = self.prev_route_info.clone();
    }

    fn query_type_is_read_only(&self, qtype: TypeMask) -> bool {
        if qtype.intersects(TypeMask::MASTER_READ | TypeMask::WRITE) {
            return false;
        }
        if !qtype.intersects(
            TypeMask::READ
                | TypeMask::USERVAR_READ
                | TypeMask::SYSVAR_READ
                | TypeMask::GSYSVAR_READ,
        ) {
            return false;
        }
        if qtype.contains(TypeMask::USERVAR_READ) {
            self.use_sql_variables_in == UseSqlVariablesIn::All
        } else {
            true
        }
    }

    fn get_route_target(&self, qtype: TypeMask, trx: &TrxTracker) -> TargetMask {
        let trx_active = trx.is_trx_active();
        let load_active = self.route_info.load_data_state() != LoadDataState::Inactive;

        // Prepared statement preparations go to all servers.
        if qtype.intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT) {
            return TargetMask::ALL;
        }

        // Session-scoped writes replicate to every backend of the session.
        if !load_active
            && !qtype.contains(TypeMask::WRITE)
            && (qtype.contains(TypeMask::SESSION_WRITE)
                || (self.use_sql_variables_in == UseSqlVariablesIn::All
                    && qtype.contains(TypeMask::USERVAR_WRITE))
                || qtype.contains(TypeMask::GSYSVAR_WRITE)
                || qtype.contains(TypeMask::ENABLE_AUTOCOMMIT)
                || qtype.contains(TypeMask::DISABLE_AUTOCOMMIT))
        {
            return TargetMask::ALL;
        }

        if !trx_active && !load_active && self.query_type_is_read_only(qtype) {
            return TargetMask::SLAVE;
        }

        // Force SLAVE for a read-only transaction, active or ending. The
        // still-read-only mark keeps read-compatible statements on a replica
        // until the first non-read statement falls through to the primary.
        if trx.is_trx_read_only()
            || (trx_active
                && self.route_info.trx_still_read_only
                && self.query_type_is_read_only(qtype))
        {
            return TargetMask::SLAVE;
        }

        TargetMask::MASTER
    }

    fn process_routing_hints(&self, hints: &[Hint], target: &mut TargetMask) {
        for hint in hints {
            match hint {
                Hint::RouteToMaster => {
                    // override, bail out immediately
                    *target = TargetMask::MASTER;
                    debug!("Hint: route to primary");
                    return;
                }
                Hint::RouteToSlave => {
                    *target = TargetMask::SLAVE;
                    debug!("Hint: route to replica");
                }
                Hint::RouteToNamedServer(name) => {
                    *target |= TargetMask::NAMED_SERVER;
                    debug!("Hint: route to named server: {name}");
                }
                Hint::RouteToLastUsed => {
                    *target = TargetMask::LAST_USED;
                    debug!("Hint: route to last used");
                }
                Hint::RouteToAll => {
                    *target = TargetMask::ALL;
                }
                Hint::Parameter { key, value } => {
                    if key.eq_ignore_ascii_case("max_slave_replication_lag") {
                        *target |= TargetMask::RLAG_MAX;
                    } else {
                        tracing::error!(
                            "Unknown hint parameter '{key}={value}' when \
                             'max_slave_replication_lag' was expected."
                        );
                    }
                }
            }
        }
    }

    fn query_continues_ps(&self, cmd: CommandCode) -> bool {
        let prev_cmd = self.prev_route_info.command();
        if prev_cmd == Some(CommandCode::ComStmtSendLongData)
            && matches!(
                cmd,
                CommandCode::ComStmtExecute | CommandCode::ComStmtSendLongData
            )
        {
            // PS execution must go to the server that received the data
            true
        } else {
            // a FETCH always goes to the same target as the EXECUTE
            cmd == CommandCode::ComStmtFetch
        }
    }

    fn determine_query_type(
        plugin: &dyn ParserPlugin,
        cache: &mut ClassifyCache,
        cmd: CommandCode,
        sql: Option<&[u8]>,
    ) -> TypeMask {
        match cmd {
            CommandCode::ComQuit
            | CommandCode::ComInitDB
            | CommandCode::ComRefresh
            | CommandCode::ComDebug
            | CommandCode::ComPing
            | CommandCode::ComChangeUser
            | CommandCode::ComSetOption
            | CommandCode::ComResetConnection => TypeMask::SESSION_WRITE,
            CommandCode::ComCreateDB
            | CommandCode::ComDropDB
            | CommandCode::ComStmtClose
            | CommandCode::ComStmtSendLongData
            | CommandCode::ComStmtReset => TypeMask::WRITE,
            CommandCode::ComFieldList => TypeMask::READ,
            CommandCode::ComQuery => sql
                .map(|sql| cache.get(plugin, sql, CollectLevel::ESSENTIALS).type_mask)
                .unwrap_or(TypeMask::UNKNOWN),
            CommandCode::ComStmtPrepare => {
                sql.map(|sql| cache.get(plugin, sql, CollectLevel::ESSENTIALS).type_mask)
                    .unwrap_or(TypeMask::UNKNOWN)
                    | TypeMask::PREPARE_STMT
            }
            // no parsing needed, the PREPARE's mask is reused
            CommandCode::ComStmtExecute => TypeMask::EXEC_STMT,
            _ => TypeMask::UNKNOWN,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_multi_temp_and_load(
        plugin: &dyn ParserPlugin,
        cache: &mut ClassifyCache,
        route_info: &mut RouteInfo,
        locked_to_master: bool,
        multi_statements_allowed: bool,
        sql: &[u8],
        current_db: &str,
        type_mask: &mut TypeMask,
    ) -> bool {
        let mut lock_to_master = false;

        // A multi-statement packet pins the session to the primary.
        if !locked_to_master {
            let operation = cache.get(plugin, sql, CollectLevel::ESSENTIALS).operation;
            let mut is_multi = operation == Operation::Call;
            if !is_multi && multi_statements_allowed {
                is_multi = is_multi_stmt(sql);
            }
            if is_multi {
                lock_to_master = true;
            }
        }

        if route_info.have_tmp_tables() {
            let info = cache.get(plugin, sql, CollectLevel::TABLES);
            let operation = info.operation;
            let tables = info.tables.clone();
            if operation == Operation::DropTable {
                for table in &tables {
                    let qualified = table.qualified(current_db);
                    route_info.remove_tmp_table(&qualified);
                }
            }
            let reads_tmp_table = type_mask.intersects(
                TypeMask::READ
                    | TypeMask::USERVAR_READ
                    | TypeMask::SYSVAR_READ
                    | TypeMask::GSYSVAR_READ,
            ) && tables
                .iter()
                .any(|t| route_info.is_tmp_table(&t.qualified(current_db)));
            if reads_tmp_table {
                *type_mask |= TypeMask::MASTER_READ;
            }
        }

        if type_mask.contains(TypeMask::CREATE_TMP_TABLE) {
            if let Some(table) = cache.get(plugin, sql, CollectLevel::TABLES).tables.first() {
                route_info.add_tmp_table(table.qualified(current_db));
            }
        }
        lock_to_master
    }

    /// The core routing step: classify the packet and resolve its target.
    pub fn update_route_info(
        &mut self,
        packet: &Packet,
        trx: &TrxTracker,
        ps_map: &PsMap,
        current_db: &str,
    ) -> &RouteInfo {
        let mut route_target = TargetMask::MASTER;
        let mut command = None;
        let mut type_mask = TypeMask::UNKNOWN;
        let mut stmt_id = 0;
        // the parse result is attached to the packet for its lifetime; a
        // strictly larger collection demand re-parses exactly once
        let mut cache = ClassifyCache::new();

        // Stash the current state in case we need to roll it back
        self.prev_route_info = self.route_info.clone();

        self.route_info.multi_part_packet = packet.is_multi_part();
        self.route_info.ps_continuation = false;

        if self.route_info.load_data_state() == LoadDataState::End {
            self.route_info.set_load_data_state(LoadDataState::Inactive);
        }

        let in_read_only_trx = self.locked_to_master && trx.is_trx_read_only();

        if self.route_info.load_data_state() == LoadDataState::Active {
            self.route_info.load_data_sent += packet.len() as u64;
            if packet.is_empty() {
                // the empty packet ends LOAD DATA LOCAL INFILE
                self.route_info.set_load_data_state(LoadDataState::End);
            }
            // continuation stays on the LOAD DATA target
            route_target = TargetMask::LAST_USED;
        } else if !packet.is_empty() {
            let cmd = packet
                .command()
                .and_then(CommandCode::from_u8)
                .unwrap_or(CommandCode::ComSleep);
            command = Some(cmd);

            if cmd.is_ps_command() {
                stmt_id = extract_ps_id(packet).map(|id| ps_map.resolve(id)).unwrap_or(0);
            }

            if in_read_only_trx {
                // Inside a read-only transaction the server acts correctly
                // even for non-read statements; skip the parse entirely.
                type_mask = TypeMask::READ;
            } else {
                type_mask =
                    Self::determine_query_type(&*self.plugin, &mut cache, cmd, packet.sql());

                if cmd == CommandCode::ComQuery {
                    if let Some(sql) = packet.sql() {
                        let lock = Self::handle_multi_temp_and_load(
                            &*self.plugin,
                            &mut cache,
                            &mut self.route_info,
                            self.locked_to_master,
                            self.multi_statements_allowed,
                            sql,
                            current_db,
                            &mut type_mask,
                        );
                        if lock {
                            self.locked_to_master = true;
                        }
                    }
                }
            }

            let mut route_to_last_used = false;

            if self.locked_to_master {
                route_target = TargetMask::MASTER;
            } else {
                let is_query = cmd == CommandCode::ComQuery;

                let text_execute = !in_read_only_trx
                    && is_query
                    && packet
                        .sql()
                        .map(|sql| {
                            cache.get(&*self.plugin, sql, CollectLevel::ESSENTIALS).operation
                                == Operation::Execute
                        })
                        .unwrap_or(false);
                if text_execute {
                    if let Some(name) = packet.sql().and_then(|sql| {
                        cache
                            .get(&*self.plugin, sql, CollectLevel::ESSENTIALS)
                            .prepare_name
                            .clone()
                    }) {
                        if let Some(ps) = ps_map.text(&name) {
                            type_mask = ps.type_mask;
                            route_to_last_used = ps.route_to_last_used;
                        }
                    }
                } else if cmd.is_ps_command() {
                    if let Some(ps) = ps_map.get(stmt_id) {
                        type_mask = ps.type_mask;
                        route_to_last_used = ps.route_to_last_used;
                        self.route_info.ps_continuation = self.query_continues_ps(cmd);
                    }
                } else if is_query
                    && packet
                        .sql()
                        .map(|sql| {
                            cache
                                .get(&*self.plugin, sql, CollectLevel::ESSENTIALS)
                                .relates_to_previous
                        })
                        .unwrap_or(false)
                {
                    route_to_last_used = true;
                }

                route_target = self.get_route_target(type_mask, trx);

                if route_target == TargetMask::SLAVE && route_to_last_used {
                    route_target = TargetMask::LAST_USED;
                }
            }

            self.process_routing_hints(packet.hints(), &mut route_target);

            if trx.is_trx_ending() || type_mask.contains(TypeMask::BEGIN_TRX) {
                // Transaction is ending or starting
                self.route_info.trx_still_read_only = true;
            } else if trx.is_trx_active() && !self.query_type_is_read_only(type_mask) {
                // Transaction is no longer read-only
                self.route_info.trx_still_read_only = false;
            }
        }

        self.route_info.target = route_target;
        self.route_info.command = command;
        self.route_info.type_mask = type_mask;
        self.route_info.stmt_id = stmt_id;

        &self.route_info
    }
}

/// Picks among equivalent backends.
pub trait BackendBalancer: Send + Sync {
    fn balance(&self, backends: usize) -> usize;
}

pub struct RandomBalancer {
    rand: Mutex<StdRng>,
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            rand: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl BackendBalancer for RandomBalancer {
    fn balance(&self, backends: usize) -> usize {
        let mut rng = self.rand.lock().unwrap();
        rng.gen_range(0..backends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::classifier::MariaDbClassifier;
    use crate::protocol::mysql::constants::CommandCode;

    fn planner() -> RoutePlanner {
        RoutePlanner::new(
            Box::<MariaDbClassifier>::default(),
            UseSqlVariablesIn::All,
            false,
        )
    }

    fn query_packet(sql: &str) -> Packet {
        let mut bytes = vec![CommandCode::ComQuery as u8];
        bytes.extend_from_slice(sql.as_bytes());
        Packet::from_vec(bytes)
    }

    #[test]
    fn pure_read_goes_to_slave() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        let info = planner.update_route_info(&query_packet("SELECT 1"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::SLAVE);
    }

    #[test]
    fn writes_go_to_master() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        let info =
            planner.update_route_info(&query_packet("INSERT INTO t VALUES (1)"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);
    }

    #[test]
    fn session_writes_go_to_all() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        for sql in ["SET @x = 1", "SET sql_mode = ''", "SET autocommit=0"] {
            let info = planner.update_route_info(&query_packet(sql), &trx, &ps, "db");
            assert_eq!(info.target(), TargetMask::ALL, "{sql}");
        }
    }

    #[test]
    fn prepare_goes_to_all() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        let mut prepare = vec![CommandCode::ComStmtPrepare as u8];
        prepare.extend_from_slice(b"SELECT ?");
        let info = planner.update_route_info(&Packet::from_vec(prepare), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::ALL);
        assert!(info.type_mask().contains(TypeMask::PREPARE_STMT));
    }

    #[test]
    fn session_lock_pins_master() {
        let mut planner = planner();
        planner.lock_to_master();
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        let info = planner.update_route_info(&query_packet("SELECT 1"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);
    }

    #[test]
    fn read_only_transaction_sticks_to_slave_until_write() {
        let mut planner = planner();
        let ps = PsMap::new();
        let mut trx = TrxTracker::default();

        trx.track_statement(TypeMask::BEGIN_TRX | TypeMask::READONLY);
        let info = planner.update_route_info(
            &query_packet("START TRANSACTION READ ONLY"),
            &trx,
            &ps,
            "db",
        );
        assert!(info.is_trx_still_read_only());
        trx.statement_done();

        let info = planner.update_route_info(&query_packet("SELECT a FROM t"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::SLAVE);
        assert!(info.is_trx_still_read_only());
    }

    #[test]
    fn transaction_loses_read_only_on_first_write() {
        let mut planner = planner();
        let ps = PsMap::new();
        let mut trx = TrxTracker::default();

        trx.track_statement(TypeMask::BEGIN_TRX);
        planner.update_route_info(&query_packet("BEGIN"), &trx, &ps, "db");
        trx.statement_done();

        // reads inside the transaction may use a replica while it stays
        // read-only per the replay coordinator's marker
        let info = planner.update_route_info(&query_packet("SELECT 1"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::SLAVE);

        let info =
            planner.update_route_info(&query_packet("UPDATE t SET a=1"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);
        assert!(!info.is_trx_still_read_only());

        // and stays on master for the rest of the transaction
        let info = planner.update_route_info(&query_packet("SELECT 2"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);
    }

    #[test]
    fn temp_table_read_upgrades_to_master() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();

        let info = planner.update_route_info(
            &query_packet("CREATE TEMPORARY TABLE t (a INT)"),
            &trx,
            &ps,
            "db",
        );
        assert_eq!(info.target(), TargetMask::MASTER);
        assert!(planner.route_info().is_tmp_table("db.t"));

        let info =
            planner.update_route_info(&query_packet("SELECT * FROM t"), &trx, &ps, "db");
        assert!(info.type_mask().contains(TypeMask::MASTER_READ));
        assert_eq!(info.target(), TargetMask::MASTER);

        planner.update_route_info(&query_packet("DROP TABLE t"), &trx, &ps, "db");
        assert!(!planner.route_info().have_tmp_tables());
    }

    #[test]
    fn hints_override_targets() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();

        let mut packet = query_packet("SELECT 1");
        packet.add_hint(Hint::RouteToMaster);
        let info = planner.update_route_info(&packet, &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);

        let mut packet = query_packet("INSERT INTO t VALUES (1)");
        packet.add_hint(Hint::RouteToSlave);
        let info = planner.update_route_info(&packet, &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::SLAVE);

        let mut packet = query_packet("SELECT 1");
        packet.add_hint(Hint::RouteToNamedServer("db-1".into()));
        let info = planner.update_route_info(&packet, &trx, &ps, "db");
        assert!(info.target().contains(TargetMask::NAMED_SERVER));
        assert!(info.target().contains(TargetMask::SLAVE));

        let mut packet = query_packet("SELECT 1");
        packet.add_hint(Hint::Parameter {
            key: "max_slave_replication_lag".into(),
            value: "10".into(),
        });
        let info = planner.update_route_info(&packet, &trx, &ps, "db");
        assert!(info.target().contains(TargetMask::RLAG_MAX));
    }

    #[test]
    fn execute_uses_prepare_type_mask() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let mut ps = PsMap::new();
        let internal = ps.register_prepare(TypeMask::READ, false);

        let mut execute = vec![CommandCode::ComStmtExecute as u8];
        execute.extend_from_slice(&internal.to_le_bytes());
        execute.push(0);
        execute.extend_from_slice(&1_u32.to_le_bytes());
        let info = planner.update_route_info(&Packet::from_vec(execute), &trx, &ps, "db");

        assert_eq!(info.type_mask(), TypeMask::READ);
        assert_eq!(info.target(), TargetMask::SLAVE);
        assert_eq!(info.stmt_id(), internal);
    }

    #[test]
    fn fetch_is_ps_continuation() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let mut ps = PsMap::new();
        let internal = ps.register_prepare(TypeMask::READ, false);

        let mut fetch = vec![CommandCode::ComStmtFetch as u8];
        fetch.extend_from_slice(&internal.to_le_bytes());
        fetch.extend_from_slice(&10_u32.to_le_bytes());
        let info = planner.update_route_info(&Packet::from_vec(fetch), &trx, &ps, "db");
        assert!(info.is_ps_continuation());
    }

    #[test]
    fn multi_statement_locks_session() {
        let mut planner = RoutePlanner::new(
            Box::<MariaDbClassifier>::default(),
            UseSqlVariablesIn::All,
            true,
        );
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        planner.update_route_info(&query_packet("SELECT 1; SELECT 2"), &trx, &ps, "db");
        assert!(planner.is_locked_to_master());
        let info = planner.update_route_info(&query_packet("SELECT 3"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);
    }

    #[test]
    fn load_data_continuation_follows_target() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();

        planner
            .route_info_mut()
            .set_load_data_state(LoadDataState::Active);
        let info = planner.update_route_info(&Packet::from_vec(vec![1, 2, 3]), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::LAST_USED);
        assert_eq!(info.load_data_sent(), 3);

        let info = planner.update_route_info(&Packet::from_vec(vec![]), &trx, &ps, "db");
        assert_eq!(info.load_data_state(), LoadDataState::End);

        planner.update_route_info(&query_packet("SELECT 1"), &trx, &ps, "db");
        assert_eq!(planner.route_info().load_data_state(), LoadDataState::Inactive);
    }

    #[test]
    fn revert_update_restores_previous_state() {
        let mut planner = planner();
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        planner.update_route_info(&query_packet("SELECT 1"), &trx, &ps, "db");
        let before = planner.route_info().target();
        planner.update_route_info(&query_packet("INSERT INTO t VALUES (1)"), &trx, &ps, "db");
        assert_ne!(planner.route_info().target(), before);
        planner.revert_update();
        assert_eq!(planner.route_info().target(), before);
    }

    #[test]
    fn uservar_read_policy() {
        // with use_sql_variables_in=master a user-variable read is no longer
        // replica-safe
        let mut planner = RoutePlanner::new(
            Box::<MariaDbClassifier>::default(),
            UseSqlVariablesIn::Master,
            false,
        );
        let trx = TrxTracker::default();
        let ps = PsMap::new();
        let info = planner.update_route_info(&query_packet("SELECT @x"), &trx, &ps, "db");
        assert_eq!(info.target(), TargetMask::MASTER);
    }
}
