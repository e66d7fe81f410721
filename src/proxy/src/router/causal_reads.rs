//! Causal read coordination. After a write, the session remembers the
//! server-reported GTID; before a read goes to a replica, a wait statement is
//! packed in front of the read inside the same packet so one round trip
//! suffices. The wait's OK is stripped from the reply stream and the
//! remaining sequence numbers are corrected, so the client only ever sees the
//! read's response. On wait timeout the read is retried on the primary.

use crate::config::CausalReadsMode;
use crate::protocol::mysql::constants::{CommandCode, MAX_PAYLOAD_LEN};
use crate::protocol::mysql::packet::Packet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Synthetic error sent when a causal read times out inside a read-only
/// transaction, where a retry on the primary is impossible.
pub const RO_TRX_TIMEOUT_CODE: u16 = 1792;
pub const RO_TRX_TIMEOUT_SQLSTATE: &str = "25006";
pub const RO_TRX_TIMEOUT_MESSAGE: &str =
    "Causal read timed out while in a read-only transaction, cannot retry command.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitGtidState {
    #[default]
    None,
    ReadingGtid,
    GtidReadDone,
    WaitingForHeader,
    UpdatingPackets,
    RetryingOnMaster,
}

/// What to do with one backend reply packet while a causal read is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CausalAction {
    /// Deliver to the client with the given sequence number.
    Forward(u8),
    /// The wait prefix's OK: invisible to the client.
    Discard,
    /// The wait timed out; retry the stashed statement on the primary.
    RetryOnMaster,
    /// The wait timed out inside a read-only transaction.
    SyntheticError,
}

/// Service-wide last seen GTID, shared by every session in GLOBAL modes.
#[derive(Debug, Clone, Default)]
pub struct GlobalGtid(Arc<RwLock<String>>);

impl GlobalGtid {
    pub fn set(&self, gtid: &str) {
        if let Ok(mut guard) = self.0.write() {
            *guard = gtid.to_string();
        }
    }

    pub fn get(&self) -> String {
        self.0.read().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct CausalReadCoordinator {
    mode: CausalReadsMode,
    timeout: Duration,
    state: WaitGtidState,
    gtid_pos: String,
    global_gtid: GlobalGtid,
    /// Copy of the query being causally read, kept for the retry path.
    current_query: Option<Packet>,
    next_seq: u8,
}

impl CausalReadCoordinator {
    pub fn new(mode: CausalReadsMode, timeout: Duration, global_gtid: GlobalGtid) -> Self {
        Self {
            mode,
            timeout,
            state: WaitGtidState::None,
            gtid_pos: String::new(),
            global_gtid,
            current_query: None,
            next_seq: 0,
        }
    }

    pub fn state(&self) -> WaitGtidState {
        self.state
    }

    pub fn mode(&self) -> CausalReadsMode {
        self.mode
    }

    /// Record the GTID a primary reported for a completed write.
    pub fn record_write_gtid(&mut self, gtid: &str) {
        if gtid.is_empty() {
            return;
        }
        match self.mode {
            CausalReadsMode::Global | CausalReadsMode::FastGlobal => self.global_gtid.set(gtid),
            CausalReadsMode::None => {}
            _ => self.gtid_pos = gtid.to_string(),
        }
    }

    fn wait_position(&self) -> String {
        match self.mode {
            CausalReadsMode::Global | CausalReadsMode::FastGlobal => self.global_gtid.get(),
            _ => self.gtid_pos.clone(),
        }
    }

    pub fn should_do_causal_read(&self) -> bool {
        match self.mode {
            // only wait when there is a position to wait for
            CausalReadsMode::Local => !self.gtid_pos.is_empty(),
            CausalReadsMode::Global | CausalReadsMode::FastGlobal => true,
            // universal behaves like local once the probe has completed
            CausalReadsMode::Universal => {
                self.state == WaitGtidState::GtidReadDone && !self.gtid_pos.is_empty()
            }
            CausalReadsMode::None => false,
        }
    }

    fn prefix_sql(&self) -> String {
        let gtid = self.wait_position();
        let timeout = self.timeout.as_secs();
        if self.mode == CausalReadsMode::FastGlobal {
            // fast mode sends only the wait, with no fallback error select
            format!(
                "SET @maxscale_secret_variable=(SELECT MASTER_GTID_WAIT('{gtid}', {timeout}));"
            )
        } else {
            // Pack the wait and the client query into one multi-statement to
            // save a round trip. On timeout the CASE arm raises an error, so
            // the query itself never runs and can be retried on the primary.
            format!(
                "SET @maxscale_secret_variable=(SELECT CASE WHEN \
                 MASTER_GTID_WAIT('{gtid}', {timeout}) = 0 \
                 THEN 1 ELSE (SELECT 1 FROM INFORMATION_SCHEMA.ENGINES) END);"
            )
        }
    }

    /// Prepend the wait statement to a COM_QUERY payload. Returns `None`
    /// (and leaves the packet alone) when the combined statement would not
    /// fit into a single wire packet. The original packet is stashed for the
    /// retry-on-master path.
    pub fn add_prefix_wait_gtid(&mut self, origin: &Packet) -> Option<Vec<u8>> {
        let sql = origin.sql()?;
        let prefix = self.prefix_sql();
        if origin.len() + prefix.len() >= MAX_PAYLOAD_LEN {
            return None;
        }

        self.current_query = Some(origin.clone());

        let mut payload = Vec::with_capacity(1 + prefix.len() + sql.len());
        payload.push(CommandCode::ComQuery as u8);
        payload.extend_from_slice(prefix.as_bytes());
        payload.extend_from_slice(sql);

        self.state = WaitGtidState::WaitingForHeader;
        Some(payload)
    }

    /// Process one reply packet from the backend executing a prefixed read.
    /// `in_read_only_trx` selects the synthetic-error path on timeout.
    pub fn on_reply_packet(
        &mut self,
        packet: &Packet,
        in_read_only_trx: bool,
    ) -> CausalAction {
        match self.state {
            WaitGtidState::WaitingForHeader => {
                if packet.is_ok_packet() {
                    // the wait completed; swallow its OK and renumber the rest
                    self.state = WaitGtidState::UpdatingPackets;
                    self.next_seq = 1;
                    CausalAction::Discard
                } else if packet.is_err_packet() {
                    if in_read_only_trx {
                        self.state = WaitGtidState::None;
                        self.current_query = None;
                        CausalAction::SyntheticError
                    } else {
                        self.state = WaitGtidState::RetryingOnMaster;
                        CausalAction::RetryOnMaster
                    }
                } else {
                    // resultset packets cannot precede the prefix's reply
                    CausalAction::Forward(self.bump_seq())
                }
            }
            WaitGtidState::UpdatingPackets => CausalAction::Forward(self.bump_seq()),
            // no wait in flight; the caller forwards with its own sequence
            _ => CausalAction::Forward(self.next_seq),
        }
    }

    fn bump_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// The statement to retry on the primary after a wait timeout, carrying
    /// a route-to-master hint so the retry cannot land on a replica again.
    pub fn take_retry_query(&mut self) -> Option<Packet> {
        debug_assert_eq!(self.state, WaitGtidState::RetryingOnMaster);
        self.state = WaitGtidState::None;
        let mut packet = self.current_query.take()?;
        packet.add_hint(crate::parser::hint::Hint::RouteToMaster);
        Some(packet)
    }

    /// The reply for the prefixed read completed normally.
    pub fn reply_complete(&mut self) {
        if matches!(
            self.state,
            WaitGtidState::WaitingForHeader | WaitGtidState::UpdatingPackets
        ) {
            self.state = WaitGtidState::None;
            self.current_query = None;
        }
    }

    /// One-time probe of UNIVERSAL mode: read the current GTID position from
    /// the primary before the first causal read.
    pub fn start_gtid_probe(&mut self) -> Packet {
        info!("Starting GTID probe");
        self.state = WaitGtidState::ReadingGtid;
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend_from_slice(b"SELECT @@gtid_current_pos");
        let mut packet = Packet::from_vec(payload);
        packet.add_hint(crate::parser::hint::Hint::RouteToMaster);
        packet
    }

    pub fn needs_gtid_probe(&self) -> bool {
        self.mode == CausalReadsMode::Universal && self.state == WaitGtidState::None
    }

    /// Store the probe's single-row result.
    pub fn complete_gtid_probe(&mut self, gtid: &str) {
        debug_assert_eq!(self.state, WaitGtidState::ReadingGtid);
        self.gtid_pos = gtid.to_string();
        self.state = WaitGtidState::GtidReadDone;
        info!("GTID probe complete, GTID is: {gtid}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(mode: CausalReadsMode) -> CausalReadCoordinator {
        CausalReadCoordinator::new(mode, Duration::from_secs(10), GlobalGtid::default())
    }

    fn query(sql: &str) -> Packet {
        let mut payload = vec![CommandCode::ComQuery as u8];
        payload.extend_from_slice(sql.as_bytes());
        Packet::from_vec(payload)
    }

    #[test]
    fn read_after_write_prefix_bytes() {
        let mut causal = coordinator(CausalReadsMode::Local);
        causal.record_write_gtid("0-1-42");
        assert!(causal.should_do_causal_read());

        let payload = causal.add_prefix_wait_gtid(&query("SELECT * FROM t")).unwrap();
        assert_eq!(payload[0], CommandCode::ComQuery as u8);
        assert_eq!(
            std::str::from_utf8(&payload[1..]).unwrap(),
            "SET @maxscale_secret_variable=(SELECT CASE WHEN \
             MASTER_GTID_WAIT('0-1-42', 10) = 0 \
             THEN 1 ELSE (SELECT 1 FROM INFORMATION_SCHEMA.ENGINES) END);\
             SELECT * FROM t"
        );
        assert_eq!(causal.state(), WaitGtidState::WaitingForHeader);
    }

    #[test]
    fn wait_ok_is_invisible_and_sequences_rewritten() {
        let mut causal = coordinator(CausalReadsMode::Local);
        causal.record_write_gtid("0-1-42");
        causal.add_prefix_wait_gtid(&query("SELECT 1")).unwrap();

        // the prefix's OK is swallowed
        let ok = Packet::from_vec(vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(causal.on_reply_packet(&ok, false), CausalAction::Discard);

        // the SELECT's packets are renumbered contiguously from 1
        let column_count = Packet::from_vec(vec![0x01]);
        assert_eq!(
            causal.on_reply_packet(&column_count, false),
            CausalAction::Forward(1)
        );
        let row = Packet::from_vec(vec![0x01, 0x31]);
        assert_eq!(causal.on_reply_packet(&row, false), CausalAction::Forward(2));

        causal.reply_complete();
        assert_eq!(causal.state(), WaitGtidState::None);
    }

    #[test]
    fn timeout_retries_on_master_with_hint() {
        let mut causal = coordinator(CausalReadsMode::Local);
        causal.record_write_gtid("0-1-42");
        causal.add_prefix_wait_gtid(&query("SELECT 2")).unwrap();

        let err = Packet::from_vec(vec![0xff, 0x00, 0x07, b'#', b'H', b'Y', b'0', b'0', b'0']);
        assert_eq!(
            causal.on_reply_packet(&err, false),
            CausalAction::RetryOnMaster
        );
        let retry = causal.take_retry_query().unwrap();
        assert_eq!(retry.sql().unwrap(), b"SELECT 2");
        assert!(retry
            .hints()
            .contains(&crate::parser::hint::Hint::RouteToMaster));
    }

    #[test]
    fn timeout_in_read_only_trx_is_synthetic_error() {
        let mut causal = coordinator(CausalReadsMode::Local);
        causal.record_write_gtid("0-1-9");
        causal.add_prefix_wait_gtid(&query("SELECT 3")).unwrap();

        let err = Packet::from_vec(vec![0xff, 0x00, 0x07]);
        assert_eq!(
            causal.on_reply_packet(&err, true),
            CausalAction::SyntheticError
        );
        assert_eq!(causal.state(), WaitGtidState::None);
    }

    #[test]
    fn global_mode_shares_position() {
        let shared = GlobalGtid::default();
        let mut writer =
            CausalReadCoordinator::new(CausalReadsMode::Global, Duration::from_secs(5), shared.clone());
        let mut reader =
            CausalReadCoordinator::new(CausalReadsMode::Global, Duration::from_secs(5), shared);

        writer.record_write_gtid("0-2-7");
        assert!(reader.should_do_causal_read());
        let payload = reader.add_prefix_wait_gtid(&query("SELECT 1")).unwrap();
        assert!(String::from_utf8_lossy(&payload).contains("'0-2-7'"));
    }

    #[test]
    fn fast_global_has_no_fallback() {
        let mut causal = coordinator(CausalReadsMode::FastGlobal);
        causal.record_write_gtid("0-3-1");
        let payload = causal.add_prefix_wait_gtid(&query("SELECT 1")).unwrap();
        let sql = String::from_utf8_lossy(&payload);
        assert!(sql.contains("MASTER_GTID_WAIT('0-3-1', 10)"));
        assert!(!sql.contains("INFORMATION_SCHEMA"));
    }

    #[test]
    fn universal_probe_cycle() {
        let mut causal = coordinator(CausalReadsMode::Universal);
        assert!(causal.needs_gtid_probe());
        assert!(!causal.should_do_causal_read());

        let probe = causal.start_gtid_probe();
        assert_eq!(probe.sql().unwrap(), b"SELECT @@gtid_current_pos");
        assert_eq!(causal.state(), WaitGtidState::ReadingGtid);

        causal.complete_gtid_probe("0-1-100");
        assert!(causal.should_do_causal_read());
        causal.record_write_gtid("0-1-101");
        let payload = causal.add_prefix_wait_gtid(&query("SELECT 1")).unwrap();
        assert!(String::from_utf8_lossy(&payload).contains("'0-1-101'"));
    }
}
