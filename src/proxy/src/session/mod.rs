pub mod history;
pub mod ps_map;

use crate::parser::type_mask::TypeMask;
use crate::protocol::mysql::basic::SessionTrack;
use mysql_common::constants::StatusFlags;

/// Stable per-session handle of one backend connection. Components hold ids,
/// never references to each other.
pub type BackendId = u32;

/// Client-side protocol phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    HandshakeWait,
    Authenticating,
    Routing,
    Closed,
}

/// Transaction state of the session, fed primarily by server session
/// tracking on OK packets, with the classifier as fallback when the server
/// does not report tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrxTracker {
    autocommit: bool,
    trx_active: bool,
    trx_read_only: bool,
    trx_ending: bool,
    trx_starting: bool,
}

impl Default for TrxTracker {
    fn default() -> Self {
        Self {
            autocommit: true,
            trx_active: false,
            trx_read_only: false,
            trx_ending: false,
            trx_starting: false,
        }
    }
}

impl TrxTracker {
    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn is_trx_active(&self) -> bool {
        self.trx_active
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.trx_read_only
    }

    pub fn is_trx_ending(&self) -> bool {
        self.trx_ending
    }

    pub fn is_trx_starting(&self) -> bool {
        self.trx_starting
    }

    /// Classifier-driven update, applied when a statement is routed.
    pub fn track_statement(&mut self, mask: TypeMask) {
        self.trx_starting = mask.contains(TypeMask::BEGIN_TRX);
        self.trx_ending = mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK);

        if mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            self.trx_active = false;
            self.trx_read_only = false;
        } else if mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
            // with autocommit off every statement runs inside a transaction
            self.trx_active = true;
        }

        if self.trx_starting {
            self.trx_active = true;
            self.trx_read_only = mask.contains(TypeMask::READONLY);
        }
    }

    /// Applied when the final reply of a statement has been delivered.
    pub fn statement_done(&mut self) {
        if self.trx_ending {
            self.trx_active = !self.autocommit;
            self.trx_read_only = false;
            self.trx_ending = false;
        }
        self.trx_starting = false;
    }

    /// Server-authoritative update from the status flags of an OK packet.
    pub fn track_status_flags(&mut self, status: StatusFlags) {
        self.autocommit = status.contains(StatusFlags::SERVER_STATUS_AUTOCOMMIT);
        self.trx_active = status.contains(StatusFlags::SERVER_STATUS_IN_TRANS);
        if status.contains(StatusFlags::SERVER_STATUS_IN_TRANS_READONLY) {
            self.trx_read_only = true;
        } else if !self.trx_active {
            self.trx_read_only = false;
        }
    }

    /// Server-authoritative update from session-tracking entries. The
    /// transaction-state string starts with 'I' when the session is idle;
    /// anything else means a transaction is open.
    pub fn track_session_state(&mut self, entries: &[SessionTrack]) {
        for entry in entries {
            if let SessionTrack::TransactionState(state) = entry {
                self.trx_active = !state.starts_with('I');
                if !self.trx_active {
                    self.trx_read_only = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_cycle() {
        let mut trx = TrxTracker::default();
        assert!(!trx.is_trx_active());

        trx.track_statement(TypeMask::BEGIN_TRX);
        assert!(trx.is_trx_starting());
        assert!(trx.is_trx_active());
        trx.statement_done();

        trx.track_statement(TypeMask::READ);
        assert!(trx.is_trx_active());
        trx.statement_done();

        trx.track_statement(TypeMask::COMMIT);
        assert!(trx.is_trx_ending());
        trx.statement_done();
        assert!(!trx.is_trx_active());
    }

    #[test]
    fn read_only_transaction() {
        let mut trx = TrxTracker::default();
        trx.track_statement(TypeMask::BEGIN_TRX | TypeMask::READONLY);
        assert!(trx.is_trx_read_only());
        trx.statement_done();
        trx.track_statement(TypeMask::ROLLBACK);
        trx.statement_done();
        assert!(!trx.is_trx_read_only());
    }

    #[test]
    fn autocommit_toggle() {
        let mut trx = TrxTracker::default();
        trx.track_statement(TypeMask::SESSION_WRITE | TypeMask::DISABLE_AUTOCOMMIT);
        assert!(!trx.is_autocommit());
        assert!(trx.is_trx_active());

        trx.track_statement(TypeMask::SESSION_WRITE | TypeMask::ENABLE_AUTOCOMMIT);
        assert!(trx.is_autocommit());
        assert!(!trx.is_trx_active());
    }

    #[test]
    fn server_state_wins() {
        let mut trx = TrxTracker::default();
        trx.track_session_state(&[SessionTrack::TransactionState("T_______".into())]);
        assert!(trx.is_trx_active());
        trx.track_session_state(&[SessionTrack::TransactionState("I_______".into())]);
        assert!(!trx.is_trx_active());
    }
}
