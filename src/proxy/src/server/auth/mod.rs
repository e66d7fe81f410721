pub mod authenticator;

use crate::protocol::mysql::auth_plugin::gen_scramble;
use crate::protocol::mysql::constants::AuthPluginName;
use hashbrown::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

pub fn gen_user_salt() -> [u8; 20] {
    gen_scramble()
}

/// One entry of the user-account cache.
#[derive(Debug, Clone)]
pub struct UserAccount {
    pub user: String,
    /// Host pattern the client address must match ('%' wildcard).
    pub host_pattern: String,
    pub plugin: AuthPluginName,
    /// Stored double hash for the plugin, empty for passwordless accounts.
    pub stored_hash: Vec<u8>,
    pub is_super: bool,
}

impl UserAccount {
    pub fn host_matches(&self, host: &str) -> bool {
        host_pattern_matches(&self.host_pattern, host)
    }
}

fn host_pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "%" || pattern.is_empty() {
        return true;
    }
    // '%' matches any run of characters, '_' any single one
    fn matches(p: &[u8], h: &[u8]) -> bool {
        match (p.first(), h.first()) {
            (None, None) => true,
            (Some(b'%'), _) => {
                matches(&p[1..], h) || (!h.is_empty() && matches(p, &h[1..]))
            }
            (Some(b'_'), Some(_)) => matches(&p[1..], &h[1..]),
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => matches(&p[1..], &h[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), host.as_bytes())
}

const REFRESH_MIN_INTERVAL: Duration = Duration::from_secs(30);

/// Read-mostly snapshot of user accounts. A failed authentication may request
/// a refresh in case the cached entry is stale; requests are rate limited.
pub struct UserAccountStore {
    accounts: Vec<UserAccount>,
    last_refresh_request: Mutex<Option<Instant>>,
}

impl UserAccountStore {
    pub fn new(accounts: Vec<UserAccount>) -> Self {
        Self {
            accounts,
            last_refresh_request: Mutex::new(None),
        }
    }

    /// Find the account entry for user@host, preferring the most specific
    /// host pattern (exact before wildcard).
    pub fn find(&self, user: &str, host: &str) -> Option<&UserAccount> {
        let mut candidates: Vec<&UserAccount> = self
            .accounts
            .iter()
            .filter(|a| a.user == user && a.host_matches(host))
            .collect();
        candidates.sort_by_key(|a| a.host_pattern.bytes().filter(|b| *b == b'%').count());
        candidates.first().copied()
    }

    /// Request an immediate user-data refresh; returns false when rate
    /// limited. The actual reload is the monitor's concern.
    pub fn request_refresh(&self) -> bool {
        let mut last = self
            .last_refresh_request
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < REFRESH_MIN_INTERVAL => false,
            _ => {
                *last = Some(now);
                info!("Requesting user account refresh");
                true
            }
        }
    }
}

/// Builds a store from (user, host, password, super) tuples; handy for
/// tests and static configurations.
pub fn account_store_from_plain(
    entries: &[(&str, &str, &str, bool)],
) -> UserAccountStore {
    use crate::protocol::mysql::auth_plugin::stored_hash;
    let accounts = entries
        .iter()
        .map(|(user, host, password, is_super)| UserAccount {
            user: user.to_string(),
            host_pattern: host.to_string(),
            plugin: AuthPluginName::AuthNativePassword,
            stored_hash: stored_hash(AuthPluginName::AuthNativePassword, password.as_bytes()),
            is_super: *is_super,
        })
        .collect();
    UserAccountStore::new(accounts)
}

/// Connection attributes that survive for diagnostics.
pub type ConnectAttributes = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_patterns() {
        assert!(host_pattern_matches("%", "10.1.2.3"));
        assert!(host_pattern_matches("10.1.%", "10.1.2.3"));
        assert!(!host_pattern_matches("10.2.%", "10.1.2.3"));
        assert!(host_pattern_matches("app_", "app1"));
        assert!(!host_pattern_matches("app_", "app12"));
    }

    #[test]
    fn find_prefers_specific_host() {
        let store = account_store_from_plain(&[
            ("alice", "%", "pw-any", false),
            ("alice", "10.0.0.1", "pw-exact", false),
        ]);
        let found = store.find("alice", "10.0.0.1").unwrap();
        assert_eq!(found.host_pattern, "10.0.0.1");
        let wildcard = store.find("alice", "10.9.9.9").unwrap();
        assert_eq!(wildcard.host_pattern, "%");
        assert!(store.find("bob", "10.0.0.1").is_none());
    }

    #[test]
    fn refresh_is_rate_limited() {
        let store = account_store_from_plain(&[]);
        assert!(store.request_refresh());
        assert!(!store.request_refresh());
    }
}
