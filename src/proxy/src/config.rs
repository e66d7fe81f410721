use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum_macros::EnumString;

/// How aggressively the session command history is pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HistoryPrunePolicy {
    /// Keep everything for the lifetime of the session.
    Disabled,
    /// Drop entries below the minimum pinned position of all live backends.
    #[default]
    PruneFromMin,
    /// Like `PruneFromMin` plus a hard cap on the entry count.
    Bounded,
}

/// Causal read coordination mode, see the router documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CausalReadsMode {
    #[default]
    None,
    Local,
    Global,
    FastGlobal,
    Universal,
}

/// Where reads of SQL variables may be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Default)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UseSqlVariablesIn {
    #[default]
    All,
    Master,
}

/// Listener-level options recognized by the protocol core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Disable password verification for trusted networks.
    #[serde(default)]
    pub skip_authentication: bool,
    /// Require the account host pattern to match the client address.
    #[serde(default)]
    pub match_host: bool,
    /// Database name comparison mode, 0/1/2 as in the server.
    #[serde(default)]
    pub lower_case_table_names: u8,
    /// Emit detailed diagnostics on password mismatch.
    #[serde(default)]
    pub log_password_mismatch: bool,
    /// SQL executed on every new backend connection, one OK expected per query.
    #[serde(default)]
    pub connection_init_sql: Vec<String>,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub causal_reads: CausalReadsMode,
    #[serde(default = "default_causal_reads_timeout")]
    pub causal_reads_timeout: Duration,
    #[serde(default)]
    pub use_sql_variables_in: UseSqlVariablesIn,
    /// Idle interval after which a backend gets a COM_PING.
    #[serde(default = "default_idle_ping_interval")]
    pub idle_ping_interval: Duration,
    /// Send a PROXY protocol v1 line as the first bytes to the backend.
    #[serde(default)]
    pub proxy_protocol: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HistoryConfig {
    #[serde(default)]
    pub prune_policy: HistoryPrunePolicy,
    /// Entry cap used by the `Bounded` policy.
    #[serde(default = "default_history_cap")]
    pub max_entries: usize,
}

fn default_history_cap() -> usize {
    50
}

fn default_causal_reads_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_ping_interval() -> Duration {
    Duration::from_secs(300)
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            skip_authentication: false,
            match_host: false,
            lower_case_table_names: 0,
            log_password_mismatch: false,
            connection_init_sql: Vec::new(),
            history: HistoryConfig::default(),
            causal_reads: CausalReadsMode::default(),
            causal_reads_timeout: default_causal_reads_timeout(),
            use_sql_variables_in: UseSqlVariablesIn::default(),
            idle_ping_interval: default_idle_ping_interval(),
            proxy_protocol: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn causal_mode_from_str() {
        assert_eq!(
            CausalReadsMode::from_str("fast_global").unwrap(),
            CausalReadsMode::FastGlobal
        );
        assert_eq!(
            CausalReadsMode::from_str("local").unwrap(),
            CausalReadsMode::Local
        );
    }

    #[test]
    fn defaults() {
        let config = ListenerConfig::default();
        assert!(!config.skip_authentication);
        assert_eq!(config.history.prune_policy, HistoryPrunePolicy::PruneFromMin);
        assert_eq!(config.causal_reads, CausalReadsMode::None);
        assert_eq!(config.causal_reads_timeout, Duration::from_secs(10));
    }
}
