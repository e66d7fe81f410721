use crate::backend::{BackendInstance, ServerRole};
use crate::config::{CausalReadsMode, HistoryPrunePolicy, ListenerConfig, UseSqlVariablesIn};

use clap::Parser;
use itertools::Itertools;
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser, Default, Debug, Clone)]
#[clap(
    name = "rw-proxy",
    version = "0.1.0",
    about = "read/write splitting proxy for MariaDB and PostgreSQL backends."
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    pub works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 3310)]
    pub port: u16,
    #[clap(long, value_name = "HTTP_PORT", default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, value_name = "TLS", default_value_t = false)]
    pub tls: bool,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    pub enable_metrics: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    pub log_level: Option<String>,
    /// Primary backend as name=host:port
    #[clap(long, value_name = "MASTER")]
    pub master: Option<String>,
    /// Replica backends as comma separated name=host:port entries
    #[clap(long, value_name = "REPLICAS")]
    pub replicas: Option<String>,
    /// Service account used for backend connections
    #[clap(long, value_name = "BACKEND_USER", default_value = "proxy")]
    pub backend_user: String,
    #[clap(long, value_name = "BACKEND_PASSWORD", default_value = "")]
    pub backend_password: String,
    #[clap(long, value_name = "SKIP_AUTHENTICATION", default_value_t = false)]
    pub skip_authentication: bool,
    #[clap(long, value_name = "MATCH_HOST", default_value_t = false)]
    pub match_host: bool,
    #[clap(long, value_name = "LOWER_CASE_TABLE_NAMES", default_value_t = 0)]
    pub lower_case_table_names: u8,
    #[clap(long, value_name = "LOG_PASSWORD_MISMATCH", default_value_t = false)]
    pub log_password_mismatch: bool,
    /// SQL run on every fresh backend connection, comma separated
    #[clap(long, value_name = "CONNECTION_INIT_SQL")]
    pub connection_init_sql: Option<String>,
    #[clap(long, value_name = "CAUSAL_READS")]
    pub causal_reads: Option<String>,
    #[clap(long, value_name = "CAUSAL_READS_TIMEOUT_SECS", default_value_t = 10)]
    pub causal_reads_timeout: u64,
    #[clap(long, value_name = "USE_SQL_VARIABLES_IN")]
    pub use_sql_variables_in: Option<String>,
    #[clap(long, value_name = "HISTORY_PRUNE_POLICY")]
    pub history_prune_policy: Option<String>,
    #[clap(long, value_name = "HISTORY_MAX_ENTRIES", default_value_t = 50)]
    pub history_max_entries: usize,
    #[clap(long, value_name = "IDLE_PING_SECS", default_value_t = 300)]
    pub idle_ping_secs: u64,
    #[clap(long, value_name = "PROXY_PROTOCOL", default_value_t = false)]
    pub proxy_protocol: bool,
}

fn parse_server(entry: &str, role: ServerRole) -> Option<BackendInstance> {
    let (name, addr) = entry.split_once('=')?;
    Some(BackendInstance::new(name.trim(), addr.trim(), role))
}

impl ProxyServerArgs {
    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig {
            skip_authentication: self.skip_authentication,
            match_host: self.match_host,
            lower_case_table_names: self.lower_case_table_names,
            log_password_mismatch: self.log_password_mismatch,
            causal_reads_timeout: Duration::from_secs(self.causal_reads_timeout),
            idle_ping_interval: Duration::from_secs(self.idle_ping_secs),
            proxy_protocol: self.proxy_protocol,
            ..Default::default()
        };
        if let Some(init_sql) = &self.connection_init_sql {
            config.connection_init_sql = init_sql
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(mode) = &self.causal_reads {
            config.causal_reads =
                CausalReadsMode::from_str(&mode.to_lowercase()).unwrap_or_default();
        }
        if let Some(vars) = &self.use_sql_variables_in {
            config.use_sql_variables_in =
                UseSqlVariablesIn::from_str(&vars.to_lowercase()).unwrap_or_default();
        }
        if let Some(policy) = &self.history_prune_policy {
            config.history.prune_policy =
                HistoryPrunePolicy::from_str(&policy.to_lowercase()).unwrap_or_default();
        }
        config.history.max_entries = self.history_max_entries;
        config
    }

    pub fn backend_list(&self) -> Vec<BackendInstance> {
        let mut servers = Vec::new();
        if let Some(master) = &self.master {
            if let Some(instance) = parse_server(master, ServerRole::Master) {
                servers.push(instance);
            }
        }
        if let Some(replicas) = &self.replicas {
            let parsed = replicas
                .split(',')
                .filter_map(|entry| parse_server(entry, ServerRole::Replica))
                .collect_vec();
            servers.extend(parsed);
        }
        servers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_list_parses_roles() {
        let args = ProxyServerArgs {
            master: Some("db-1=10.0.0.1:3306".to_string()),
            replicas: Some("db-2=10.0.0.2:3306, db-3=10.0.0.3:3306".to_string()),
            ..Default::default()
        };
        let servers = args.backend_list();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0].role, ServerRole::Master);
        assert_eq!(servers[0].name, "db-1");
        assert_eq!(servers[2].addr, "10.0.0.3:3306");
        assert_eq!(servers[2].role, ServerRole::Replica);
    }

    #[test]
    fn listener_config_from_args() {
        let args = ProxyServerArgs {
            causal_reads: Some("local".to_string()),
            connection_init_sql: Some("SET NAMES utf8mb4".to_string()),
            history_prune_policy: Some("bounded".to_string()),
            ..Default::default()
        };
        let config = args.listener_config();
        assert_eq!(config.causal_reads, CausalReadsMode::Local);
        assert_eq!(config.connection_init_sql, vec!["SET NAMES utf8mb4"]);
        assert_eq!(config.history.prune_policy, HistoryPrunePolicy::Bounded);
    }
}
