use clap::Parser;
use common::ShutdownMessage;
use proxy::server::auth::authenticator::ProxyAuthenticator;
use proxy::server::auth::UserAccountStore;
use proxy::server::listener::{BackendAuth, RwSplitServer};
use proxy::server::proxy_cli_args::ProxyServerArgs;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("ProxySrv receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("ProxySrv receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

fn main() -> anyhow::Result<()> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let works = proxy_config.works;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RW_PROXY")
        .worker_threads(works)
        .build()?;

    info!("ProxySrv running config args={:?}", proxy_config);
    if proxy_config.enable_metrics {
        common::metrics::install();
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(ShutdownMessage::Init);
    runtime.block_on(async {
        let servers = proxy_config.backend_list();
        if servers.is_empty() {
            warn!("ProxySrv started without any configured backend");
        }
        let backend_auth = BackendAuth {
            user: proxy_config.backend_user.clone(),
            password: proxy_config.backend_password.clone(),
        };
        // the account cache is loaded out of band; start empty unless
        // authentication is skipped at the listener
        let accounts = Arc::new(UserAccountStore::new(Vec::new()));

        let proxy_srv = RwSplitServer::new(
            proxy_config.listener_config(),
            accounts,
            servers,
            backend_auth,
            ProxyAuthenticator,
        );

        let port = proxy_config.port;
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("ProxySrv listening on 0.0.0.0:{port}");
        let proxy_srv_arc = Arc::new(proxy_srv);
        loop {
            tokio::select! {
                shutdown_msg = shutdown_signal() => {
                    shutdown_tx.send(shutdown_msg.clone())?;
                    break;
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
                rs = tcp_listener.accept() => {
                    match rs {
                        Ok((stream, addr)) => {
                            let (client_reader, client_writer) = stream.into_split();
                            let proxy_arc_clone = Arc::clone(&proxy_srv_arc);
                            tokio::spawn(async move {
                                if let Err(e) = proxy_arc_clone
                                    .connect(client_reader, client_writer, Some(addr))
                                    .await
                                {
                                    warn!("ProxySrv session error: {e:?}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("ProxySrv accept connection err. cause by {e:?}");
                        }
                    }
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
