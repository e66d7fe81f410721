//! Per-server, per-user cache of idle backend connections. A connection
//! handed back by a clean session is reusable in one of three modes of
//! decreasing fidelity; `can_reuse` classifies the match.

use crate::backend::conn::{BackendConn, ConnIdentity, RELEVANT_CAPS};
use crate::backend::{BackendInstance, BackendState};
use crate::session::BackendId;

use dashmap::DashMap;
use deadpool::managed::{Metrics, RecycleError, RecycleResult};
use futures::FutureExt;
use nanoid::nanoid;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How an idle pooled connection may serve a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReuseType {
    None,
    /// Compatible capabilities only: a COM_CHANGE_USER re-binds the session.
    ChangeUser,
    /// Same account; a COM_RESET_CONNECTION wipes the session state.
    ResetConnection,
    /// Same account, same default database, same client constraints.
    Direct,
}

/// Classify whether (and how) a pooled connection bound to `pooled` can serve
/// a session with identity `wanted`.
pub fn can_reuse(pooled: &ConnIdentity, wanted: &ConnIdentity, proxy_protocol: bool) -> ReuseType {
    // Capability bits that change how the protocol works must match; the
    // connection was created with them baked in.
    let caps_ok =
        (pooled.capabilities & RELEVANT_CAPS) == (wanted.capabilities & RELEVANT_CAPS);

    // With the PROXY protocol the backend saw the original client address;
    // handing the connection to a different client would lie to the server.
    let remote_ok = !proxy_protocol || pooled.client_remote == wanted.client_remote;

    if !caps_ok || !remote_ok {
        return ReuseType::None;
    }

    if pooled.user_and_host() == wanted.user_and_host() {
        if pooled.db == wanted.db {
            ReuseType::Direct
        } else {
            ReuseType::ResetConnection
        }
    } else {
        ReuseType::ChangeUser
    }
}

pub type TcpBackendConn = BackendConn<OwnedReadHalf, OwnedWriteHalf>;

/// One pooled connection. The inner connection is shared with the session
/// that checked it out.
pub struct PooledConn {
    pub id: String,
    pub identity: ConnIdentity,
    pub conn: Arc<Mutex<TcpBackendConn>>,
}

/// Dials and recycles connections of one (server, account) pool.
pub struct PooledConnMgr {
    backend: BackendInstance,
    identity: ConnIdentity,
    password: Vec<u8>,
    init_sql: Vec<String>,
    next_backend_id: Arc<AtomicU32>,
}

impl PooledConnMgr {
    pub fn new(
        backend: BackendInstance,
        identity: ConnIdentity,
        password: Vec<u8>,
        init_sql: Vec<String>,
        next_backend_id: Arc<AtomicU32>,
    ) -> Self {
        Self {
            backend,
            identity,
            password,
            init_sql,
            next_backend_id,
        }
    }

    async fn dial(&self) -> std::io::Result<TcpBackendConn> {
        let stream = TcpStream::connect(&self.backend.addr).await?;
        let (read_half, write_half) = stream.into_split();
        let id: BackendId = self.next_backend_id.fetch_add(1, Ordering::Relaxed);
        Ok(BackendConn::new(id, self.backend.clone(), read_half, write_half))
    }
}

impl deadpool::managed::Manager for PooledConnMgr {
    type Type = PooledConn;
    type Error = std::io::Error;

    fn create(&self) -> impl Future<Output = Result<Self::Type, Self::Error>> + Send {
        async move {
            let mut conn = self.dial().await?;
            conn.authenticate(self.identity.clone(), &self.password)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::PermissionDenied, e))?;
            conn.run_connection_init(&self.init_sql)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(PooledConn {
                id: nanoid!(),
                identity: self.identity.clone(),
                conn: Arc::new(Mutex::new(conn)),
            })
        }
        .boxed()
    }

    fn recycle(
        &self,
        pooled: &mut Self::Type,
        _metrics: &Metrics,
    ) -> impl Future<Output = RecycleResult<Self::Error>> + Send {
        async {
            let mut conn = pooled.conn.lock().await;
            if conn.state.is_failed() {
                return Err(RecycleError::from(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection already failed",
                )));
            }
            // wipe session state before the next checkout
            crate::protocol::mysql::packet::writers::write_reset_connection(&mut conn.writer)
                .await?;
            match conn.reader.next_async().await? {
                Some((_, reply)) if reply.is_ok_packet() => {
                    conn.state = BackendState::Pooled;
                    Ok(())
                }
                Some((_, reply)) if reply.is_err_packet() => {
                    warn!(
                        "ProxySrv Failed recycled backend-end id={:?}: reset returned an error",
                        pooled.id
                    );
                    Err(RecycleError::from(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "reset connection failed",
                    )))
                }
                _ => Err(RecycleError::from(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "backend closed during recycle",
                ))),
            }
        }
        .boxed()
    }

    fn detach(&self, pooled: &mut PooledConn) {
        let conn = Arc::clone(&pooled.conn);
        let conn_id = pooled.id.clone();
        tokio::spawn(async move {
            let mut guard = conn.lock().await;
            guard.close().await;
            debug!("ProxySrv Detached backend-end id={:?}", conn_id);
        });
    }
}

pub type BackendPool = deadpool::managed::Pool<PooledConnMgr>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub server: String,
    pub user_and_host: String,
}

/// All pools of one worker, keyed by server and account. Pools are created
/// lazily on first use.
pub struct BackendPools {
    pools: DashMap<PoolKey, BackendPool>,
    init_sql: Vec<String>,
    next_backend_id: Arc<AtomicU32>,
    max_pool_size: usize,
}

impl BackendPools {
    pub fn new(init_sql: Vec<String>, max_pool_size: usize) -> Self {
        Self {
            pools: DashMap::new(),
            init_sql,
            next_backend_id: Arc::new(AtomicU32::new(1)),
            max_pool_size,
        }
    }

    pub fn pool_for(
        &self,
        backend: &BackendInstance,
        identity: &ConnIdentity,
        password: &[u8],
    ) -> BackendPool {
        let key = PoolKey {
            server: backend.name.clone(),
            user_and_host: identity.user_and_host(),
        };
        self.pools
            .entry(key)
            .or_insert_with(|| {
                let mgr = PooledConnMgr::new(
                    backend.clone(),
                    identity.clone(),
                    password.to_vec(),
                    self.init_sql.clone(),
                    Arc::clone(&self.next_backend_id),
                );
                BackendPool::builder(mgr)
                    .max_size(self.max_pool_size)
                    .build()
                    .expect("pool config is static")
            })
            .clone()
    }
}
