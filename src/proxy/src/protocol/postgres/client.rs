//! Client side of the PostgreSQL v3 protocol: SSL-request handling, startup,
//! authentication, then the query phase in which each frontend message is
//! handed to the router. Backend routing reuses the same target resolution
//! as the MariaDB path via the shared classifier vocabulary.

use crate::config::ListenerConfig;
use crate::protocol::postgres::message::{
    backend, encode_error_response, encode_message, encode_ready_for_query, frontend, PgMessage,
    PgMessageReader,
};
use crate::server::auth::UserAccountStore;

use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const AUTH_OK: u32 = 0;
const AUTH_CLEARTEXT_PASSWORD: u32 = 3;
const PASSWORD_MESSAGE: u8 = b'p';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PgClientState {
    #[default]
    Startup,
    Authenticating,
    Ready,
    Closed,
}

/// A frontend message the routing phase must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgRequest {
    /// Simple query ('Q') with its SQL body.
    Query(Vec<u8>),
    /// Extended-protocol message (P/B/E/S) forwarded as-is.
    Extended(PgMessage),
    /// Graceful Terminate ('X').
    Terminate,
}

pub struct PgClientConnection<R, W> {
    pub reader: PgMessageReader<R>,
    pub writer: W,
    pub state: PgClientState,
    pub parameters: HashMap<String, String>,
    secret_key: u32,
    process_id: u32,
}

impl<R, W> PgClientConnection<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(reader: R, writer: W, process_id: u32, secret_key: u32) -> Self {
        Self {
            reader: PgMessageReader::new(reader),
            writer,
            state: PgClientState::Startup,
            parameters: HashMap::new(),
            secret_key,
            process_id,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.parameters.get("user").map(String::as_str)
    }

    pub fn database(&self) -> Option<&str> {
        self.parameters.get("database").map(String::as_str)
    }

    /// Run startup and authentication to completion: refuse TLS upgrades
    /// politely, store the startup parameters, verify the password when the
    /// listener demands one, and finish with BackendKeyData + ReadyForQuery.
    pub async fn handshake(
        &mut self,
        config: &ListenerConfig,
        accounts: &UserAccountStore,
        client_host: &str,
    ) -> io::Result<()> {
        debug_assert_eq!(self.state, PgClientState::Startup);
        loop {
            let Some(message) = self.reader.next_message().await? else {
                self.state = PgClientState::Closed;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client disconnected during startup",
                ));
            };
            if message.is_ssl_request() {
                // no TLS on this listener; the client may continue in clear
                self.writer.write_all(b"N").await?;
                self.writer.flush().await?;
                continue;
            }
            if message.is_cancel_request() {
                self.state = PgClientState::Closed;
                return Ok(());
            }
            if let Some(params) = message.startup_parameters() {
                self.parameters = params;
                break;
            }
            self.fail_startup("08P01", "expected a startup message").await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "malformed startup message",
            ));
        }

        let Some(user) = self.user().map(str::to_string) else {
            self.fail_startup("28000", "no user in startup packet").await?;
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "startup without user",
            ));
        };

        if config.skip_authentication {
            debug!("PgClient skip_authentication is on, accepting {user}");
        } else {
            self.state = PgClientState::Authenticating;
            let mut request = Vec::with_capacity(4);
            request.extend_from_slice(&AUTH_CLEARTEXT_PASSWORD.to_be_bytes());
            self.writer
                .write_all(&encode_message(backend::AUTHENTICATION, &request))
                .await?;
            self.writer.flush().await?;

            let Some(password_msg) = self.reader.next_message().await? else {
                self.state = PgClientState::Closed;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client disconnected during authentication",
                ));
            };
            if password_msg.tag != Some(PASSWORD_MESSAGE) {
                self.fail_startup("08P01", "expected a password message").await?;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "expected PasswordMessage",
                ));
            }
            let password = password_msg
                .payload
                .strip_suffix(&[0])
                .unwrap_or(&password_msg.payload);

            let verified = accounts.find(&user, client_host).is_some_and(|account| {
                account.stored_hash
                    == crate::protocol::mysql::auth_plugin::stored_hash(
                        crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword,
                        password,
                    )
            });
            if !verified {
                accounts.request_refresh();
                warn!("PgClient authentication failed for {user}@{client_host}");
                self.fail_startup(
                    "28P01",
                    &format!("password authentication failed for user \"{user}\""),
                )
                .await?;
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "password authentication failed",
                ));
            }
        }

        // AuthenticationOk, BackendKeyData, ReadyForQuery(idle)
        self.writer
            .write_all(&encode_message(
                backend::AUTHENTICATION,
                &AUTH_OK.to_be_bytes(),
            ))
            .await?;
        let mut key_data = Vec::with_capacity(8);
        key_data.extend_from_slice(&self.process_id.to_be_bytes());
        key_data.extend_from_slice(&self.secret_key.to_be_bytes());
        self.writer
            .write_all(&encode_message(backend::BACKEND_KEY_DATA, &key_data))
            .await?;
        self.writer.write_all(&encode_ready_for_query(b'I')).await?;
        self.writer.flush().await?;
        self.state = PgClientState::Ready;
        Ok(())
    }

    async fn fail_startup(&mut self, code: &str, message: &str) -> io::Result<()> {
        self.state = PgClientState::Closed;
        self.writer
            .write_all(&encode_error_response("FATAL", code, message))
            .await?;
        self.writer.flush().await
    }

    /// Next routable request from the client, `None` on hangup.
    pub async fn next_request(&mut self) -> io::Result<Option<PgRequest>> {
        debug_assert_eq!(self.state, PgClientState::Ready);
        loop {
            let Some(message) = self.reader.next_message().await? else {
                self.state = PgClientState::Closed;
                return Ok(None);
            };
            match message.tag {
                Some(frontend::QUERY) => {
                    let sql = message.query_sql().unwrap_or_default().to_vec();
                    return Ok(Some(PgRequest::Query(sql)));
                }
                Some(frontend::TERMINATE) => {
                    self.state = PgClientState::Closed;
                    return Ok(Some(PgRequest::Terminate));
                }
                Some(
                    frontend::PARSE | frontend::BIND | frontend::EXECUTE | frontend::SYNC,
                ) => {
                    return Ok(Some(PgRequest::Extended(message)));
                }
                Some(other) => {
                    debug!("PgClient ignoring message '{}'", other as char);
                }
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "untagged message after startup",
                    ));
                }
            }
        }
    }

    /// Synthetic error followed by ReadyForQuery, the Postgres shape of a
    /// client-visible failure that keeps the session alive.
    pub async fn send_error(&mut self, code: &str, message: &str) -> io::Result<()> {
        self.writer
            .write_all(&encode_error_response("ERROR", code, message))
            .await?;
        self.writer.write_all(&encode_ready_for_query(b'I')).await?;
        self.writer.flush().await
    }
}

/// The CancelRequest body after the 4 magic bytes: process id and secret.
pub fn parse_cancel_request(message: &PgMessage) -> Option<(u32, u32)> {
    if !message.is_cancel_request() || message.payload.len() < 12 {
        return None;
    }
    Some((
        BigEndian::read_u32(&message.payload[4..8]),
        BigEndian::read_u32(&message.payload[8..12]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::postgres::message::PROTOCOL_VERSION;
    use crate::server::auth::account_store_from_plain;
    use std::io::Cursor;

    fn startup_bytes(params: &[(&str, &str)]) -> Vec<u8> {
        let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
        for (k, v) in params {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let mut out = ((payload.len() as u32 + 4).to_be_bytes()).to_vec();
        out.extend_from_slice(&payload);
        out
    }

    #[tokio::test]
    async fn startup_to_ready_without_auth() {
        let wire = startup_bytes(&[("user", "alice"), ("database", "shop")]);
        let mut conn = PgClientConnection::new(Cursor::new(wire), Vec::new(), 7, 0xdead);
        let config = ListenerConfig {
            skip_authentication: true,
            ..Default::default()
        };
        let accounts = account_store_from_plain(&[]);
        conn.handshake(&config, &accounts, "10.0.0.1").await.unwrap();
        assert_eq!(conn.state, PgClientState::Ready);
        assert_eq!(conn.user(), Some("alice"));
        assert_eq!(conn.database(), Some("shop"));

        // R(ok), K, Z in order
        let out = &conn.writer;
        assert_eq!(out[0], backend::AUTHENTICATION);
        assert_eq!(BigEndian::read_u32(&out[5..9]), AUTH_OK);
        let key_at = 9;
        assert_eq!(out[key_at], backend::BACKEND_KEY_DATA);
        assert_eq!(out[out.len() - 6], backend::READY_FOR_QUERY);
        assert_eq!(out[out.len() - 1], b'I');
    }

    #[tokio::test]
    async fn cleartext_password_verified() {
        let mut wire = startup_bytes(&[("user", "alice")]);
        // PasswordMessage with trailing NUL
        let mut pw = b"secret".to_vec();
        pw.push(0);
        wire.extend(encode_message(PASSWORD_MESSAGE, &pw));
        wire.extend(encode_message(frontend::QUERY, b"SELECT 1\0"));

        let mut conn = PgClientConnection::new(Cursor::new(wire), Vec::new(), 1, 2);
        let config = ListenerConfig::default();
        let accounts = account_store_from_plain(&[("alice", "%", "secret", false)]);
        conn.handshake(&config, &accounts, "10.0.0.1").await.unwrap();
        assert_eq!(conn.state, PgClientState::Ready);

        let request = conn.next_request().await.unwrap().unwrap();
        assert_eq!(request, PgRequest::Query(b"SELECT 1".to_vec()));
    }

    #[tokio::test]
    async fn wrong_password_gets_fatal_error() {
        let mut wire = startup_bytes(&[("user", "alice")]);
        let mut pw = b"nope".to_vec();
        pw.push(0);
        wire.extend(encode_message(PASSWORD_MESSAGE, &pw));

        let mut conn = PgClientConnection::new(Cursor::new(wire), Vec::new(), 1, 2);
        let config = ListenerConfig::default();
        let accounts = account_store_from_plain(&[("alice", "%", "secret", false)]);
        let result = conn.handshake(&config, &accounts, "10.0.0.1").await;
        assert!(result.is_err());
        assert_eq!(conn.state, PgClientState::Closed);
        // the FATAL ErrorResponse with code 28P01 went out
        let out = conn.writer;
        assert!(out.windows(6).any(|w| w == b"C28P01"));
    }

    #[tokio::test]
    async fn terminate_ends_session() {
        let mut wire = startup_bytes(&[("user", "alice")]);
        wire.extend(encode_message(frontend::TERMINATE, &[]));
        let mut conn = PgClientConnection::new(Cursor::new(wire), Vec::new(), 1, 2);
        let config = ListenerConfig {
            skip_authentication: true,
            ..Default::default()
        };
        let accounts = account_store_from_plain(&[]);
        conn.handshake(&config, &accounts, "local").await.unwrap();
        let request = conn.next_request().await.unwrap().unwrap();
        assert_eq!(request, PgRequest::Terminate);
        assert_eq!(conn.state, PgClientState::Closed);
    }
}
