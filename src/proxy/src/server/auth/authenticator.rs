//! Client-facing authentication. The proxy sends the greeting, reads the
//! HandshakeResponse, switches the client to the account's plugin when they
//! disagree, and verifies the response against the cached account entry.

use crate::async_packet_read;
use crate::config::ListenerConfig;
use crate::protocol::mysql::auth_plugin::{gen_scramble, verify_native_password};
use crate::protocol::mysql::basic::{client_handshake_response, HandshakeResponse};
use crate::protocol::mysql::constants::AuthPluginName;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::{writers, Packet};
use crate::server::auth::UserAccountStore;
use crate::server::DEFAULT_SERVER_VERSION;

use async_trait::async_trait;
use mysql_common::constants::StatusFlags;
use std::io::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Send the greeting and read the client's handshake response.
    async fn initial_handshake<R, W>(
        &self,
        conn_id: u64,
        scramble: [u8; 20],
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(u8, HandshakeResponse, Packet), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin;

    /// Verify the client's credentials, running auth-switch round trips as
    /// needed, and send the final OK or ERR.
    async fn verify<R, W>(
        &self,
        store: &UserAccountStore,
        config: &ListenerConfig,
        client_host: &str,
        scramble: [u8; 20],
        handshake: &mut HandshakeResponse,
        seq: u8,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin;
}

pub struct ProxyAuthenticator;

impl ProxyAuthenticator {
    async fn reject<W>(
        &self,
        client_writer: &mut PacketWriter<W>,
        message: String,
    ) -> Result<(), Error>
    where
        W: AsyncWrite + Send + Unpin,
    {
        writers::write_err_packet(
            ErrorKind::ER_ACCESS_DENIED_ERROR,
            message.as_bytes(),
            client_writer,
        )
        .await?;
        client_writer.flush_all().await?;
        Err(Error::new(std::io::ErrorKind::PermissionDenied, message))
    }
}

#[async_trait]
impl Authenticator for ProxyAuthenticator {
    async fn initial_handshake<R, W>(
        &self,
        conn_id: u64,
        scramble: [u8; 20],
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(u8, HandshakeResponse, Packet), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        writers::write_initial_handshake(
            client_writer,
            conn_id,
            scramble,
            DEFAULT_SERVER_VERSION,
            false,
        )
        .await?;

        if let Some((seq, handshake_pkt)) = client_reader.next_async().await? {
            let (_, handshake_resp) = client_handshake_response(&handshake_pkt, false)
                .map_err(|e| {
                    Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("malformed handshake response: {e:?}"),
                    )
                })?;
            Ok((seq, handshake_resp, handshake_pkt))
        } else {
            warn!("ProxySrv Failed to read client HandshakeResponse");
            writers::write_err_packet(
                ErrorKind::ER_ACCESS_DENIED_ERROR,
                "peer terminated connection".as_bytes(),
                client_writer,
            )
            .await?;
            Err(Error::new(
                std::io::ErrorKind::PermissionDenied,
                "peer terminated connection",
            ))
        }
    }

    async fn verify<R, W>(
        &self,
        store: &UserAccountStore,
        config: &ListenerConfig,
        client_host: &str,
        scramble: [u8; 20],
        handshake: &mut HandshakeResponse,
        seq: u8,
        client_reader: &mut PacketReader<R>,
        client_writer: &mut PacketWriter<W>,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin,
    {
        let user = handshake.db_user_string();
        client_writer.set_seq(seq.wrapping_add(1));

        if config.skip_authentication {
            debug!("ProxySrv skip_authentication is on, accepting {user}");
            writers::write_ok_packet(
                client_writer,
                0,
                0,
                StatusFlags::SERVER_STATUS_AUTOCOMMIT,
            )
            .await?;
            client_writer.flush_all().await?;
            return Ok(());
        }

        let Some(account) = store.find(&user, client_host) else {
            // maybe the cached account data is stale
            store.request_refresh();
            return self
                .reject(
                    client_writer,
                    format!("Access denied for user '{user}'@'{client_host}'"),
                )
                .await;
        };

        if config.match_host && !account.host_matches(client_host) {
            return self
                .reject(
                    client_writer,
                    format!("Host '{client_host}' is not allowed for user '{user}'"),
                )
                .await;
        }

        let account_plugin = account.plugin;
        let mut auth_response = handshake.auth_response.clone();
        let mut active_scramble = scramble.to_vec();

        // The client declared a different plugin: switch it to the account's
        // plugin with a fresh scramble and restart the exchange.
        let client_plugin = AuthPluginName::from_bytes(&handshake.auth_plugin);
        if client_plugin != account_plugin {
            debug!(
                "ProxySrv auth switch: client offered {:?}, account uses {:?}",
                client_plugin.as_ref(),
                account_plugin.as_ref()
            );
            let fresh = gen_scramble();
            writers::write_auth_switch_request(
                client_writer,
                account_plugin.as_ref(),
                &fresh,
            )
            .await?;
            let (switch_seq, switch_response) = async_packet_read!(client_reader);
            client_writer.set_seq(switch_seq.wrapping_add(1));
            auth_response = switch_response.to_vec();
            active_scramble = fresh.to_vec();
        }

        let verified = match account_plugin {
            AuthPluginName::AuthNativePassword => {
                let mut stored = [0u8; 20];
                if account.stored_hash.len() == 20 {
                    stored.copy_from_slice(&account.stored_hash);
                    verify_native_password(&stored, &active_scramble, &auth_response)
                } else {
                    // passwordless account: only an empty response passes
                    auth_response.is_empty()
                }
            }
            AuthPluginName::AuthClearPassword => {
                let cleartext = auth_response.strip_suffix(&[0]).unwrap_or(&auth_response);
                crate::protocol::mysql::auth_plugin::stored_hash(
                    AuthPluginName::AuthNativePassword,
                    cleartext,
                ) == account.stored_hash
            }
            _ => false,
        };

        if !verified {
            if config.log_password_mismatch {
                warn!(
                    "ProxySrv password mismatch for '{user}'@'{client_host}': \
                     client token {}, scramble {}",
                    hex::encode(&auth_response),
                    hex::encode(&active_scramble)
                );
            }
            // the cached hash may be stale; ask for a refresh (rate limited)
            store.request_refresh();
            return self
                .reject(
                    client_writer,
                    format!("Access denied for user '{user}'@'{client_host}' (using password: YES)"),
                )
                .await;
        }

        writers::write_ok_packet(client_writer, 0, 0, StatusFlags::SERVER_STATUS_AUTOCOMMIT)
            .await?;
        client_writer.flush_all().await?;
        debug!("ProxySrv authentication success for {user}");
        Ok(())
    }
}
