//! Streams one command's response from a backend to the client, feeding each
//! packet through the reply builder and, when a causal read is in flight,
//! through the wait-GTID unwrapping (OK stripped, sequences corrected).

use crate::backend::reply::{Reply, ReplyBuilder, ReplyState};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::router::causal_reads::{CausalAction, CausalReadCoordinator, WaitGtidState};
use crate::server::forwarder::relay_packet;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Why the reply stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Response fully delivered (or fully consumed when not delivering).
    Delivered,
    /// The causal-read wait timed out; retry the stashed query on the primary.
    CausalRetry,
    /// The causal-read wait timed out inside a read-only transaction.
    CausalSyntheticError,
}

/// Read a complete response from `backend_reader`, forwarding packets to the
/// client as they arrive. With `deliver` false the response is consumed and
/// verified only (late responses of fanned-out session commands). Returns
/// the final `Reply` and the outcome.
#[allow(clippy::too_many_arguments)]
pub async fn forward_reply<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    builder: &mut ReplyBuilder,
    deliver: bool,
    mut causal: Option<&mut CausalReadCoordinator>,
    in_read_only_trx: bool,
) -> Result<(Reply, ReplyOutcome)>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let (seq, mut packet) = match backend_reader.next_async().await? {
            Some(pair) => pair,
            None => {
                return Err(ProxyError::ProtocolViolation(
                    "backend closed mid-response".to_string(),
                ))
            }
        };

        let causal_active = causal
            .as_ref()
            .map(|c| {
                matches!(
                    c.state(),
                    WaitGtidState::WaitingForHeader | WaitGtidState::UpdatingPackets
                )
            })
            .unwrap_or(false);

        if causal_active {
            let coordinator = causal.as_mut().unwrap();
            match coordinator.on_reply_packet(&packet, in_read_only_trx) {
                CausalAction::Discard => {
                    debug!("Discarding MASTER_GTID_WAIT result");
                    continue;
                }
                CausalAction::RetryOnMaster => {
                    return Ok((builder.reply().clone(), ReplyOutcome::CausalRetry));
                }
                CausalAction::SyntheticError => {
                    return Ok((builder.reply().clone(), ReplyOutcome::CausalSyntheticError));
                }
                CausalAction::Forward(corrected_seq) => {
                    let state = builder.process(&mut packet);
                    if deliver {
                        relay_packet(client_writer, corrected_seq, &packet).await?;
                    }
                    if state == ReplyState::Done {
                        coordinator.reply_complete();
                        if deliver {
                            client_writer.flush_all().await?;
                        }
                        return Ok((builder.reply().clone(), ReplyOutcome::Delivered));
                    }
                    continue;
                }
            }
        }

        let state = builder.process(&mut packet);
        if deliver {
            relay_packet(client_writer, seq, &packet).await?;
        }
        match state {
            ReplyState::Done => {
                if deliver {
                    client_writer.flush_all().await?;
                }
                return Ok((builder.reply().clone(), ReplyOutcome::Delivered));
            }
            ReplyState::LoadData => {
                // hand control back: the client must now stream the file
                if deliver {
                    client_writer.flush_all().await?;
                }
                return Ok((builder.reply().clone(), ReplyOutcome::Delivered));
            }
            _ => {}
        }
    }
}
