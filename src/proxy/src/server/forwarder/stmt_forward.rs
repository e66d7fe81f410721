//! Prepared-statement specific forwarding: a PREPARE fans out to every
//! backend; each response carries a backend-local id that is recorded in the
//! PS map while the client sees only the proxy-assigned internal id.

use crate::backend::reply::{Reply, ReplyBuilder};
use crate::error::{ProxyError, Result};
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::server::forwarder::relay_packet;
use crate::session::ps_map::PsMap;
use crate::session::BackendId;

use mysql_common::constants::CapabilityFlags;
use tokio::io::{AsyncRead, AsyncWrite};

/// Consume one backend's COM_STMT_PREPARE response. The server-assigned id
/// is recorded as this backend's external id and replaced in the stream by
/// `internal_id`; only the accepted backend's response reaches the client.
pub async fn forward_prepare_reply<R, W>(
    backend_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
    caps: CapabilityFlags,
    internal_id: u32,
    backend: BackendId,
    ps_map: &mut PsMap,
    deliver: bool,
) -> Result<Reply>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut builder = ReplyBuilder::for_prepare(caps, internal_id);
    loop {
        let (seq, mut packet) = match backend_reader.next_async().await? {
            Some(pair) => pair,
            None => {
                return Err(ProxyError::ProtocolViolation(
                    "backend closed mid-prepare-response".to_string(),
                ))
            }
        };
        builder.process(&mut packet);
        if deliver {
            relay_packet(client_writer, seq, &packet).await?;
        }
        if builder.is_complete() {
            break;
        }
    }
    if deliver {
        client_writer.flush_all().await?;
    }

    let reply = builder.reply().clone();
    if reply.is_ok {
        ps_map.store_external(internal_id, backend, reply.server_ps_id);
        ps_map.set_param_count(internal_id, reply.param_count);
    }
    Ok(reply)
}
