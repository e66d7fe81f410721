pub mod query_forward;
pub mod stmt_forward;

use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::Packet;
use std::io::Write;
use tokio::io::AsyncWrite;

/// Write one backend packet to the client under the given sequence number.
pub async fn relay_packet<W>(
    client_writer: &mut PacketWriter<W>,
    seq: u8,
    packet: &Packet,
) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    client_writer.set_seq(seq);
    client_writer.write_all(packet)?;
    client_writer.end_packet().await
}
