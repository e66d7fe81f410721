use crate::protocol::mysql::charset::DEFAULT_COLLATION_ID;
use crate::protocol::mysql::constants::AuthPluginName::AuthNativePassword;
use crate::protocol::mysql::constants::{CommandCode, AUTH_PLUGIN_DATA_PART_1_LENGTH};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;

use crate::server::default_capabilities;
use byteorder::{LittleEndian, WriteBytesExt};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use mysql_common::io::WriteMysqlExt;
use std::io::{self, Write};
use std::net::SocketAddr;
use tokio::io::AsyncWrite;

pub async fn write_err_packet<W: AsyncWrite + Unpin>(
    err: ErrorKind,
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(err as u16)?;
    w.write_u8(b'#')?;
    w.write_all(err.sqlstate())?;
    w.write_all(msg)?;
    w.end_packet().await
}

/// Synthetic ERR with an explicit code/sqlstate, used for client-synthetic
/// failures such as a causal-read timeout inside a read-only transaction.
pub async fn write_err_packet_raw<W: AsyncWrite + Unpin>(
    code: u16,
    sqlstate: &[u8],
    msg: &[u8],
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.write_u8(0xff)?;
    w.write_u16::<LittleEndian>(code)?;
    w.write_u8(b'#')?;
    w.write_all(sqlstate)?;
    w.write_all(msg)?;
    w.end_packet().await
}

pub async fn write_ok_packet<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    rows: u64,
    last_insert_id: u64,
    s: StatusFlags,
) -> io::Result<()> {
    w.write_u8(0x00)?; // OK packet type
    w.write_lenenc_int(rows)?;
    w.write_lenenc_int(last_insert_id)?;
    w.write_u16::<LittleEndian>(s.bits())?;
    w.write_all(&[0x00, 0x00])?; // no warnings
    w.end_packet().await
}

pub async fn write_initial_handshake<W: AsyncWrite + Unpin>(
    writer: &mut PacketWriter<W>,
    conn_id: u64,
    scramble: [u8; 20],
    server_version: &[u8],
    with_tls: bool,
) -> io::Result<()> {
    writer.write_all(&[10])?; // protocol 10

    writer.write_all(server_version)?;
    writer.write_all(&[0x00])?;
    // connection_id (4 bytes)
    let conn_id_bytes = &[
        conn_id as u8,
        (conn_id >> 8) as u8,
        (conn_id >> 16) as u8,
        (conn_id >> 24) as u8,
    ];
    writer.write_all(conn_id_bytes)?;
    let mut server_capabilities = default_capabilities();
    if with_tls {
        server_capabilities |= CapabilityFlags::CLIENT_SSL;
    }
    let server_capabilities_vec = server_capabilities.bits().to_le_bytes();

    writer.write_all(&scramble[0..AUTH_PLUGIN_DATA_PART_1_LENGTH])?; // auth-plugin-data-part-1
    writer.write_all(&[0x00])?;

    writer.write_all(&server_capabilities_vec[..2])?; // The lower 2 bytes of the Capabilities Flags

    writer.write_all(&DEFAULT_COLLATION_ID.to_le_bytes())?;
    writer.write_all(&StatusFlags::SERVER_STATUS_AUTOCOMMIT.bits().to_le_bytes())?; // status_flags
    writer.write_all(&server_capabilities_vec[2..4])?; // The upper 2 bytes of the Capabilities Flags

    writer.write_all(&((scramble.len() + 1) as u8).to_le_bytes())?;

    writer.write_all(&[0x00; 10][..])?; // 10 bytes filler
                                        // Part2 of the auth_plugin_data
                                        // $len=MAX(13, length of auth-plugin-data - 8)
    writer.write_all(&scramble[AUTH_PLUGIN_DATA_PART_1_LENGTH..])?; // 12 bytes
    writer.write_all(&[0x00])?;

    // Plugin name
    writer.write_all(AuthNativePassword.as_ref().as_bytes())?;
    writer.write_all(&[0x00])?;
    writer.end_packet().await?;
    writer.flush_all().await
}

/// AuthSwitchRequest: ask the client to redo the exchange with `plugin` and a
/// fresh scramble.
pub async fn write_auth_switch_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    plugin: &str,
    scramble: &[u8],
) -> io::Result<()> {
    w.write_u8(0xfe)?;
    w.write_all(plugin.as_bytes())?;
    w.write_u8(0x00)?;
    w.write_all(scramble)?;
    w.write_u8(0x00)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_query_request<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
    data: &[u8],
) -> io::Result<()> {
    let query_com = CommandCode::ComQuery as u8;
    w.write_u8(query_com)?;
    w.write_all(data)?;
    w.end_packet().await
}

pub async fn write_com_ping<W: AsyncWrite + Unpin>(w: &mut PacketWriter<W>) -> io::Result<()> {
    w.reset_seq();
    w.write_u8(CommandCode::ComPing as u8)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_com_quit<W: AsyncWrite + Unpin>(w: &mut PacketWriter<W>) -> io::Result<()> {
    w.reset_seq();
    w.write_u8(CommandCode::ComQuit as u8)?;
    w.end_packet().await?;
    w.flush_all().await
}

pub async fn write_reset_connection<W: AsyncWrite + Unpin>(
    w: &mut PacketWriter<W>,
) -> io::Result<()> {
    w.reset_seq();
    w.write_u8(CommandCode::ComResetConnection as u8)?;
    w.end_packet().await?;
    w.flush_all().await
}

/// PROXY protocol v1 line carrying the client's remote address, written as the
/// very first bytes on a backend socket when proxy_protocol is enabled.
/// See: https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt
pub fn proxy_protocol_v1_header(client: &SocketAddr, server: &SocketAddr) -> String {
    match (client, server) {
        (SocketAddr::V4(c), SocketAddr::V4(s)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            c.ip(),
            s.ip(),
            c.port(),
            s.port()
        ),
        (SocketAddr::V6(c), SocketAddr::V6(s)) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            c.ip(),
            s.ip(),
            c.port(),
            s.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}
