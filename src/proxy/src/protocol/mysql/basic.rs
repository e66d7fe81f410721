use hashbrown::HashMap;
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use winnow::binary::{le_u16, le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};
use winnow::Parser;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OkPacket {
    /// header
    pub header: u8,
    /// affected rows in update/insert
    pub affected_rows: u64,
    /// insert_id in update/insert
    pub last_insert_id: u64,
    /// StatusFlags associated with this query
    pub status_flags: StatusFlags,
    /// Warnings
    pub warnings: u16,
    /// Extra information
    pub info: String,
    /// session state change information, raw bytes
    pub session_state_info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacketBody {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

/// One session-state-info entry attached to an OK packet.
/// See: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_ok_packet.html
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTrack {
    SystemVariable { name: String, value: String },
    Schema(String),
    StateChange,
    Gtids(String),
    TransactionCharacteristics(String),
    TransactionState(String),
    Other(u8),
}

/// `HandshakeResponse` represents the client's reply to the initial handshake packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub client_flag: CapabilityFlags,
    pub max_packet_len: u32,
    pub collation: u16,
    pub username: Option<Vec<u8>>,
    pub auth_response: Vec<u8>,
    pub auth_plugin: Vec<u8>,
    pub database: Option<Vec<u8>>,
    pub connect_attributes: Option<HashMap<String, String>>,
}

impl HandshakeResponse {
    pub fn db_user_string(&self) -> String {
        match &self.username {
            Some(username) => String::from_utf8_lossy(username).to_string(),
            None => "_NONE".to_string(),
        }
    }

    pub fn database_string(&self) -> Option<String> {
        self.database
            .as_ref()
            .map(|db| String::from_utf8_lossy(db).to_string())
    }
}

/// The server's initial greeting, parsed on the backend side of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: Vec<u8>,
    pub connection_id: u32,
    pub scramble: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub default_collation: u8,
    pub status_flags: StatusFlags,
    pub auth_plugin: Vec<u8>,
}

fn read_length_encoded_string(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = read_length_encoded_number(i)?;
    take(len).parse_peek(input)
}

pub fn eof_server_status(i: &[u8]) -> IResult<&[u8], StatusFlags> {
    let status_flag_slice = &i[3..i.len()];
    let (i, status_flags_code) = le_u16.parse_peek(status_flag_slice)?;
    Ok((i, StatusFlags::from_bits_truncate(status_flags_code)))
}

pub fn read_length_encoded_number(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, b) = le_u8.parse_peek(i)?;
    let r_size: usize = match b {
        0xfb => return Ok((i, 0)),
        0xfc => 2,
        0xfd => 3,
        0xfe => 8,
        _ => return Ok((i, b as u64)),
    };
    let mut bytes = [0u8; 8];
    let (i, b) = take(r_size).parse_peek(i)?;
    bytes[..r_size].copy_from_slice(b);
    Ok((i, u64::from_le_bytes(bytes)))
}

pub fn ok_packet(i: &[u8], capabilities: CapabilityFlags) -> IResult<&[u8], OkPacket> {
    let (i, header) = le_u8.parse_peek(i)?;
    let (i, affected_rows) = read_length_encoded_number(i)?;
    let (i, last_insert_id) = read_length_encoded_number(i)?;
    let (i, status_flags_value) = le_u16.parse_peek(i)?;

    let status_flags = StatusFlags::from_bits_retain(status_flags_value);
    let (i, warnings) = le_u16.parse_peek(i)?;
    let (info, session_state_info) =
        if !i.is_empty() && capabilities.contains(CapabilityFlags::CLIENT_SESSION_TRACK) {
            let (i, info_size) = read_length_encoded_number(i)?;
            let (i, info) = take(info_size).parse_peek(i)?;

            let session_state_info =
                if status_flags.contains(StatusFlags::SERVER_SESSION_STATE_CHANGED) {
                    let (i, s_t_size) = read_length_encoded_number(i)?;
                    let (_i, session_state_info) = take(s_t_size).parse_peek(i)?;
                    session_state_info
                } else {
                    &[][..]
                };
            (
                std::str::from_utf8(info).unwrap_or("").to_string(),
                session_state_info.to_vec(),
            )
        } else {
            ("".to_string(), Vec::new())
        };

    Ok((
        i,
        OkPacket {
            header,
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
            session_state_info,
        },
    ))
}

/// ERR packet body: 0xff, code, '#', sqlstate(5), message.
pub fn err_packet(i: &[u8]) -> IResult<&[u8], ErrPacketBody> {
    let (i, _) = literal([0xff_u8]).parse_peek(i)?;
    let (i, code) = le_u16.parse_peek(i)?;
    let (i, sqlstate) = if i.first() == Some(&b'#') {
        let (i, _) = take(1u8).parse_peek(i)?;
        let (i, sqlstate) = take(5u8).parse_peek(i)?;
        (i, std::str::from_utf8(sqlstate).unwrap_or("HY000"))
    } else {
        (i, "HY000")
    };
    Ok((
        &[][..],
        ErrPacketBody {
            code,
            sqlstate: sqlstate.to_string(),
            message: String::from_utf8_lossy(i).to_string(),
        },
    ))
}

const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0x00;
const SESSION_TRACK_SCHEMA: u8 = 0x01;
const SESSION_TRACK_STATE_CHANGE: u8 = 0x02;
const SESSION_TRACK_GTIDS: u8 = 0x03;
const SESSION_TRACK_TRANSACTION_CHARACTERISTICS: u8 = 0x04;
const SESSION_TRACK_TRANSACTION_STATE: u8 = 0x05;

fn lenenc_utf8(i: &[u8]) -> IResult<&[u8], String> {
    let (i, raw) = read_length_encoded_string(i)?;
    Ok((i, String::from_utf8_lossy(raw).to_string()))
}

/// Parse the session-state-info block of an OK packet into typed entries.
pub fn parse_session_track(mut i: &[u8]) -> Vec<SessionTrack> {
    let mut entries = Vec::new();
    while !i.is_empty() {
        let Ok((rest, entry_type)) = le_u8::<_, winnow::error::InputError<&[u8]>>.parse_peek(i) else {
            break;
        };
        let Ok((rest, data)) = read_length_encoded_string(rest) else {
            break;
        };
        i = rest;
        let entry = match entry_type {
            SESSION_TRACK_SYSTEM_VARIABLES => {
                let Ok((data, name)) = lenenc_utf8(data) else {
                    continue;
                };
                let Ok((_, value)) = lenenc_utf8(data) else {
                    continue;
                };
                SessionTrack::SystemVariable { name, value }
            }
            SESSION_TRACK_SCHEMA => match lenenc_utf8(data) {
                Ok((_, schema)) => SessionTrack::Schema(schema),
                Err(_) => continue,
            },
            SESSION_TRACK_STATE_CHANGE => SessionTrack::StateChange,
            SESSION_TRACK_GTIDS => {
                // one byte of encoding spec precedes the gtid string
                let Ok((data, _spec)) = le_u8::<_, winnow::error::InputError<&[u8]>>.parse_peek(data) else {
                    continue;
                };
                match lenenc_utf8(data) {
                    Ok((_, gtid)) => SessionTrack::Gtids(gtid),
                    Err(_) => continue,
                }
            }
            SESSION_TRACK_TRANSACTION_CHARACTERISTICS => match lenenc_utf8(data) {
                Ok((_, chars)) => SessionTrack::TransactionCharacteristics(chars),
                Err(_) => continue,
            },
            SESSION_TRACK_TRANSACTION_STATE => match lenenc_utf8(data) {
                Ok((_, state)) => SessionTrack::TransactionState(state),
                Err(_) => continue,
            },
            other => SessionTrack::Other(other),
        };
        entries.push(entry);
    }
    entries
}

pub fn client_handshake_response(
    i: &[u8],
    is_after_tls: bool,
) -> IResult<&[u8], HandshakeResponse> {
    let (i, capability_flags) = le_u16.parse_peek(i)?;
    let mut capabilities = CapabilityFlags::from_bits_truncate(capability_flags as u32);
    if capabilities.contains(CapabilityFlags::CLIENT_PROTOCOL_41) {
        // HandshakeResponse41
        let (i, cap2) = le_u16.parse_peek(i)?;
        let cap = (cap2 as u32) << 16 | capability_flags as u32;

        capabilities = CapabilityFlags::from_bits_truncate(cap);

        let (i, max_packet_len) = le_u32.parse_peek(i)?;
        let (i, collation) = take(1u8).parse_peek(i)?;

        let (i, _) = take(23u8).parse_peek(i)?;

        if !is_after_tls && capabilities.contains(CapabilityFlags::CLIENT_SSL) {
            // Truncated SSLRequest; the full response follows after the TLS upgrade.
            return Ok((
                i,
                HandshakeResponse {
                    client_flag: capabilities,
                    max_packet_len,
                    collation: u16::from(collation[0]),
                    username: None,
                    auth_response: vec![],
                    auth_plugin: vec![],
                    database: None,
                    connect_attributes: None,
                },
            ));
        }

        let (i, username) = {
            let (i, user) = take_until(1.., "\0").parse_peek(i)?;
            let (i, _) = literal(b"\0").parse_peek(i)?;
            (i, Some(user.to_owned()))
        };
        let (i, auth_response) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
                let (i, size) = read_length_encoded_number(i)?;
                take(size).parse_peek(i)?
            } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
                let (i, size) = le_u8.parse_peek(i)?;
                take(size).parse_peek(i)?
            } else {
                take_until(1.., "\0").parse_peek(i)?
            };

        let (i, db) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty() {
                let (i, db) = take_until(1.., "\0").parse_peek(i)?;
                let (i, _) = literal(b"\0").parse_peek(i)?;
                (i, Some(db))
            } else {
                (i, None)
            };

        let (i, auth_plugin) =
            if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
                let (i, auth_plugin) = take_until(1.., "\0").parse_peek(i)?;

                let (i, _) = literal("\0").parse_peek(i)?;
                (i, auth_plugin)
            } else {
                (i, &b""[..])
            };

        let (i, connect_attributes) =
            if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_ATTRS) && !i.is_empty() {
                let (i, data_len) = read_length_encoded_number(i)?;
                let (i, data) = take(data_len).parse_peek(i)?;
                let mut input = data;
                let mut connect_attributes = HashMap::new();
                while !input.is_empty() {
                    let (remaining, k) = read_length_encoded_string(input)?;
                    // Parse value
                    let (remaining, v) = read_length_encoded_string(remaining)?;
                    let conn_attr_key = String::from_utf8_lossy(k).to_string();
                    let conn_attr_val = String::from_utf8_lossy(v).to_string();
                    connect_attributes.insert(conn_attr_key, conn_attr_val);
                    input = remaining;
                }
                (i, Some(connect_attributes))
            } else {
                (i, None)
            };

        Ok((
            i,
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: u16::from(collation[0]),
                username,
                auth_response: auth_response.to_vec(),
                auth_plugin: auth_plugin.to_vec(),
                database: db.map(|c| c.to_vec()),
                connect_attributes,
            },
        ))
    } else {
        // HandshakeResponse320
        let (i, max_packet_len_v1) = le_u16.parse_peek(i)?;
        let (i, max_packet_len_v2) = le_u8.parse_peek(i)?;
        let max_packet_len = (max_packet_len_v2 as u32) << 16 | max_packet_len_v1 as u32;
        let (i, username) = take_until(1.., "\0").parse_peek(i)?;
        let (i, _) = literal(b"\0").parse_peek(i)?;

        Ok((
            &[][..],
            HandshakeResponse {
                client_flag: capabilities,
                max_packet_len,
                collation: 0,
                username: Some(username.to_vec()),
                auth_response: i.to_vec(),
                auth_plugin: vec![],
                database: None,
                connect_attributes: None,
            },
        ))
    }
}

/// Parse the server's initial handshake, needed on the backend side to pick
/// up the scramble and capability bits before replying.
/// See: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_v10.html
pub fn initial_handshake(i: &[u8]) -> IResult<&[u8], InitialHandshake> {
    let (i, protocol_version) = le_u8.parse_peek(i)?;
    let (i, server_version) = take_until(1.., "\0").parse_peek(i)?;
    let (i, _) = literal(b"\0").parse_peek(i)?;
    let (i, connection_id) = le_u32.parse_peek(i)?;
    let (i, scramble_1) = take(8u8).parse_peek(i)?;
    let (i, _filler) = take(1u8).parse_peek(i)?;
    let (i, caps_lower) = le_u16.parse_peek(i)?;
    let (i, default_collation) = le_u8.parse_peek(i)?;
    let (i, status) = le_u16.parse_peek(i)?;
    let (i, caps_upper) = le_u16.parse_peek(i)?;
    let (i, scramble_len) = le_u8.parse_peek(i)?;
    let (i, _reserved) = take(10u8).parse_peek(i)?;

    let capabilities =
        CapabilityFlags::from_bits_truncate((caps_upper as u32) << 16 | caps_lower as u32);

    let mut scramble = scramble_1.to_vec();
    let (i, auth_plugin) = if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let part2_len = std::cmp::max(13, scramble_len.saturating_sub(8)) as usize;
        let (i, scramble_2) = take(part2_len).parse_peek(i)?;
        // trailing NUL terminator is not part of the scramble
        let trimmed = scramble_2.strip_suffix(&[0]).unwrap_or(scramble_2);
        scramble.extend_from_slice(trimmed);
        if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) && !i.is_empty() {
            let (i, plugin) = take_until(0.., "\0").parse_peek(i)?;
            (i, plugin.to_vec())
        } else {
            (i, Vec::new())
        }
    } else {
        (i, Vec::new())
    };

    Ok((
        i,
        InitialHandshake {
            protocol_version,
            server_version: server_version.to_vec(),
            connection_id,
            scramble,
            capabilities,
            default_collation,
            status_flags: StatusFlags::from_bits_truncate(status),
            auth_plugin,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::charset::collation_names;
    use crate::protocol::mysql::packet::packet_reader::PacketReader;
    use std::io::Cursor;

    #[test]
    pub fn test_handshake_parse() {
        let bytes = &[
            0x5b, 0x00, 0x00, 0x01, 0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c,
            0x74, 0x00, 0x14, 0xf7, 0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d,
            0x18, 0xc7, 0xa4, 0xe8, 0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75,
            0x6c, 0x74, 0x00, 0x6d, 0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76,
            0x65, 0x5f, 0x70, 0x61, 0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let cursor = Cursor::new(&bytes[..]);
        let mut packet_reader = PacketReader::new(cursor);
        let (_, packet) = packet_reader.next_read().unwrap().unwrap();

        let handshake_rs = client_handshake_response(&packet, false);
        assert!(handshake_rs.is_ok());
        let handshake = handshake_rs.unwrap().1;
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_LONG_PASSWORD));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_MULTI_RESULTS));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(handshake
            .client_flag
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(
            handshake.collation,
            *collation_names().get("utf8_general_ci").unwrap() as u16
        );
        assert_eq!(handshake.username.unwrap(), &b"default"[..]);
        assert_eq!(handshake.max_packet_len, 16777216);
        assert_eq!(handshake.auth_plugin, b"mysql_native_password");
    }

    #[test]
    pub fn test_ok_packet_with_session_track_gtid() {
        // OK, 0 rows, SERVER_SESSION_STATE_CHANGED, info "", one GTID entry "0-1-42"
        let mut bytes: Vec<u8> = vec![0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00];
        bytes.push(0); // info len
        let gtid = b"0-1-42";
        let entry_data_len = 1 + 1 + gtid.len(); // spec byte + lenenc + payload
        bytes.push((1 + 1 + entry_data_len) as u8); // total session track len
        bytes.push(0x03); // SESSION_TRACK_GTIDS
        bytes.push(entry_data_len as u8);
        bytes.push(0x00); // encoding spec
        bytes.push(gtid.len() as u8);
        bytes.extend_from_slice(gtid);

        let (_, ok) = ok_packet(
            &bytes,
            CapabilityFlags::CLIENT_SESSION_TRACK | CapabilityFlags::CLIENT_PROTOCOL_41,
        )
        .unwrap();
        assert!(ok
            .status_flags
            .contains(StatusFlags::SERVER_SESSION_STATE_CHANGED));
        let tracked = parse_session_track(&ok.session_state_info);
        assert_eq!(tracked, vec![SessionTrack::Gtids("0-1-42".to_string())]);
    }

    #[test]
    pub fn test_err_packet_parse() {
        let mut bytes: Vec<u8> = vec![0xff];
        bytes.extend_from_slice(&1045_u16.to_le_bytes());
        bytes.push(b'#');
        bytes.extend_from_slice(b"28000");
        bytes.extend_from_slice(b"Access denied");
        let (_, err) = err_packet(&bytes).unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sqlstate, "28000");
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    pub fn test_initial_handshake_parse() {
        let mut bytes: Vec<u8> = vec![10];
        bytes.extend_from_slice(b"11.1.2-MariaDB\0");
        bytes.extend_from_slice(&8_u32.to_le_bytes());
        bytes.extend_from_slice(&[0x31; 8]); // scramble part 1
        bytes.push(0);
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;
        let caps_bytes = caps.bits().to_le_bytes();
        bytes.extend_from_slice(&caps_bytes[..2]);
        bytes.push(33); // collation
        bytes.extend_from_slice(&2_u16.to_le_bytes()); // autocommit status
        bytes.extend_from_slice(&caps_bytes[2..4]);
        bytes.push(21); // scramble len
        bytes.extend_from_slice(&[0; 10]);
        bytes.extend_from_slice(&[0x32; 12]); // scramble part 2
        bytes.push(0);
        bytes.extend_from_slice(b"mysql_native_password\0");

        let (_, greeting) = initial_handshake(&bytes).unwrap();
        assert_eq!(greeting.protocol_version, 10);
        assert_eq!(greeting.server_version, b"11.1.2-MariaDB");
        assert_eq!(greeting.connection_id, 8);
        assert_eq!(greeting.scramble.len(), 20);
        assert!(greeting
            .capabilities
            .contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert_eq!(greeting.auth_plugin, b"mysql_native_password");
    }
}
