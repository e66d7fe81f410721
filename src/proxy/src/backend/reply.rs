//! Streaming reply accumulator. Consumes one backend packet at a time and
//! tracks the shape of the response: OK/ERR, resultsets with and without
//! DEPRECATE_EOF, LOAD DATA LOCAL, and COM_STMT_PREPARE responses whose
//! server-assigned id is substituted with the proxy's internal id in place.

use crate::protocol::mysql::basic::{
    err_packet, ok_packet, parse_session_track, read_length_encoded_number, SessionTrack,
};
use crate::protocol::mysql::constants::CommandCode;
use crate::protocol::mysql::packet::Packet;
use crate::session::ps_map::substitute_prepare_response_id;
use byteorder::{ByteOrder, LittleEndian};
use mysql_common::constants::{CapabilityFlags, StatusFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyState {
    #[default]
    Start,
    RsetColdef,
    RsetColdefEof,
    RsetRows,
    LoadData,
    LoadDataEnd,
    Prepare,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

/// Everything the core needs to know about one response.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub command: Option<CommandCode>,
    pub state: ReplyState,
    pub is_ok: bool,
    pub error: Option<ReplyError>,
    pub resultsets: u32,
    pub field_counts: Vec<u64>,
    pub rows_read: u64,
    pub bytes: u64,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    /// Proxy-internal id substituted into a COM_STMT_PREPARE response.
    pub generated_id: u32,
    /// Id the server originally assigned in the PREPARE response.
    pub server_ps_id: u32,
    pub param_count: u16,
    pub server_status: StatusFlags,
    /// Parsed session-tracking entries from the final OK.
    pub tracked: Vec<SessionTrack>,
}

impl Reply {
    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Done
    }

    pub fn last_gtid(&self) -> Option<&str> {
        self.tracked.iter().find_map(|t| match t {
            SessionTrack::Gtids(gtid) => Some(gtid.as_str()),
            _ => None,
        })
    }

    pub fn trx_state(&self) -> Option<&str> {
        self.tracked.iter().find_map(|t| match t {
            SessionTrack::TransactionState(state) => Some(state.as_str()),
            _ => None,
        })
    }

    pub fn system_variable(&self, name: &str) -> Option<&str> {
        self.tracked.iter().find_map(|t| match t {
            SessionTrack::SystemVariable { name: n, value } if n == name => {
                Some(value.as_str())
            }
            _ => None,
        })
    }
}

pub struct ReplyBuilder {
    caps: CapabilityFlags,
    command: CommandCode,
    reply: Reply,
    /// Internal id to substitute into a PREPARE response.
    internal_ps_id: u32,
    /// Column definitions still expected in the current block.
    pending_coldefs: u64,
}

impl ReplyBuilder {
    pub fn new(command: CommandCode, caps: CapabilityFlags) -> Self {
        Self {
            caps,
            command,
            reply: Reply {
                command: Some(command),
                ..Default::default()
            },
            internal_ps_id: 0,
            pending_coldefs: 0,
        }
    }

    /// Builder for a COM_STMT_PREPARE whose response id must be replaced by
    /// `internal_id`.
    pub fn for_prepare(caps: CapabilityFlags, internal_id: u32) -> Self {
        let mut builder = Self::new(CommandCode::ComStmtPrepare, caps);
        builder.internal_ps_id = internal_id;
        builder
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn state(&self) -> ReplyState {
        self.reply.state
    }

    pub fn is_complete(&self) -> bool {
        self.reply.state == ReplyState::Done
    }

    fn deprecate_eof(&self) -> bool {
        self.caps.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    }

    fn finish_or_next_resultset(&mut self, status: StatusFlags) {
        self.reply.server_status = status;
        if status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            self.reply.state = ReplyState::Start;
        } else {
            self.reply.state = ReplyState::Done;
        }
    }

    fn consume_ok(&mut self, packet: &Packet) {
        if let Ok((_, ok)) = ok_packet(packet, self.caps) {
            self.reply.is_ok = true;
            self.reply.affected_rows = ok.affected_rows;
            self.reply.last_insert_id = ok.last_insert_id;
            self.reply.warnings = ok.warnings;
            if !ok.session_state_info.is_empty() {
                self.reply
                    .tracked
                    .extend(parse_session_track(&ok.session_state_info));
            }
            self.finish_or_next_resultset(ok.status_flags);
        } else {
            self.reply.state = ReplyState::Done;
        }
    }

    fn consume_err(&mut self, packet: &Packet) {
        if let Ok((_, err)) = err_packet(packet) {
            self.reply.error = Some(ReplyError {
                code: err.code,
                sqlstate: err.sqlstate,
                message: err.message,
            });
        }
        self.reply.is_ok = false;
        self.reply.state = ReplyState::Done;
    }

    /// Feed one packet of the response. The packet may be mutated (PREPARE id
    /// substitution). Returns the state after the packet.
    pub fn process(&mut self, packet: &mut Packet) -> ReplyState {
        self.reply.bytes += packet.len() as u64;
        match self.reply.state {
            ReplyState::Start => self.on_start(packet),
            ReplyState::Prepare => self.on_prepare_block(packet),
            ReplyState::RsetColdef => {
                self.pending_coldefs = self.pending_coldefs.saturating_sub(1);
                if self.pending_coldefs == 0 {
                    self.reply.state = if self.deprecate_eof() {
                        ReplyState::RsetRows
                    } else {
                        ReplyState::RsetColdefEof
                    };
                }
            }
            ReplyState::RsetColdefEof => {
                // the EOF closing the column definitions
                self.reply.state = ReplyState::RsetRows;
            }
            ReplyState::RsetRows => self.on_row_packet(packet),
            ReplyState::LoadData => {
                // the server's OK/ERR after the data stream ends
                if packet.is_err_packet() {
                    self.consume_err(packet);
                } else {
                    self.reply.state = ReplyState::LoadDataEnd;
                    self.consume_ok(packet);
                }
            }
            ReplyState::LoadDataEnd | ReplyState::Done => {}
        }
        self.reply.state
    }

    fn on_start(&mut self, packet: &mut Packet) {
        if self.command == CommandCode::ComStmtPrepare && !packet.is_err_packet() {
            self.on_prepare_header(packet);
            return;
        }
        if packet.is_ok_packet() {
            self.consume_ok(packet);
        } else if packet.is_err_packet() {
            self.consume_err(packet);
        } else if packet.is_local_in_file_packet() {
            self.reply.state = ReplyState::LoadData;
        } else {
            // resultset header: column count
            let count = read_length_encoded_number(packet)
                .map(|(_, n)| n)
                .unwrap_or(0);
            self.reply.resultsets += 1;
            self.reply.field_counts.push(count);
            self.pending_coldefs = count;
            self.reply.state = if count == 0 {
                // metadata caching can skip the definitions entirely
                ReplyState::RsetRows
            } else {
                ReplyState::RsetColdef
            };
        }
    }

    fn on_row_packet(&mut self, packet: &mut Packet) {
        if packet.is_err_packet() {
            self.consume_err(packet);
        } else if !self.deprecate_eof() && packet.is_eof_packet() {
            let status = LittleEndian::read_u16(&packet[3..5]);
            self.finish_or_next_resultset(StatusFlags::from_bits_truncate(status));
        } else if self.deprecate_eof() && packet.is_result_set_eof_packet() {
            self.consume_ok(packet);
        } else {
            self.reply.rows_read += 1;
        }
    }

    /// COM_STMT_PREPARE_OK: extract the server-assigned id, substitute the
    /// internal one, and work out how many follow-up packets to expect.
    /// See: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_com_stmt_prepare.html
    fn on_prepare_header(&mut self, packet: &mut Packet) {
        if packet.len() < 12 || packet[0] != 0 {
            self.reply.state = ReplyState::Done;
            return;
        }
        if let Some(server_id) = substitute_prepare_response_id(packet.as_mut(), self.internal_ps_id)
        {
            self.reply.server_ps_id = server_id;
        }
        self.reply.generated_id = self.internal_ps_id;
        let columns = LittleEndian::read_u16(&packet[5..7]);
        self.reply.param_count = LittleEndian::read_u16(&packet[7..9]);
        self.reply.is_ok = true;

        // parameter definitions come first, then column definitions; without
        // DEPRECATE_EOF each block ends with an EOF terminator
        let eof_per_block = u64::from(!self.deprecate_eof());
        self.pending_coldefs = 0;
        if self.reply.param_count > 0 {
            self.pending_coldefs += self.reply.param_count as u64 + eof_per_block;
        }
        if columns > 0 {
            self.pending_coldefs += columns as u64 + eof_per_block;
        }
        if self.pending_coldefs == 0 {
            self.reply.state = ReplyState::Done;
        } else {
            self.reply.state = ReplyState::Prepare;
        }
    }

    fn on_prepare_block(&mut self, _packet: &mut Packet) {
        self.pending_coldefs = self.pending_coldefs.saturating_sub(1);
        if self.pending_coldefs == 0 {
            self.reply.state = ReplyState::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> CapabilityFlags {
        CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SESSION_TRACK
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
    }

    fn ok_with_gtid(gtid: &[u8]) -> Packet {
        let mut bytes: Vec<u8> = vec![0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00];
        let entry_data_len = 1 + 1 + gtid.len();
        bytes.push((2 + entry_data_len) as u8);
        bytes.push(0x03);
        bytes.push(entry_data_len as u8);
        bytes.push(0x00);
        bytes.push(gtid.len() as u8);
        bytes.extend_from_slice(gtid);
        Packet::from_vec(bytes)
    }

    #[test]
    fn ok_reply_with_last_gtid() {
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps());
        let mut packet = ok_with_gtid(b"0-1-42");
        assert_eq!(builder.process(&mut packet), ReplyState::Done);
        let reply = builder.reply();
        assert!(reply.is_ok);
        assert_eq!(reply.last_gtid(), Some("0-1-42"));
    }

    #[test]
    fn err_reply() {
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps());
        let mut bytes = vec![0xff];
        bytes.extend_from_slice(&1064_u16.to_le_bytes());
        bytes.push(b'#');
        bytes.extend_from_slice(b"42000");
        bytes.extend_from_slice(b"syntax error");
        let mut packet = Packet::from_vec(bytes);
        assert_eq!(builder.process(&mut packet), ReplyState::Done);
        let error = builder.reply().error.as_ref().unwrap();
        assert_eq!(error.code, 1064);
        assert_eq!(error.sqlstate, "42000");
        assert!(!builder.reply().is_ok);
    }

    #[test]
    fn resultset_with_deprecate_eof() {
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps());
        // header: 2 columns
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0x02])),
            ReplyState::RsetColdef
        );
        builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f']));
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f'])),
            ReplyState::RsetRows
        );
        builder.process(&mut Packet::from_vec(vec![0x01, b'a', 0x01, b'b']));
        builder.process(&mut Packet::from_vec(vec![0x01, b'c', 0x01, b'd']));
        // terminating OK (0xfe header, length >= 7 under DEPRECATE_EOF)
        let mut terminator = Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(builder.process(&mut terminator), ReplyState::Done);
        let reply = builder.reply();
        assert_eq!(reply.resultsets, 1);
        assert_eq!(reply.field_counts, vec![2]);
        assert_eq!(reply.rows_read, 2);
    }

    #[test]
    fn resultset_with_eof_terminators() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps);
        builder.process(&mut Packet::from_vec(vec![0x01]));
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f'])),
            ReplyState::RsetColdefEof
        );
        // EOF closing the column definitions
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00])),
            ReplyState::RsetRows
        );
        builder.process(&mut Packet::from_vec(vec![0x01, b'x']));
        // EOF closing the rows
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00])),
            ReplyState::Done
        );
        assert_eq!(builder.reply().rows_read, 1);
    }

    #[test]
    fn multi_resultset_continues() {
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps());
        // OK with SERVER_MORE_RESULTS_EXISTS (0x0008)
        let mut first = Packet::from_vec(vec![0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x00]);
        assert_eq!(builder.process(&mut first), ReplyState::Start);
        let mut second = Packet::from_vec(vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(builder.process(&mut second), ReplyState::Done);
    }

    #[test]
    fn local_infile_round_trip() {
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps());
        let mut request = Packet::from_vec(vec![0xfb, b'/', b't', b'm', b'p']);
        assert_eq!(builder.process(&mut request), ReplyState::LoadData);
        let mut done = Packet::from_vec(vec![0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00]);
        builder.process(&mut done);
        assert_eq!(builder.state(), ReplyState::Done);
        assert!(builder.reply().is_ok);
    }

    #[test]
    fn prepare_response_substitutes_internal_id() {
        let mut builder = ReplyBuilder::for_prepare(caps(), 17);
        // server assigned id 101, 1 column, 1 parameter
        let mut header = vec![0x00];
        header.extend_from_slice(&101_u32.to_le_bytes());
        header.extend_from_slice(&1_u16.to_le_bytes());
        header.extend_from_slice(&1_u16.to_le_bytes());
        header.extend_from_slice(&[0x00, 0x00, 0x00]);
        let mut packet = Packet::from_vec(header);
        assert_eq!(builder.process(&mut packet), ReplyState::Prepare);

        // the client-visible id is now the internal one
        assert_eq!(LittleEndian::read_u32(&packet[1..5]), 17);
        assert_eq!(builder.reply().param_count, 1);

        // under DEPRECATE_EOF: one param def + one column def, no EOFs
        builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f']));
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f'])),
            ReplyState::Done
        );
        assert_eq!(builder.reply().generated_id, 17);
        assert_eq!(builder.reply().server_ps_id, 101);
    }

    #[test]
    fn prepare_response_counts_eof_terminators() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41;
        let mut builder = ReplyBuilder::for_prepare(caps, 9);
        let mut header = vec![0x00];
        header.extend_from_slice(&55_u32.to_le_bytes());
        header.extend_from_slice(&0_u16.to_le_bytes()); // no columns
        header.extend_from_slice(&2_u16.to_le_bytes()); // two params
        header.extend_from_slice(&[0x00, 0x00, 0x00]);
        builder.process(&mut Packet::from_vec(header));
        // two param defs + their EOF terminator
        builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f']));
        builder.process(&mut Packet::from_vec(vec![0x03, b'd', b'e', b'f']));
        assert_eq!(
            builder.process(&mut Packet::from_vec(vec![0xfe, 0x00, 0x00, 0x02, 0x00])),
            ReplyState::Done
        );
    }

    #[test]
    fn trx_state_tracked() {
        let mut builder = ReplyBuilder::new(CommandCode::ComQuery, caps());
        // OK with a transaction-state entry "T_______"
        let state = b"T_______";
        let mut bytes: Vec<u8> = vec![0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x00];
        let entry_len = 1 + state.len();
        bytes.push((2 + entry_len) as u8);
        bytes.push(0x05);
        bytes.push(entry_len as u8);
        bytes.push(state.len() as u8);
        bytes.extend_from_slice(state);
        builder.process(&mut Packet::from_vec(bytes));
        assert_eq!(builder.reply().trx_state(), Some("T_______"));
    }
}
