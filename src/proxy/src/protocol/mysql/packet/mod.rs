pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::parser::hint::Hint;
use crate::protocol::mysql::constants;
use crate::protocol::mysql::constants::HeaderInfo;
use std::ops::Deref;

/// `Packet` Represents one logical packet of the MySql wire protocol.
/// The maximum size of a MySQL packet is 16M-1; a longer payload is split at
/// the wire level and reassembled here, with `multi_part` recording that a
/// continuation chain was seen.
/// [MySQL Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html)
#[derive(Clone, Debug, Default)]
pub struct Packet {
    bytes: Vec<u8>,
    multi_part: bool,
    /// Proxy-assigned id correlating session-command replies across backends.
    id: Option<u32>,
    hints: Vec<Hint>,
}

impl Packet {
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Packet {
            bytes: vec,
            multi_part: false,
            id: None,
            hints: Vec::new(),
        }
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.bytes.extend(bytes);
    }

    /// True when the logical packet was reassembled from 0xFFFFFF-length
    /// frames, i.e. continuations followed the first frame on the wire.
    pub fn is_multi_part(&self) -> bool {
        self.multi_part
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = Some(id);
    }

    pub fn hints(&self) -> &[Hint] {
        &self.hints
    }

    pub fn add_hint(&mut self, hint: Hint) {
        self.hints.push(hint);
    }

    pub fn set_hints(&mut self, hints: Vec<Hint>) {
        self.hints = hints;
    }

    pub fn command(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// SQL body of a COM_QUERY/COM_STMT_PREPARE/COM_INIT_DB packet.
    pub fn sql(&self) -> Option<&[u8]> {
        if self.bytes.len() > 1 {
            Some(&self.bytes[1..])
        } else {
            None
        }
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        let pkt_len = self.bytes.len();
        !self.bytes.is_empty() && self.bytes[0] == (HeaderInfo::EOFHeader as u8) && pkt_len <= 5
    }

    /// See: [MariaDB](https://mariadb.com/kb/en/result-set-packets/) or [MySQL](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_ok_packet.html)
    /// Packet header is 0xfe and we need check the packet length.
    /// return true OK packet after the result set when CLIENT_DEPRECATE_EOF is enabled
    pub fn is_result_set_eof_packet(&self) -> bool {
        let pkt_len = self.bytes.len();
        !self.bytes.is_empty()
            && self.bytes[0] == (HeaderInfo::EOFHeader as u8)
            && (7..0xFFFFFF).contains(&pkt_len)
    }

    pub fn is_ok_packet(&self) -> bool {
        !self.bytes.is_empty() && self.bytes[0] == (HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        !self.bytes.is_empty() && self.bytes[0] == (HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        !self.bytes.is_empty() && self.bytes[0] == (HeaderInfo::LocalInFileHeader as u8)
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl AsMut<[u8]> for Packet {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Deref for Packet {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_ref()
    }
}

#[inline]
pub fn full_packet(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, _) = nom::bytes::complete::tag(&[0xff, 0xff, 0xff])(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(constants::MAX_PAYLOAD_LEN)(i)?;
    Ok((i, (seq[0], bytes)))
}

#[inline]
pub fn one_packet(i: &[u8]) -> nom::IResult<&[u8], (u8, &[u8])> {
    let (i, length) = nom::number::complete::le_u24(i)?;
    let (i, seq) = nom::bytes::complete::take(1u8)(i)?;
    let (i, bytes) = nom::bytes::complete::take(length)(i)?;
    Ok((i, (seq[0], bytes)))
}

/// Parse one logical packet, reassembling the 16M-1 continuation chain. The
/// final frame of a chain is any frame with a shorter payload, including an
/// empty one.
pub fn packet(i: &[u8]) -> nom::IResult<&[u8], (u8, Packet)> {
    nom::combinator::map(
        nom::sequence::pair(
            nom::multi::fold_many0(
                full_packet,
                || (0, None),
                |(seq, pkt): (_, Option<Packet>), (nseq, p)| {
                    let pkt = if let Some(mut pkt) = pkt {
                        debug_assert_eq!(nseq, seq + 1);
                        pkt.extend(p);
                        Some(pkt)
                    } else {
                        let mut first = Packet::from_vec(Vec::from(p));
                        first.multi_part = true;
                        Some(first)
                    };
                    (nseq, pkt)
                },
            ),
            one_packet,
        ),
        move |(full, last)| {
            let seq = last.0;
            let pkt = if let Some(mut pkt) = full.1 {
                debug_assert_eq!(last.0, full.0 + 1);
                pkt.extend(last.1);
                pkt
            } else {
                Packet::from_vec(Vec::from(last.1))
            };
            (seq, pkt)
        },
    )(i)
}

#[cfg(test)]
mod tests {
    use crate::protocol::mysql::packet::*;

    #[test]
    fn test_one_ping() {
        let one_pkg_rs = one_packet(&[0x01, 0, 0, 0, 0x10]);
        assert!(one_pkg_rs.is_ok());
        let pkg = one_pkg_rs.unwrap().1;
        assert_eq!(pkg.1, &[0x10]);
    }

    #[test]
    fn test_ping() {
        let p = packet(&[0x01, 0, 0, 0, 0x10]).unwrap().1;
        assert_eq!(p.0, 0);
        assert_eq!(&*p.1, &[0x10][..]);
        assert!(!p.1.is_multi_part());
    }

    #[test]
    fn test_long_exact() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x00);
        data.push(0x00);
        data.push(0x00);
        data.push(1);

        let mut payload_slice = [0x00; 4];
        payload_slice.clone_from_slice(&data[0..4]);
        let payload_len = u32::from_le_bytes(payload_slice);
        assert_eq!(payload_len as usize, constants::MAX_PAYLOAD_LEN);
        let (rest, p) = packet(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.0, 1);
        assert_eq!(p.1.len(), constants::MAX_PAYLOAD_LEN);
        assert!(p.1.is_multi_part());
    }

    #[test]
    fn test_long_more() {
        let mut data = vec![0xff, 0xff, 0xff, 0];
        data.extend(&[0; constants::MAX_PAYLOAD_LEN][..]);
        data.push(0x01);
        data.push(0x00);
        data.push(0x00);
        data.push(1);
        data.push(0x10);

        let (rest, p) = packet(&data[..]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(p.0, 1);
        assert_eq!(p.1.len(), constants::MAX_PAYLOAD_LEN + 1);
        assert!(p.1.is_multi_part());
        assert_eq!(
            &p.1[..constants::MAX_PAYLOAD_LEN],
            &[0; constants::MAX_PAYLOAD_LEN][..]
        );
        assert_eq!(&p.1[constants::MAX_PAYLOAD_LEN..], &[0x10]);
    }

    #[test]
    fn test_two_packets_in_order() {
        // Two COM_QUERY packets concatenated; the reader must emit both, in order.
        let mut data = vec![0x02, 0, 0, 0, 0x03, b'a'];
        data.extend(&[0x02, 0, 0, 0, 0x03, b'b']);
        let (rest, first) = packet(&data).unwrap();
        let (rest, second) = packet(rest).unwrap();
        assert!(rest.is_empty());
        assert_eq!(&*first.1, &[0x03, b'a']);
        assert_eq!(&*second.1, &[0x03, b'b']);
        assert!(!first.1.is_multi_part());
    }
}
