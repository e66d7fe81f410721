use crate::protocol::mysql::constants;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::prelude::*;
use std::io::IoSlice;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffers one outgoing packet payload and frames it on `end_packet`,
/// splitting at the 16M-1 boundary and stamping sequence numbers.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len();
        self.buf.extend_from_slice(buf);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            // split the raw buffer at the boundary of size MAX_PAYLOAD_LEN
            let chunks = raw_packet.chunks(constants::MAX_PAYLOAD_LEN);
            for chunk in chunks {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                // write out the header and payload.
                //
                // depends on the AsyncWrite provided, this may trigger
                // real system call or not (for examples, if AsyncWrite is buffered stream)
                let written = self
                    .inner_writer
                    .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                    .await?;

                // if write buffer is not drained, fall back to write_all
                if written != constants::PACKET_HEADER_LEN + chunk.len() {
                    let remaining: Vec<u8> = header
                        .iter()
                        .chain(chunk.iter())
                        .skip(written)
                        .cloned()
                        .collect();
                    self.inner_writer.write_all(&remaining).await?
                }
            }
            Ok(())
        } else {
            // Packet with empty payload. Usually, the payload is not empty. Currently, only the password is empty.
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq();
            self.increase_seq();
            let _size = self
                .inner_writer
                .write_vectored(&[IoSlice::new(&header), IoSlice::new(&[])])
                .await?;
            Ok(())
        }
    }

    /// Write a fully framed packet: payload plus header, one call.
    pub async fn write_packet(&mut self, seq: u8, payload: &[u8]) -> io::Result<()> {
        self.set_seq(seq);
        self.write_all(payload)?;
        self.end_packet().await
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::packet;

    #[tokio::test]
    async fn frames_single_packet() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.write_packet(0, &[0x03, b'S', b'E', b'L']).await.unwrap();
        let wire = writer.inner_writer;
        let (rest, (seq, pkt)) = packet(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 0);
        assert_eq!(&*pkt, &[0x03, b'S', b'E', b'L']);
    }

    #[tokio::test]
    async fn splits_oversized_payload() {
        use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(0);
        writer
            .write_all(&vec![0x41; MAX_PAYLOAD_LEN + 5])
            .unwrap();
        writer.end_packet().await.unwrap();
        let wire = writer.inner_writer;
        let (rest, (seq, pkt)) = packet(&wire).unwrap();
        assert!(rest.is_empty());
        assert_eq!(seq, 1);
        assert!(pkt.is_multi_part());
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN + 5);
    }

    #[tokio::test]
    async fn empty_payload_still_framed() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(3);
        writer.end_packet().await.unwrap();
        assert_eq!(writer.inner_writer, vec![0, 0, 0, 3]);
    }
}
