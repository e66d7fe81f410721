use crate::protocol::mysql::packet::{packet, Packet};

use std::io;
use std::io::prelude::*;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("ProxySrv read pkg err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            warn!("ProxySrv pkg is none");
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// [PacketReader] represents reading data from a TcpStream and parsing it into a MySQL [`Packet`](Packet).
/// Partial packets stay in the buffer across calls; each logical packet is
/// delivered exactly once, in order.
#[derive(Clone)]
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    start: usize,
    remaining: usize,
    /// Upper bound on bytes fetched per read, see `set_read_limit`.
    read_limit: usize,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            start: 0,
            remaining: 0,
            read_limit: usize::MAX,
            r,
        }
    }

    /// Bound the bytes fetched per tick, typically to the write queue's
    /// remaining headroom so a slow peer applies backpressure to the other
    /// side. The limit never drops below one packet header, and a packet
    /// whose frame is already partially buffered is still completed.
    pub fn set_read_limit(&mut self, limit: usize) {
        self.read_limit = limit.max(crate::protocol::mysql::constants::PACKET_HEADER_LEN);
    }
}

impl<R: Read> PacketReader<R> {
    pub fn next_read(&mut self) -> io::Result<Option<(u8, Packet)>> {
        self.start = self.bytes.len() - self.remaining;

        loop {
            if self.remaining != 0 {
                let bytes = {
                    // NOTE: this is all sorts of unfortunate. what we really want to do is to give
                    // &self.bytes[self.start..] to `packet()`, and the lifetimes should all work
                    // out. however, without NLL, borrowck doesn't realize that self.bytes is no
                    // longer borrowed after the match, and so can be mutated.
                    let bytes = &self.bytes[self.start..];
                    unsafe { ::std::slice::from_raw_parts(bytes.as_ptr(), bytes.len()) }
                };

                match packet(bytes) {
                    Ok((rest, p)) => {
                        self.remaining = rest.len();
                        return Ok(Some(p));
                    }
                    Err(nom::Err::Incomplete(_)) | Err(nom::Err::Error(_)) => {}
                    Err(nom::Err::Failure(ctx)) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{:?}", ctx),
                        ));
                    }
                }
            }

            // we need to read some more
            self.bytes.drain(0..self.start);
            self.start = 0;
            let end = self.bytes.len();
            self.bytes.resize(std::cmp::max(4096, end * 2), 0);
            let read = {
                let buf = &mut self.bytes[end..];
                self.r.read(buf)?
            };
            self.bytes.truncate(end + read);
            self.remaining = self.bytes.len();

            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ));
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PacketReader<R> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        if self.remaining != 0 {
            buf.put_slice(&self.bytes[self.start..]);
            self.bytes.clear();
            self.start = 0;
            self.remaining = 0;
            std::task::Poll::Ready(Ok(()))
        } else {
            std::pin::Pin::new(&mut self.r).poll_read(cx, buf)
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub async fn next_async(&mut self) -> io::Result<Option<(u8, Packet)>> {
        self.start = self.bytes.len() - self.remaining;

        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if self.remaining != 0 {
                let bytes = {
                    // NOTE: this is all sorts of unfortunate. what we really want to do is to give
                    // &self.bytes[self.start..] to `packet()`, and the lifetimes should all work
                    // out. however, without NLL, borrowck doesn't realize that self.bytes is no
                    // longer borrowed after the match, and so can be mutated.
                    let bytes = &self.bytes[self.start..];
                    unsafe { ::std::slice::from_raw_parts(bytes.as_ptr(), self.remaining) }
                };
                match packet(bytes) {
                    Ok((rest, p)) => {
                        self.remaining = rest.len();
                        if self.remaining > 0 {
                            self.bytes = rest.to_vec();
                            self.start = 0;
                        }
                        return Ok(Some(p));
                    }
                    Err(nom::Err::Incomplete(_)) | Err(nom::Err::Error(_)) => {}
                    Err(nom::Err::Failure(ctx)) => {
                        self.bytes.truncate(self.remaining);
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("{:?}", ctx),
                        ));
                    }
                }
            }

            // we need to read some more. the buffer holds exactly the
            // unconsumed bytes before the await, which keeps this future
            // safe to cancel from a select loop.
            self.bytes.drain(0..self.start);
            self.start = 0;
            self.bytes.truncate(self.remaining);

            let mut chunk = vec![0u8; buffer_size.min(self.read_limit)];
            let read = self.r.read(&mut chunk).await?;
            self.bytes.extend_from_slice(&chunk[..read]);
            self.remaining = self.bytes.len();
            // use a larger buffer size to reduce read times.
            buffer_size = PACKET_LARGE_BUFFER_SIZE;
            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} unhandled bytes", self.bytes.len()),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;
    use std::io::Cursor;

    #[test]
    fn framing_round_trip_mixed_sizes() {
        // A small packet, a 16M-1 continuation chain, then a small packet.
        let mut stream = vec![0x01, 0, 0, 0, 0x0e];
        stream.extend(&[0xff, 0xff, 0xff, 0]);
        stream.extend(std::iter::repeat(0x41).take(MAX_PAYLOAD_LEN));
        stream.extend(&[0x02, 0, 0, 1, 0x42, 0x42]);
        stream.extend(&[0x01, 0, 0, 0, 0x0e]);

        let mut reader = PacketReader::new(Cursor::new(stream));
        let (_, first) = reader.next_read().unwrap().unwrap();
        assert_eq!(&*first, &[0x0e]);
        assert!(!first.is_multi_part());

        let (_, big) = reader.next_read().unwrap().unwrap();
        assert_eq!(big.len(), MAX_PAYLOAD_LEN + 2);
        assert!(big.is_multi_part());

        let (_, last) = reader.next_read().unwrap().unwrap();
        assert_eq!(&*last, &[0x0e]);
        assert!(reader.next_read().unwrap().is_none());
    }

    #[tokio::test]
    async fn read_limit_still_delivers_full_packets() {
        let mut stream = vec![0x02, 0, 0, 0, 0x03, b'x'];
        stream.extend(&[0x02, 0, 0, 0, 0x03, b'y']);
        let mut reader = PacketReader::new(Cursor::new(stream));
        // a tiny budget forces several reads per packet but never stalls
        reader.set_read_limit(1);
        assert_eq!(reader.read_limit, 4);
        let (_, a) = reader.next_async().await.unwrap().unwrap();
        let (_, b) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(&*a, &[0x03, b'x']);
        assert_eq!(&*b, &[0x03, b'y']);
    }

    #[tokio::test]
    async fn async_reader_keeps_partial_bytes() {
        let mut stream = vec![0x02, 0, 0, 0, 0x03, b'x'];
        stream.extend(&[0x02, 0, 0, 0, 0x03, b'y']);
        let mut reader = PacketReader::new(Cursor::new(stream));
        let (_, a) = reader.next_async().await.unwrap().unwrap();
        let (_, b) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(&*a, &[0x03, b'x']);
        assert_eq!(&*b, &[0x03, b'y']);
        assert!(reader.next_async().await.unwrap().is_none());
    }
}
