use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// v3 protocol number 3.0
pub const PROTOCOL_VERSION: u32 = 196_608;
/// Magic request code carried in the length-only SSLRequest message.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
/// Magic request code of CancelRequest.
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Frontend-to-backend message tags the core routes on.
pub mod frontend {
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Backend-to-frontend message tags the core inspects.
pub mod backend {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
}

/// One Postgres wire message. The very first message of a session has no tag
/// byte; `tag` is `None` for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgMessage {
    pub tag: Option<u8>,
    pub payload: Vec<u8>,
}

impl PgMessage {
    pub fn is_ssl_request(&self) -> bool {
        self.tag.is_none()
            && self.payload.len() == 4
            && BigEndian::read_u32(&self.payload) == SSL_REQUEST_CODE
    }

    pub fn is_cancel_request(&self) -> bool {
        self.tag.is_none()
            && self.payload.len() >= 4
            && BigEndian::read_u32(&self.payload) == CANCEL_REQUEST_CODE
    }

    pub fn is_startup(&self) -> bool {
        self.tag.is_none()
            && self.payload.len() >= 4
            && BigEndian::read_u32(&self.payload) == PROTOCOL_VERSION
    }

    /// Startup parameters (`user`, `database`, ...) as key/value pairs.
    pub fn startup_parameters(&self) -> Option<HashMap<String, String>> {
        if !self.is_startup() {
            return None;
        }
        let mut params = HashMap::new();
        let mut rest = &self.payload[4..];
        while let Some(key_end) = rest.iter().position(|b| *b == 0) {
            if key_end == 0 {
                break; // final terminator
            }
            let key = String::from_utf8_lossy(&rest[..key_end]).to_string();
            rest = &rest[key_end + 1..];
            let value_end = rest.iter().position(|b| *b == 0)?;
            let value = String::from_utf8_lossy(&rest[..value_end]).to_string();
            rest = &rest[value_end + 1..];
            params.insert(key, value);
        }
        Some(params)
    }

    /// SQL body of a simple Query ('Q') message.
    pub fn query_sql(&self) -> Option<&[u8]> {
        if self.tag == Some(frontend::QUERY) {
            let body = self.payload.strip_suffix(&[0]).unwrap_or(&self.payload);
            Some(body)
        } else {
            None
        }
    }
}

/// Reads one logical Postgres message per call. The startup phase (no tag
/// byte) is a state the reader leaves after the first non-SSL-request
/// message.
pub struct PgMessageReader<R> {
    startup_done: bool,
    pub r: R,
}

impl<R: AsyncRead + Unpin> PgMessageReader<R> {
    pub fn new(r: R) -> Self {
        Self {
            startup_done: false,
            r,
        }
    }

    /// Mark the startup phase finished, e.g. after an SSLRequest was answered
    /// and the stream upgraded: the next message is again untagged.
    pub fn expect_startup(&mut self) {
        self.startup_done = false;
    }

    pub async fn next_message(&mut self) -> io::Result<Option<PgMessage>> {
        if !self.startup_done {
            let mut len_buf = [0u8; 4];
            match self.r.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            }
            let len = BigEndian::read_u32(&len_buf) as usize;
            if len < 4 || len > 0x0100_0000 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad startup message length {len}"),
                ));
            }
            let mut payload = vec![0u8; len - 4];
            self.r.read_exact(&mut payload).await?;
            let msg = PgMessage { tag: None, payload };
            if !msg.is_ssl_request() {
                self.startup_done = true;
            }
            return Ok(Some(msg));
        }

        let mut tag = [0u8; 1];
        match self.r.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut len_buf = [0u8; 4];
        self.r.read_exact(&mut len_buf).await?;
        let len = BigEndian::read_u32(&len_buf) as usize;
        if len < 4 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad message length {len} for tag {}", tag[0] as char),
            ));
        }
        let mut payload = vec![0u8; len - 4];
        self.r.read_exact(&mut payload).await?;
        Ok(Some(PgMessage {
            tag: Some(tag[0]),
            payload,
        }))
    }
}

/// Frame a tagged message: tag, length (including itself), payload.
pub fn encode_message(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(tag);
    out.extend_from_slice(&((payload.len() as u32 + 4).to_be_bytes()));
    out.extend_from_slice(payload);
    out
}

/// ErrorResponse ('E') with Severity/Code/Message fields.
pub fn encode_error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'S');
    payload.extend_from_slice(severity.as_bytes());
    payload.push(0);
    payload.push(b'C');
    payload.extend_from_slice(code.as_bytes());
    payload.push(0);
    payload.push(b'M');
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    payload.push(0);
    encode_message(backend::ERROR_RESPONSE, &payload)
}

/// ReadyForQuery ('Z') with the transaction status byte:
/// 'I' idle, 'T' in transaction, 'E' failed transaction.
pub fn encode_ready_for_query(trx_status: u8) -> Vec<u8> {
    encode_message(backend::READY_FOR_QUERY, &[trx_status])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn startup_bytes(params: &[(&str, &str)]) -> Vec<u8> {
        let mut payload = PROTOCOL_VERSION.to_be_bytes().to_vec();
        for (k, v) in params {
            payload.extend_from_slice(k.as_bytes());
            payload.push(0);
            payload.extend_from_slice(v.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        let mut out = ((payload.len() as u32 + 4).to_be_bytes()).to_vec();
        out.extend_from_slice(&payload);
        out
    }

    #[tokio::test]
    async fn startup_then_query() {
        let mut wire = startup_bytes(&[("user", "alice"), ("database", "shop")]);
        wire.extend(encode_message(frontend::QUERY, b"SELECT 1\0"));

        let mut reader = PgMessageReader::new(Cursor::new(wire));
        let startup = reader.next_message().await.unwrap().unwrap();
        assert!(startup.is_startup());
        let params = startup.startup_parameters().unwrap();
        assert_eq!(params.get("user").unwrap(), "alice");
        assert_eq!(params.get("database").unwrap(), "shop");

        let query = reader.next_message().await.unwrap().unwrap();
        assert_eq!(query.tag, Some(frontend::QUERY));
        assert_eq!(query.query_sql().unwrap(), b"SELECT 1");
    }

    #[tokio::test]
    async fn ssl_request_keeps_startup_state() {
        let mut wire = (8_u32.to_be_bytes()).to_vec();
        wire.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        let mut reader = PgMessageReader::new(Cursor::new(wire));
        let msg = reader.next_message().await.unwrap().unwrap();
        assert!(msg.is_ssl_request());
        assert!(!reader.startup_done);
    }

    #[test]
    fn error_response_shape() {
        let bytes = encode_error_response("FATAL", "28P01", "password authentication failed");
        assert_eq!(bytes[0], backend::ERROR_RESPONSE);
        let len = BigEndian::read_u32(&bytes[1..5]) as usize;
        assert_eq!(len + 1, bytes.len());
        let payload = &bytes[5..];
        assert_eq!(payload[0], b'S');
        assert!(payload.windows(6).any(|w| w == b"C28P01"));
        assert_eq!(payload[payload.len() - 1], 0);
    }

    #[test]
    fn ready_for_query_idle() {
        assert_eq!(encode_ready_for_query(b'I'), vec![b'Z', 0, 0, 0, 5, b'I']);
    }
}
