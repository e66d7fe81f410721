/// MariaDB/MySQL server error numbers the proxy emits or reacts to.
/// See: https://mariadb.com/kb/en/mariadb-error-codes/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(non_camel_case_types)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_BAD_DB_ERROR = 1049,
    ER_UNKNOWN_COM_ERROR = 1047,
    ER_HANDSHAKE_ERROR = 1043,
    ER_HOST_IS_BLOCKED = 1129,
    ER_ACCESS_DENIED_NO_PASSWORD_ERROR = 1698,
    ER_UNKNOWN_STMT_HANDLER = 1243,
    ER_NET_PACKET_TOO_LARGE = 1153,
    ER_NOT_SUPPORTED_AUTH_MODE = 1251,
    ER_CANT_CHANGE_TX_CHARACTERISTICS = 1568,
    ER_READ_ONLY_TRANSACTION = 1792,
    ER_CONNECTION_KILLED = 1927,
}

impl ErrorKind {
    /// Five-byte SQLSTATE for the error, without the leading '#'.
    pub fn sqlstate(&self) -> &'static [u8; 5] {
        match self {
            ErrorKind::ER_ACCESS_DENIED_ERROR
            | ErrorKind::ER_ACCESS_DENIED_NO_PASSWORD_ERROR => b"28000",
            ErrorKind::ER_BAD_DB_ERROR => b"42000",
            ErrorKind::ER_UNKNOWN_COM_ERROR | ErrorKind::ER_UNKNOWN_STMT_HANDLER => b"HY000",
            ErrorKind::ER_HANDSHAKE_ERROR | ErrorKind::ER_HOST_IS_BLOCKED => b"08S01",
            ErrorKind::ER_NET_PACKET_TOO_LARGE => b"08S01",
            ErrorKind::ER_NOT_SUPPORTED_AUTH_MODE => b"08004",
            ErrorKind::ER_CANT_CHANGE_TX_CHARACTERISTICS => b"25001",
            ErrorKind::ER_READ_ONLY_TRANSACTION => b"25006",
            ErrorKind::ER_CONNECTION_KILLED => b"70100",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_sqlstates() {
        assert_eq!(ErrorKind::ER_ACCESS_DENIED_ERROR as u16, 1045);
        assert_eq!(ErrorKind::ER_HOST_IS_BLOCKED as u16, 1129);
        assert_eq!(ErrorKind::ER_READ_ONLY_TRANSACTION.sqlstate(), b"25006");
    }
}
