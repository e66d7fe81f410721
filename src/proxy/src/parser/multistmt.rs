//! Fast scan for statement separators outside quotes and comments. A packet
//! that carries several statements is pinned to the primary for the rest of
//! the session unless the client negotiated multi-statement replies.

pub fn is_multi_stmt(sql: &[u8]) -> bool {
    let mut pos = 0;
    let len = sql.len();
    while pos < len {
        match sql[pos] {
            b'\'' | b'"' | b'`' => pos = skip_quoted(sql, pos + 1, sql[pos]),
            b'#' => pos = skip_to_newline(sql, pos),
            b'-' if sql.get(pos + 1) == Some(&b'-')
                && sql
                    .get(pos + 2)
                    .map(|b| b.is_ascii_whitespace())
                    .unwrap_or(true) =>
            {
                pos = skip_to_newline(sql, pos)
            }
            b'/' if sql.get(pos + 1) == Some(&b'*') => {
                pos += 2;
                while pos < len {
                    if sql[pos] == b'*' && sql.get(pos + 1) == Some(&b'/') {
                        pos += 2;
                        break;
                    }
                    pos += 1;
                }
            }
            b';' => {
                // trailing semicolons do not make a multi-statement
                let mut rest = pos + 1;
                while rest < len && (sql[rest].is_ascii_whitespace() || sql[rest] == b';') {
                    rest += 1;
                }
                return rest < len;
            }
            _ => pos += 1,
        }
    }
    false
}

fn skip_quoted(sql: &[u8], mut pos: usize, quote: u8) -> usize {
    while pos < sql.len() {
        let b = sql[pos];
        if b == b'\\' && quote != b'`' {
            pos += 2;
            continue;
        }
        if b == quote {
            return pos + 1;
        }
        pos += 1;
    }
    pos
}

fn skip_to_newline(sql: &[u8], mut pos: usize) -> usize {
    while pos < sql.len() && sql[pos] != b'\n' {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_second_statement() {
        assert!(is_multi_stmt(b"SET @a=1; SELECT @a"));
        assert!(is_multi_stmt(b"DELETE FROM t;INSERT INTO t VALUES (1)"));
    }

    #[test]
    fn single_statement() {
        assert!(!is_multi_stmt(b"SELECT 1"));
        assert!(!is_multi_stmt(b"SELECT 1;"));
        assert!(!is_multi_stmt(b"SELECT 1;;  "));
    }

    #[test]
    fn quoted_semicolons_ignored() {
        assert!(!is_multi_stmt(b"SELECT 'a;b' FROM t"));
        assert!(!is_multi_stmt(b"SELECT `weird;name` FROM t"));
        assert!(!is_multi_stmt(b"SELECT 1 -- comment; more\n"));
        assert!(!is_multi_stmt(b"SELECT 1 /* ; */"));
    }
}
