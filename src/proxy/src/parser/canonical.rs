//! Canonical statement form: literals replaced by `?`, comments stripped,
//! whitespace collapsed. Stable under whitespace/comment variation, so it can
//! key caches and query logs.

use std::hash::Hasher;
use twox_hash::XxHash64;

pub fn canonicalize(sql: &[u8]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut pos = 0;
    let mut pending_space = false;

    let push_sep = |out: &mut String, pending: &mut bool| {
        if *pending && !out.is_empty() {
            out.push(' ');
        }
        *pending = false;
    };

    while pos < sql.len() {
        let b = sql[pos];
        match b {
            b if b.is_ascii_whitespace() => {
                pending_space = true;
                pos += 1;
            }
            b'#' => pos = skip_line_comment(sql, pos),
            b'-' if sql.get(pos + 1) == Some(&b'-')
                && sql
                    .get(pos + 2)
                    .map(|b| b.is_ascii_whitespace())
                    .unwrap_or(true) =>
            {
                pos = skip_line_comment(sql, pos)
            }
            b'/' if sql.get(pos + 1) == Some(&b'*') => {
                pos += 2;
                while pos < sql.len() {
                    if sql[pos] == b'*' && sql.get(pos + 1) == Some(&b'/') {
                        pos += 2;
                        break;
                    }
                    pos += 1;
                }
                pending_space = true;
            }
            b'\'' | b'"' => {
                push_sep(&mut out, &mut pending_space);
                pos = skip_quoted(sql, pos + 1, b);
                out.push('?');
            }
            b'`' => {
                push_sep(&mut out, &mut pending_space);
                let start = pos;
                pos = skip_quoted(sql, pos + 1, b'`');
                out.push_str(&String::from_utf8_lossy(&sql[start..pos]));
            }
            b if b.is_ascii_digit() => {
                // a digit directly attached to an identifier is part of it
                let attached = out
                    .chars()
                    .last()
                    .map(|c| c.is_ascii_alphanumeric() || c == '_')
                    .unwrap_or(false)
                    && !pending_space;
                if attached {
                    out.push(b as char);
                    pos += 1;
                } else {
                    push_sep(&mut out, &mut pending_space);
                    pos = skip_number(sql, pos);
                    out.push('?');
                }
            }
            _ => {
                push_sep(&mut out, &mut pending_space);
                out.push(b as char);
                pos += 1;
            }
        }
    }
    out.trim().to_string()
}

/// Hash of the canonical form, the cache key for query results and logs.
pub fn canonical_key(sql: &[u8]) -> u64 {
    let canonical = canonicalize(sql);
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(canonical.as_bytes());
    hasher.finish()
}

fn skip_line_comment(sql: &[u8], mut pos: usize) -> usize {
    while pos < sql.len() && sql[pos] != b'\n' {
        pos += 1;
    }
    pos
}

fn skip_quoted(sql: &[u8], mut pos: usize, quote: u8) -> usize {
    while pos < sql.len() {
        let b = sql[pos];
        if b == b'\\' && quote != b'`' {
            pos += 2;
            continue;
        }
        if b == quote {
            if sql.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    pos
}

fn skip_number(sql: &[u8], mut pos: usize) -> usize {
    if sql[pos] == b'0' && matches!(sql.get(pos + 1), Some(b'x') | Some(b'X')) {
        pos += 2;
        while pos < sql.len() && sql[pos].is_ascii_hexdigit() {
            pos += 1;
        }
        return pos;
    }
    while pos < sql.len()
        && (sql[pos].is_ascii_digit() || sql[pos] == b'.' || sql[pos] == b'e' || sql[pos] == b'E')
    {
        pos += 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_replaced() {
        assert_eq!(
            canonicalize(b"SELECT * FROM t WHERE a = 'x' AND b = 42"),
            "SELECT * FROM t WHERE a = ? AND b = ?"
        );
    }

    #[test]
    fn whitespace_and_comments_invariant() {
        let a = canonicalize(b"SELECT  1\t+ 2 /* c */ FROM t");
        let b = canonicalize(b"SELECT 1 + 2 FROM t -- tail");
        assert_eq!(a, b);
    }

    #[test]
    fn idempotent() {
        let sql = b"INSERT INTO t VALUES (1, 'two', 3.0)";
        let once = canonicalize(sql);
        let twice = canonicalize(once.as_bytes());
        assert_eq!(once, twice);
    }

    #[test]
    fn identifier_digits_survive() {
        assert_eq!(canonicalize(b"SELECT c1 FROM t2"), "SELECT c1 FROM t2");
    }

    #[test]
    fn stable_key() {
        assert_eq!(
            canonical_key(b"SELECT * FROM t WHERE a=1"),
            canonical_key(b"SELECT  * FROM t WHERE a=2 -- note")
        );
    }
}
