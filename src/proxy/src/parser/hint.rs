//! Routing hints embedded in `-- maxscale ...` (or `/* maxscale ... */`)
//! comments, attached to the packet before classification.
//!
//! Recognized forms:
//!   -- maxscale route to master
//!   -- maxscale route to slave
//!   -- maxscale route to last
//!   -- maxscale route to all
//!   -- maxscale route to server <name>
//!   -- maxscale <key>=<value>

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    RouteToMaster,
    RouteToSlave,
    RouteToNamedServer(String),
    RouteToLastUsed,
    RouteToAll,
    Parameter { key: String, value: String },
}

/// Extract all hints from the comments of one statement.
pub fn parse_hints(sql: &[u8]) -> Vec<Hint> {
    let mut hints = Vec::new();
    let text = String::from_utf8_lossy(sql);
    for comment in comment_bodies(&text) {
        if let Some(hint) = parse_hint_body(comment) {
            hints.push(hint);
        }
    }
    hints
}

fn comment_bodies(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut bodies = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[pos];
                pos += 1;
                while pos < bytes.len() {
                    if bytes[pos] == b'\\' && quote != b'`' {
                        pos += 2;
                        continue;
                    }
                    if bytes[pos] == quote {
                        pos += 1;
                        break;
                    }
                    pos += 1;
                }
            }
            b'-' if bytes.get(pos + 1) == Some(&b'-') => {
                let start = pos + 2;
                let end = text[start..]
                    .find('\n')
                    .map(|n| start + n)
                    .unwrap_or(text.len());
                bodies.push(text[start..end].trim());
                pos = end;
            }
            b'#' => {
                let start = pos + 1;
                let end = text[start..]
                    .find('\n')
                    .map(|n| start + n)
                    .unwrap_or(text.len());
                bodies.push(text[start..end].trim());
                pos = end;
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                let start = pos + 2;
                let end = text[start..]
                    .find("*/")
                    .map(|n| start + n)
                    .unwrap_or(text.len());
                bodies.push(text[start..end].trim());
                pos = end + 2;
            }
            _ => pos += 1,
        }
    }
    bodies
}

fn parse_hint_body(body: &str) -> Option<Hint> {
    let mut words = body.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("maxscale") {
        return None;
    }
    let rest: Vec<&str> = words.collect();
    if rest.len() >= 2
        && rest[0].eq_ignore_ascii_case("route")
        && rest[1].eq_ignore_ascii_case("to")
    {
        return match rest.get(2).map(|w| w.to_ascii_lowercase()).as_deref() {
            Some("master") => Some(Hint::RouteToMaster),
            Some("slave") => Some(Hint::RouteToSlave),
            Some("last") => Some(Hint::RouteToLastUsed),
            Some("all") => Some(Hint::RouteToAll),
            Some("server") => rest
                .get(3)
                .map(|name| Hint::RouteToNamedServer(name.to_string())),
            _ => None,
        };
    }
    // key=value parameter hint
    if rest.len() == 1 {
        if let Some((key, value)) = rest[0].split_once('=') {
            return Some(Hint::Parameter {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            });
        }
    }
    if rest.len() == 3 && rest[1] == "=" {
        return Some(Hint::Parameter {
            key: rest[0].to_string(),
            value: rest[2].to_string(),
        });
    }
    None
}
