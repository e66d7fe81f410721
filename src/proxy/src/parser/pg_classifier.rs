//! Postgres statement classifier plugin. Postgres statements reach the proxy
//! through the v3 simple/extended query flow; classification needs the same
//! vocabulary as the MariaDB plugin but a far smaller statement surface, so
//! this plugin reuses the shared tokenizer and keeps to keyword dispatch.

use crate::parser::canonical::canonicalize;
use crate::parser::tokenizer::{Token, Tokenizer};
use crate::parser::type_mask::{Operation, TypeMask};
use crate::parser::{
    CollectLevel, ParseResult, ParserOptions, ParserPlugin, StatementInfo, TableName,
};

#[derive(Debug, Default)]
pub struct PgClassifier {
    options: ParserOptions,
}

impl ParserPlugin for PgClassifier {
    fn setup(&mut self, options: ParserOptions) {
        self.options = options;
    }

    fn parse(&self, sql: &[u8], collect: CollectLevel) -> StatementInfo {
        let mut info = StatementInfo {
            canonical: canonicalize(sql),
            collected: collect,
            ..Default::default()
        };
        let tokens = Tokenizer::tokens(sql);
        let Some(first) = tokens.first().and_then(Token::word).map(str::to_string)
        else {
            info.result = ParseResult::Invalid;
            return info;
        };
        info.result = ParseResult::Parsed;

        match first.to_ascii_uppercase().as_str() {
            "SELECT" | "TABLE" | "VALUES" | "WITH" => {
                info.operation = Operation::Select;
                info.type_mask = TypeMask::READ;
                if tokens
                    .iter()
                    .any(|t| t.is_word("FOR"))
                    && tokens.iter().any(|t| t.is_word("UPDATE") || t.is_word("SHARE"))
                {
                    info.type_mask |= TypeMask::WRITE;
                }
                collect_from_tables(&tokens, collect, &mut info);
            }
            "INSERT" | "UPDATE" | "DELETE" | "COPY" | "MERGE" => {
                info.operation = match first.to_ascii_uppercase().as_str() {
                    "INSERT" => Operation::Insert,
                    "UPDATE" => Operation::Update,
                    "DELETE" => Operation::Delete,
                    _ => Operation::Load,
                };
                info.type_mask = TypeMask::WRITE;
                collect_from_tables(&tokens, collect, &mut info);
            }
            "BEGIN" => {
                info.type_mask = TypeMask::BEGIN_TRX;
                apply_access_mode(&tokens, &mut info);
            }
            "START" => {
                info.type_mask = TypeMask::BEGIN_TRX;
                apply_access_mode(&tokens, &mut info);
            }
            "COMMIT" | "END" => info.type_mask = TypeMask::COMMIT,
            "ROLLBACK" | "ABORT" => info.type_mask = TypeMask::ROLLBACK,
            "SET" => {
                info.operation = Operation::Set;
                info.type_mask = TypeMask::SESSION_WRITE | TypeMask::GSYSVAR_WRITE;
                if tokens.iter().any(|t| t.is_word("TRANSACTION")) {
                    info.type_mask |= TypeMask::NEXT_TRX;
                    apply_access_mode(&tokens, &mut info);
                }
            }
            "SHOW" => {
                info.operation = Operation::Show;
                info.type_mask = TypeMask::GSYSVAR_READ;
            }
            "PREPARE" => {
                info.operation = Operation::Prepare;
                info.type_mask = TypeMask::PREPARE_NAMED_STMT;
                info.prepare_name = tokens.get(1).and_then(Token::ident).map(str::to_string);
            }
            "EXECUTE" => {
                info.operation = Operation::Execute;
                info.type_mask = TypeMask::EXEC_STMT;
                info.prepare_name = tokens.get(1).and_then(Token::ident).map(str::to_string);
            }
            "DEALLOCATE" => {
                info.type_mask = TypeMask::DEALLOC_PREPARE;
                info.prepare_name = tokens.last().and_then(Token::ident).map(str::to_string);
            }
            "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "GRANT" | "REVOKE" | "VACUUM"
            | "REINDEX" | "CLUSTER" => {
                info.type_mask = TypeMask::WRITE;
                collect_from_tables(&tokens, collect, &mut info);
            }
            "EXPLAIN" => {
                info.operation = Operation::Explain;
                info.type_mask = TypeMask::READ;
            }
            "LISTEN" | "NOTIFY" | "UNLISTEN" | "DISCARD" | "RESET" => {
                info.type_mask = TypeMask::SESSION_WRITE;
            }
            _ => {
                info.result = ParseResult::Tokenized;
                info.type_mask = TypeMask::UNKNOWN;
            }
        }
        info
    }
}

fn apply_access_mode(tokens: &[Token], info: &mut StatementInfo) {
    for (i, token) in tokens.iter().enumerate() {
        if token.is_word("READ") {
            match tokens.get(i + 1) {
                Some(t) if t.is_word("ONLY") => info.type_mask |= TypeMask::READONLY,
                Some(t) if t.is_word("WRITE") => info.type_mask |= TypeMask::READWRITE,
                _ => {}
            }
        }
    }
}

fn collect_from_tables(tokens: &[Token], collect: CollectLevel, info: &mut StatementInfo) {
    if !collect.intersects(CollectLevel::TABLES | CollectLevel::DATABASES) {
        return;
    }
    let mut i = 0;
    while i < tokens.len() {
        let trigger = matches!(
            tokens[i].word().map(str::to_ascii_uppercase).as_deref(),
            Some("FROM" | "JOIN" | "INTO" | "TABLE" | "ONLY")
        );
        if trigger {
            if let Some(name) = tokens.get(i + 1).and_then(Token::ident) {
                // schema.table
                let table = if matches!(tokens.get(i + 2), Some(Token::Punct(b'.'))) {
                    match tokens.get(i + 3).and_then(Token::ident) {
                        Some(t) => TableName::new(Some(name), t),
                        None => TableName::new(None, name),
                    }
                } else {
                    TableName::new(None, name)
                };
                if let Some(db) = table.db.clone() {
                    if !info.databases.contains(&db) {
                        info.databases.push(db);
                    }
                }
                if !info.tables.contains(&table) {
                    info.tables.push(table);
                }
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(sql: &[u8]) -> StatementInfo {
        PgClassifier::default().parse(sql, CollectLevel::ALL)
    }

    #[test]
    fn select_is_read() {
        let info = parse(b"SELECT * FROM public.users");
        assert_eq!(info.type_mask, TypeMask::READ);
        assert_eq!(info.tables, vec![TableName::new(Some("public"), "users")]);
    }

    #[test]
    fn writes() {
        assert!(parse(b"INSERT INTO t VALUES (1)")
            .type_mask
            .contains(TypeMask::WRITE));
        assert!(parse(b"COPY t FROM STDIN").type_mask.contains(TypeMask::WRITE));
        assert!(parse(b"VACUUM FULL t").type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn transaction_modes() {
        let ro = parse(b"BEGIN READ ONLY");
        assert!(ro.type_mask.contains(TypeMask::BEGIN_TRX));
        assert!(ro.type_mask.contains(TypeMask::READONLY));
        assert_eq!(parse(b"END").type_mask, TypeMask::COMMIT);
        assert_eq!(parse(b"ABORT").type_mask, TypeMask::ROLLBACK);
    }

    #[test]
    fn session_statements() {
        assert!(parse(b"SET search_path TO app")
            .type_mask
            .contains(TypeMask::SESSION_WRITE));
        assert!(parse(b"DISCARD ALL")
            .type_mask
            .contains(TypeMask::SESSION_WRITE));
    }

    #[test]
    fn named_prepare() {
        let info = parse(b"PREPARE q1 AS SELECT 1");
        assert_eq!(info.type_mask, TypeMask::PREPARE_NAMED_STMT);
        assert_eq!(info.prepare_name.as_deref(), Some("q1"));
    }
}
