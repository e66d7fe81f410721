//! MariaDB statement classifier. Walks the token stream once and produces
//! the type mask, operation, referenced tables/databases/fields/functions,
//! the canonical form and the special descriptors (PREPARE body, KILL).

use crate::parser::builtin_functions::is_builtin_readonly_function;
use crate::parser::canonical::canonicalize;
use crate::parser::tokenizer::{Token, Tokenizer};
use crate::parser::type_mask::{Operation, TypeMask};
use crate::parser::{
    CollectLevel, FieldContext, FieldInfo, FunctionInfo, KillInfo, KillTarget, ParseResult,
    ParserOptions, ParserPlugin, StatementInfo, TableName,
};

#[derive(Debug, Default)]
pub struct MariaDbClassifier {
    options: ParserOptions,
}

impl MariaDbClassifier {
    pub fn new(options: ParserOptions) -> Self {
        Self { options }
    }
}

impl ParserPlugin for MariaDbClassifier {
    fn setup(&mut self, options: ParserOptions) {
        self.options = options;
    }

    fn parse(&self, sql: &[u8], collect: CollectLevel) -> StatementInfo {
        let mut ctx = ClassifyContext::new(&self.options, collect);
        ctx.run(sql);
        ctx.into_info()
    }
}

/// Keywords that look like function calls when followed by `(` but are not.
const NON_FUNCTION_WORDS: &[&str] = &[
    "all", "and", "any", "as", "asc", "between", "by", "case", "cross", "desc", "distinct",
    "else", "end", "exists", "from", "group", "having", "in", "inner", "into", "is", "join",
    "key", "left", "like", "limit", "not", "null", "on", "or", "order", "outer", "primary",
    "right", "select", "set", "some", "straight_join", "then", "union", "unique", "using",
    "values", "when", "where", "xor",
];

/// Sequence pseudo-functions, always writes.
const SEQUENCE_FUNCTIONS: &[&str] = &["currval", "lastval", "nextval", "setval"];

fn is_keyword(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    NON_FUNCTION_WORDS.binary_search(&lower.as_str()).is_ok()
}

struct ClassifyContext<'a> {
    options: &'a ParserOptions,
    collect: CollectLevel,
    info: StatementInfo,
}

impl<'a> ClassifyContext<'a> {
    fn new(options: &'a ParserOptions, collect: CollectLevel) -> Self {
        Self {
            options,
            collect,
            info: StatementInfo {
                collected: collect,
                ..Default::default()
            },
        }
    }

    fn into_info(self) -> StatementInfo {
        self.info
    }

    fn run(&mut self, sql: &[u8]) {
        self.info.canonical = canonicalize(sql);
        let tokens = Tokenizer::tokens(sql);

        // leading parens of e.g. "(SELECT ...) UNION ..." are transparent
        let mut start = 0;
        while matches!(tokens.get(start), Some(Token::Punct(b'('))) {
            start += 1;
        }
        let Some(first) = tokens.get(start).and_then(Token::word).map(str::to_string)
        else {
            self.info.result = ParseResult::Invalid;
            return;
        };
        let tokens = &tokens[start..];
        self.info.result = ParseResult::Parsed;

        match first.to_ascii_uppercase().as_str() {
            "SELECT" | "WITH" => self.classify_select(tokens),
            "INSERT" => self.classify_dml(tokens, Operation::Insert),
            "REPLACE" => self.classify_dml(tokens, Operation::Replace),
            "UPDATE" => self.classify_dml(tokens, Operation::Update),
            "DELETE" => self.classify_dml(tokens, Operation::Delete),
            "TRUNCATE" => self.classify_dml(tokens, Operation::Truncate),
            "CREATE" => self.classify_create(tokens),
            "DROP" => self.classify_drop(tokens),
            "ALTER" => {
                self.info.operation = Operation::AlterTable;
                self.info.type_mask = TypeMask::WRITE;
                self.scan_tables(tokens);
            }
            "RENAME" => {
                self.info.operation = Operation::AlterTable;
                self.info.type_mask = TypeMask::WRITE;
                self.scan_tables(tokens);
            }
            "LOAD" => {
                let local = tokens.iter().any(|t| t.is_word("LOCAL"));
                self.info.operation = if local {
                    Operation::LoadLocal
                } else {
                    Operation::Load
                };
                self.info.type_mask = TypeMask::WRITE;
                self.scan_tables(tokens);
            }
            "BEGIN" => {
                self.info.type_mask = TypeMask::BEGIN_TRX;
            }
            "START" => {
                self.info.type_mask = TypeMask::BEGIN_TRX;
                self.apply_trx_access_mode(tokens);
            }
            "COMMIT" => {
                self.info.type_mask = TypeMask::COMMIT;
            }
            "ROLLBACK" => {
                self.info.type_mask = TypeMask::ROLLBACK;
            }
            "SET" => self.classify_set(tokens),
            "USE" => {
                self.info.operation = Operation::ChangeDb;
                self.info.type_mask = TypeMask::SESSION_WRITE;
                if let Some(db) = tokens.get(1).and_then(Token::ident) {
                    self.add_database(db);
                }
            }
            "SHOW" => self.classify_show(tokens),
            "PREPARE" => self.classify_prepare(tokens),
            "EXECUTE" => {
                self.info.operation = Operation::Execute;
                self.info.type_mask = TypeMask::EXEC_STMT;
                self.info.prepare_name =
                    tokens.get(1).and_then(Token::ident).map(str::to_string);
            }
            "DEALLOCATE" => {
                self.info.type_mask = TypeMask::DEALLOC_PREPARE;
                self.info.prepare_name =
                    tokens.get(2).and_then(Token::ident).map(str::to_string);
            }
            "KILL" => self.classify_kill(tokens),
            "CALL" => {
                self.info.operation = Operation::Call;
                self.info.type_mask = TypeMask::WRITE;
            }
            "GRANT" => {
                self.info.operation = Operation::Grant;
                self.info.type_mask = TypeMask::WRITE;
            }
            "REVOKE" => {
                self.info.operation = Operation::Revoke;
                self.info.type_mask = TypeMask::WRITE;
            }
            "DESC" | "DESCRIBE" | "EXPLAIN" => {
                self.info.operation = Operation::Explain;
                self.info.type_mask = TypeMask::READ;
                self.scan_tables(tokens);
            }
            "HANDLER" => {
                self.info.type_mask = TypeMask::READ | TypeMask::MASTER_READ;
                self.scan_tables(tokens);
            }
            "LOCK" | "UNLOCK" | "FLUSH" | "ANALYZE" | "OPTIMIZE" | "REPAIR" | "CHECK"
            | "CHECKSUM" | "XA" | "INSTALL" | "UNINSTALL" => {
                self.info.result = ParseResult::Tokenized;
                self.info.type_mask = TypeMask::WRITE;
            }
            _ => {
                self.info.result = ParseResult::Tokenized;
                self.info.type_mask = TypeMask::UNKNOWN;
            }
        }
    }

    fn add_database(&mut self, db: &str) {
        if self.collect.intersects(CollectLevel::DATABASES) {
            let owned = db.to_string();
            if !self.info.databases.contains(&owned) {
                self.info.databases.push(owned);
            }
        }
    }

    fn add_table(&mut self, table: TableName) {
        if let Some(db) = &table.db {
            let db = db.clone();
            self.add_database(&db);
        }
        if self.collect.intersects(CollectLevel::TABLES)
            && !self.info.tables.contains(&table)
        {
            self.info.tables.push(table);
        }
    }

    fn add_field(&mut self, name: &str, context: FieldContext) {
        if self.collect.intersects(CollectLevel::FIELDS) {
            self.info.fields.push(FieldInfo {
                name: name.to_string(),
                context,
            });
        }
    }

    fn add_function(&mut self, function: FunctionInfo) {
        if self.collect.intersects(CollectLevel::FUNCTIONS) {
            self.info.functions.push(function);
        }
    }

    /// Classify one function reference and fold its routing effect into the
    /// type mask.
    fn apply_function(&mut self, name: &str) {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "last_insert_id" => {
                self.info.type_mask |= TypeMask::MASTER_READ;
            }
            "found_rows" => {
                self.info.relates_to_previous = true;
            }
            _ if SEQUENCE_FUNCTIONS.binary_search(&lower.as_str()).is_ok() => {
                self.info.type_mask |= TypeMask::WRITE;
            }
            _ if is_builtin_readonly_function(
                &lower,
                self.options.server_version,
                self.options.sql_mode_oracle,
            ) => {}
            // unknown functions may have side effects
            _ => {
                self.info.type_mask |= TypeMask::WRITE;
            }
        }
    }

    /// Parse `ident`, `db.ident` or `db`.`ident` starting at `i`.
    /// Returns the name and the index one past it.
    fn table_ref(tokens: &[Token], i: usize) -> Option<(TableName, usize)> {
        let first = tokens.get(i)?.ident()?;
        if matches!(tokens.get(i + 1), Some(Token::Punct(b'.'))) {
            let table = tokens.get(i + 2)?.ident()?;
            Some((TableName::new(Some(first), table), i + 3))
        } else {
            Some((TableName::new(None, first), i + 1))
        }
    }

    /// Walk the token stream collecting table references after FROM / JOIN /
    /// INTO / UPDATE / TABLE keywords.
    fn scan_tables(&mut self, tokens: &[Token]) {
        let mut i = 0;
        while i < tokens.len() {
            let expect_table = match &tokens[i] {
                Token::Word(w) => {
                    let upper = w.to_ascii_uppercase();
                    matches!(upper.as_str(), "FROM" | "JOIN" | "INTO" | "TABLE")
                        || (upper == "UPDATE" && i == 0)
                }
                _ => false,
            };
            if expect_table {
                let mut at = i + 1;
                loop {
                    match Self::table_ref(tokens, at) {
                        Some((table, next)) => {
                            self.add_table(table);
                            at = next;
                            // a comma continues the table list
                            let mut skip = at;
                            // skip optional alias
                            if let Some(Token::Word(alias)) = tokens.get(skip) {
                                let upper = alias.to_ascii_uppercase();
                                if upper == "AS" {
                                    skip += 2;
                                } else if !is_keyword(alias) {
                                    skip += 1;
                                }
                            }
                            if matches!(tokens.get(skip), Some(Token::Punct(b','))) {
                                at = skip + 1;
                                continue;
                            }
                            i = skip;
                            break;
                        }
                        None => {
                            i = at;
                            break;
                        }
                    }
                }
            }
            i += 1;
        }
    }

    fn classify_select(&mut self, tokens: &[Token]) {
        self.info.operation = Operation::Select;
        self.info.type_mask = TypeMask::READ;
        self.scan_tables(tokens);
        self.scan_expressions(tokens);

        let mut i = 0;
        while i < tokens.len() {
            if let Token::Word(w) = &tokens[i] {
                let upper = w.to_ascii_uppercase();
                match upper.as_str() {
                    "INTO" => match tokens.get(i + 1) {
                        Some(Token::Word(target))
                            if target.eq_ignore_ascii_case("OUTFILE")
                                || target.eq_ignore_ascii_case("DUMPFILE") =>
                        {
                            self.info.type_mask |= TypeMask::WRITE;
                        }
                        Some(Token::UserVar(_)) => {
                            self.info.type_mask |= TypeMask::GSYSVAR_WRITE;
                        }
                        _ => {}
                    },
                    // SELECT ... FOR UPDATE and LOCK IN SHARE MODE lock rows
                    "FOR" => {
                        if matches!(tokens.get(i + 1), Some(t) if t.is_word("UPDATE")) {
                            self.info.type_mask |= TypeMask::WRITE;
                        }
                    }
                    "LOCK" => {
                        if matches!(tokens.get(i + 1), Some(t) if t.is_word("IN")) {
                            self.info.type_mask |= TypeMask::WRITE;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
    }

    /// Shared expression walk: variables, function references, fields.
    fn scan_expressions(&mut self, tokens: &[Token]) {
        let mut i = 0;
        // paren stack: true when the paren opened a subquery
        let mut subquery_stack: Vec<bool> = Vec::new();
        let mut in_union = false;
        let mut expect_from_list = false;

        while i < tokens.len() {
            match &tokens[i] {
                Token::Punct(b'(') => {
                    let is_subquery =
                        matches!(tokens.get(i + 1), Some(t) if t.is_word("SELECT"));
                    subquery_stack.push(is_subquery);
                }
                Token::Punct(b')') => {
                    subquery_stack.pop();
                }
                Token::SysVar(name) => {
                    let plain = name
                        .rsplit('.')
                        .next()
                        .unwrap_or(name)
                        .to_ascii_lowercase();
                    if plain == "identity" || plain == "last_insert_id" {
                        self.info.type_mask |= TypeMask::MASTER_READ;
                    } else {
                        self.info.type_mask |= TypeMask::SYSVAR_READ;
                    }
                }
                Token::UserVar(_) => {
                    if matches!(tokens.get(i + 1), Some(Token::Assign)) {
                        self.info.type_mask |= TypeMask::USERVAR_WRITE;
                    } else {
                        self.info.type_mask |= TypeMask::USERVAR_READ;
                    }
                }
                Token::Word(w) if w.eq_ignore_ascii_case("UNION") => {
                    in_union = true;
                }
                Token::Word(w)
                    if w.eq_ignore_ascii_case("FROM") || w.eq_ignore_ascii_case("JOIN") =>
                {
                    expect_from_list = true;
                }
                Token::Word(w)
                    if w.eq_ignore_ascii_case("WHERE")
                        || w.eq_ignore_ascii_case("GROUP")
                        || w.eq_ignore_ascii_case("HAVING")
                        || w.eq_ignore_ascii_case("ORDER")
                        || w.eq_ignore_ascii_case("SELECT") =>
                {
                    expect_from_list = false;
                }
                Token::Word(w) => {
                    if matches!(tokens.get(i + 1), Some(Token::Punct(b'('))) {
                        if !is_keyword(w) {
                            let mut function = FunctionInfo {
                                name: w.to_ascii_lowercase(),
                                fields: Vec::new(),
                            };
                            // argument fields of this call, one level deep
                            let mut depth = 0;
                            let mut j = i + 1;
                            while j < tokens.len() {
                                match &tokens[j] {
                                    Token::Punct(b'(') => depth += 1,
                                    Token::Punct(b')') => {
                                        depth -= 1;
                                        if depth == 0 {
                                            break;
                                        }
                                    }
                                    Token::Word(arg)
                                        if depth == 1
                                            && !is_keyword(arg)
                                            && !matches!(
                                                tokens.get(j + 1),
                                                Some(Token::Punct(b'('))
                                            ) =>
                                    {
                                        function.fields.push(FieldInfo {
                                            name: arg.clone(),
                                            context: FieldContext::default(),
                                        });
                                    }
                                    _ => {}
                                }
                                j += 1;
                            }
                            self.apply_function(&function.name);
                            self.add_function(function);
                        }
                    } else if !is_keyword(w) && !expect_from_list {
                        // a bare column reference; strip the table qualifier
                        let qualified =
                            matches!(tokens.get(i + 1), Some(Token::Punct(b'.')));
                        if qualified {
                            i += 1; // the field is the token after the dot
                        } else {
                            let mut context = FieldContext::default();
                            if subquery_stack.iter().any(|s| *s) {
                                context |= FieldContext::SUBQUERY;
                            }
                            if in_union {
                                context |= FieldContext::UNION;
                            }
                            self.add_field(w, context);
                        }
                    }
                }
                Token::Punct(b'-') if self.options.unary_minus_is_function => {
                    let prefix_position = i == 0
                        || matches!(
                            tokens.get(i - 1),
                            Some(Token::Punct(b'(') | Token::Punct(b',') | Token::Punct(b'='))
                                | Some(Token::Assign)
                        );
                    if prefix_position
                        && matches!(tokens.get(i + 1), Some(Token::Number(_)))
                    {
                        self.add_function(FunctionInfo {
                            name: "-".to_string(),
                            fields: Vec::new(),
                        });
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    fn classify_dml(&mut self, tokens: &[Token], operation: Operation) {
        self.info.operation = operation;
        self.info.type_mask = TypeMask::WRITE;
        self.scan_tables(tokens);
        // subqueries and variable references inside DML still matter
        self.scan_expression_side_effects(tokens);
    }

    /// Variable reads/writes inside a write statement; function upgrades are
    /// irrelevant since the statement already writes.
    fn scan_expression_side_effects(&mut self, tokens: &[Token]) {
        for (i, token) in tokens.iter().enumerate() {
            match token {
                Token::UserVar(_) => {
                    if matches!(tokens.get(i + 1), Some(Token::Assign)) {
                        self.info.type_mask |= TypeMask::USERVAR_WRITE;
                    } else {
                        self.info.type_mask |= TypeMask::USERVAR_READ;
                    }
                }
                Token::SysVar(_) => {
                    self.info.type_mask |= TypeMask::SYSVAR_READ;
                }
                _ => {}
            }
        }
    }

    fn classify_create(&mut self, tokens: &[Token]) {
        let mut i = 1;
        let mut temporary = false;
        while let Some(Token::Word(w)) = tokens.get(i) {
            let upper = w.to_ascii_uppercase();
            match upper.as_str() {
                "TEMPORARY" => {
                    temporary = true;
                    i += 1;
                }
                "OR" | "REPLACE" | "IF" | "NOT" | "EXISTS" | "UNIQUE" | "FULLTEXT"
                | "SPATIAL" => i += 1,
                "TABLE" => {
                    self.info.operation = Operation::CreateTable;
                    self.info.type_mask = TypeMask::WRITE;
                    if temporary {
                        self.info.type_mask |= TypeMask::CREATE_TMP_TABLE;
                    }
                    self.scan_tables(&tokens[i..]);
                    return;
                }
                "DATABASE" | "SCHEMA" => {
                    self.info.operation = Operation::CreateDb;
                    self.info.type_mask = TypeMask::WRITE;
                    if let Some(db) = tokens.get(i + 1).and_then(Token::ident) {
                        self.add_database(db);
                    }
                    return;
                }
                _ => break,
            }
        }
        // CREATE INDEX / VIEW / TRIGGER / PROCEDURE / SEQUENCE ...
        self.info.operation = Operation::CreateTable;
        self.info.type_mask = TypeMask::WRITE;
        self.scan_tables(tokens);
    }

    fn classify_drop(&mut self, tokens: &[Token]) {
        match tokens.get(1) {
            Some(t) if t.is_word("TABLE") || t.is_word("TEMPORARY") => {
                self.info.operation = Operation::DropTable;
                self.info.type_mask = TypeMask::WRITE;
                self.scan_tables(tokens);
            }
            Some(t) if t.is_word("DATABASE") || t.is_word("SCHEMA") => {
                self.info.operation = Operation::DropDb;
                self.info.type_mask = TypeMask::WRITE;
                if let Some(db) = tokens.get(2).and_then(Token::ident) {
                    self.add_database(db);
                }
            }
            Some(t) if t.is_word("PREPARE") => {
                self.info.type_mask = TypeMask::DEALLOC_PREPARE;
                self.info.prepare_name =
                    tokens.get(2).and_then(Token::ident).map(str::to_string);
            }
            _ => {
                self.info.operation = Operation::DropTable;
                self.info.type_mask = TypeMask::WRITE;
            }
        }
    }

    fn apply_trx_access_mode(&mut self, tokens: &[Token]) {
        for (i, token) in tokens.iter().enumerate() {
            if token.is_word("READ") {
                match tokens.get(i + 1) {
                    Some(t) if t.is_word("ONLY") => self.info.type_mask |= TypeMask::READONLY,
                    Some(t) if t.is_word("WRITE") => {
                        self.info.type_mask |= TypeMask::READWRITE
                    }
                    _ => {}
                }
            }
        }
    }

    fn classify_set(&mut self, tokens: &[Token]) {
        self.info.operation = Operation::Set;
        let mut i = 1;
        let mut mask = TypeMask::empty();

        while i < tokens.len() {
            match &tokens[i] {
                Token::UserVar(_) => {
                    mask |= TypeMask::USERVAR_WRITE;
                    i = skip_assignment(tokens, i + 1);
                }
                Token::SysVar(_) => {
                    mask |= TypeMask::SESSION_WRITE | TypeMask::GSYSVAR_WRITE;
                    i = skip_assignment(tokens, i + 1);
                }
                Token::Word(w) => {
                    let upper = w.to_ascii_uppercase();
                    match upper.as_str() {
                        "GLOBAL" | "SESSION" | "LOCAL" => i += 1,
                        "TRANSACTION" => {
                            mask |= TypeMask::SESSION_WRITE | TypeMask::NEXT_TRX;
                            self.apply_trx_access_mode(&tokens[i..]);
                            mask |= self.info.type_mask
                                & (TypeMask::READONLY | TypeMask::READWRITE);
                            i = tokens.len();
                        }
                        "AUTOCOMMIT" => {
                            mask |= TypeMask::SESSION_WRITE;
                            match autocommit_value(tokens, i + 1) {
                                Some(true) => mask |= TypeMask::ENABLE_AUTOCOMMIT,
                                Some(false) => mask |= TypeMask::DISABLE_AUTOCOMMIT,
                                None => {}
                            }
                            i = skip_assignment(tokens, i + 1);
                        }
                        "NAMES" | "CHARACTER" | "CHARSET" => {
                            mask |= TypeMask::SESSION_WRITE | TypeMask::GSYSVAR_WRITE;
                            i = skip_assignment(tokens, i + 1);
                        }
                        "PASSWORD" => {
                            mask |= TypeMask::WRITE;
                            i = tokens.len();
                        }
                        _ => {
                            // a plain variable name
                            mask |= TypeMask::SESSION_WRITE | TypeMask::GSYSVAR_WRITE;
                            i = skip_assignment(tokens, i + 1);
                        }
                    }
                }
                Token::Punct(b',') => i += 1,
                _ => i += 1,
            }
        }
        self.info.type_mask = mask;
    }

    fn classify_show(&mut self, tokens: &[Token]) {
        self.info.operation = Operation::Show;
        let mut words = tokens.iter().skip(1).filter_map(Token::word);
        let mut subject = words.next().map(|w| w.to_ascii_uppercase());
        // SHOW FULL TABLES / SHOW GLOBAL VARIABLES ...
        if matches!(subject.as_deref(), Some("FULL" | "GLOBAL" | "SESSION")) {
            subject = words.next().map(|w| w.to_ascii_uppercase());
        }
        self.info.type_mask = match subject.as_deref() {
            Some("DATABASES" | "SCHEMAS") => TypeMask::SHOW_DATABASES,
            Some("TABLES") => TypeMask::SHOW_TABLES,
            Some("VARIABLES") => TypeMask::GSYSVAR_READ,
            Some("MASTER" | "BINLOG" | "SLAVE" | "REPLICA") => TypeMask::MASTER_READ,
            _ => TypeMask::READ,
        };
    }

    fn classify_prepare(&mut self, tokens: &[Token]) {
        self.info.operation = Operation::Prepare;
        self.info.type_mask = TypeMask::PREPARE_NAMED_STMT;
        self.info.prepare_name = tokens.get(1).and_then(Token::ident).map(str::to_string);
        // PREPARE name FROM '...'
        if let Some(Token::StringLit(body)) = tokens
            .iter()
            .skip(2)
            .find(|t| matches!(t, Token::StringLit(_)))
        {
            self.info.preparable_stmt = Some(body.as_bytes().to_vec());
        }
    }

    fn classify_kill(&mut self, tokens: &[Token]) {
        self.info.operation = Operation::Kill;
        let mut soft = true;
        let mut target = KillTarget::Connection;
        let mut id = None;
        let mut user = None;

        let mut i = 1;
        while i < tokens.len() {
            match &tokens[i] {
                Token::Word(w) => {
                    let upper = w.to_ascii_uppercase();
                    match upper.as_str() {
                        "HARD" => soft = false,
                        "SOFT" => soft = true,
                        "CONNECTION" => target = KillTarget::Connection,
                        "QUERY" => {
                            target = KillTarget::Query;
                            if matches!(tokens.get(i + 1), Some(t) if t.is_word("ID")) {
                                target = KillTarget::QueryId;
                                i += 1;
                            }
                        }
                        "USER" => {
                            user = tokens.get(i + 1).and_then(Token::ident).map(str::to_string);
                            i += 1;
                        }
                        _ => {}
                    }
                }
                Token::Number(n) => {
                    id = n.parse::<u64>().ok();
                }
                _ => {}
            }
            i += 1;
        }

        if id.is_some() || user.is_some() {
            self.info.kill = Some(KillInfo {
                soft,
                target,
                id: id.unwrap_or(0),
                user,
            });
        } else {
            self.info.result = ParseResult::PartiallyParsed;
        }
    }
}

/// Skip past `= value` / `:= value` up to the next comma at depth 0.
fn skip_assignment(tokens: &[Token], mut i: usize) -> usize {
    let mut depth = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Punct(b'(') => depth += 1,
            Token::Punct(b')') => depth -= 1,
            Token::Punct(b',') if depth == 0 => return i,
            _ => {}
        }
        i += 1;
    }
    i
}

fn autocommit_value(tokens: &[Token], i: usize) -> Option<bool> {
    // the token after '='
    let value = tokens.get(i + 1)?;
    match value {
        Token::Number(n) => Some(n != "0"),
        Token::Word(w) => {
            if w.eq_ignore_ascii_case("ON") || w.eq_ignore_ascii_case("TRUE") {
                Some(true)
            } else if w.eq_ignore_ascii_case("OFF") || w.eq_ignore_ascii_case("FALSE") {
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(sql: &[u8]) -> StatementInfo {
        MariaDbClassifier::default().parse(sql, CollectLevel::ALL)
    }

    #[test]
    fn plain_select_is_read() {
        let info = parse_all(b"SELECT a, b FROM db1.t1 WHERE a = 1");
        assert_eq!(info.result, ParseResult::Parsed);
        assert_eq!(info.operation, Operation::Select);
        assert_eq!(info.type_mask, TypeMask::READ);
        assert_eq!(info.tables, vec![TableName::new(Some("db1"), "t1")]);
        assert_eq!(info.databases, vec!["db1".to_string()]);
        assert_eq!(info.canonical, "SELECT a, b FROM db1.t1 WHERE a = ?");
    }

    #[test]
    fn select_into_outfile_is_write() {
        let info = parse_all(b"SELECT * FROM t INTO OUTFILE '/tmp/x'");
        assert!(info.type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn select_into_var_is_gsysvar_write() {
        let info = parse_all(b"SELECT a FROM t INTO @x");
        assert!(info.type_mask.contains(TypeMask::GSYSVAR_WRITE));
    }

    #[test]
    fn select_for_update_is_write() {
        let info = parse_all(b"SELECT a FROM t FOR UPDATE");
        assert!(info.type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn uservar_sides() {
        let read = parse_all(b"SELECT @x");
        assert!(read.type_mask.contains(TypeMask::USERVAR_READ));

        let write = parse_all(b"SELECT @x := 1");
        assert!(write.type_mask.contains(TypeMask::USERVAR_WRITE));
    }

    #[test]
    fn identity_sysvars_are_master_reads() {
        for sql in [&b"SELECT @@identity"[..], b"SELECT @@last_insert_id"] {
            let info = parse_all(sql);
            assert!(info.type_mask.contains(TypeMask::MASTER_READ), "{sql:?}");
        }
        let info = parse_all(b"SELECT @@server_id");
        assert!(info.type_mask.contains(TypeMask::SYSVAR_READ));
        assert!(!info.type_mask.contains(TypeMask::MASTER_READ));
    }

    #[test]
    fn last_insert_id_function_is_master_read() {
        let info = parse_all(b"SELECT LAST_INSERT_ID()");
        assert!(info.type_mask.contains(TypeMask::MASTER_READ));
    }

    #[test]
    fn found_rows_relates_to_previous() {
        let info = parse_all(b"SELECT FOUND_ROWS()");
        assert!(info.relates_to_previous);
    }

    #[test]
    fn unknown_function_upgrades_to_write() {
        let info = parse_all(b"SELECT my_udf(a) FROM t");
        assert!(info.type_mask.contains(TypeMask::WRITE));
        assert_eq!(info.functions.len(), 1);
        assert_eq!(info.functions[0].name, "my_udf");
        assert_eq!(info.functions[0].fields[0].name, "a");
    }

    #[test]
    fn sequence_function_is_write() {
        let info = parse_all(b"SELECT NEXTVAL(seq1)");
        assert!(info.type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn builtin_function_stays_read() {
        let info = parse_all(b"SELECT COUNT(*), MAX(b) FROM t");
        assert_eq!(info.type_mask, TypeMask::READ);
    }

    #[test]
    fn create_temporary_table() {
        let info = parse_all(b"CREATE TEMPORARY TABLE db.t (a INT)");
        assert!(info.type_mask.contains(TypeMask::CREATE_TMP_TABLE));
        assert!(info.type_mask.contains(TypeMask::WRITE));
        assert_eq!(info.tables, vec![TableName::new(Some("db"), "t")]);
    }

    #[test]
    fn drop_table_collects_names() {
        let info = parse_all(b"DROP TABLE db.t");
        assert_eq!(info.operation, Operation::DropTable);
        assert_eq!(info.tables, vec![TableName::new(Some("db"), "t")]);
    }

    #[test]
    fn transactions() {
        assert_eq!(parse_all(b"BEGIN").type_mask, TypeMask::BEGIN_TRX);
        assert_eq!(
            parse_all(b"START TRANSACTION READ ONLY").type_mask,
            TypeMask::BEGIN_TRX | TypeMask::READONLY
        );
        assert_eq!(
            parse_all(b"START TRANSACTION READ WRITE").type_mask,
            TypeMask::BEGIN_TRX | TypeMask::READWRITE
        );
        assert_eq!(parse_all(b"COMMIT").type_mask, TypeMask::COMMIT);
        assert_eq!(parse_all(b"ROLLBACK").type_mask, TypeMask::ROLLBACK);
    }

    #[test]
    fn set_statements() {
        let enable = parse_all(b"SET autocommit=1");
        assert!(enable.type_mask.contains(TypeMask::ENABLE_AUTOCOMMIT));
        assert!(enable.type_mask.contains(TypeMask::SESSION_WRITE));

        let disable = parse_all(b"SET autocommit = OFF");
        assert!(disable.type_mask.contains(TypeMask::DISABLE_AUTOCOMMIT));

        let user = parse_all(b"SET @x = 1");
        assert_eq!(user.type_mask, TypeMask::USERVAR_WRITE);

        let sys = parse_all(b"SET @@sort_buffer_size = 1000000");
        assert!(sys.type_mask.contains(TypeMask::GSYSVAR_WRITE));

        let next_trx = parse_all(b"SET TRANSACTION READ ONLY");
        assert!(next_trx.type_mask.contains(TypeMask::NEXT_TRX));
        assert!(next_trx.type_mask.contains(TypeMask::READONLY));
    }

    #[test]
    fn show_statements() {
        assert_eq!(
            parse_all(b"SHOW DATABASES").type_mask,
            TypeMask::SHOW_DATABASES
        );
        assert_eq!(parse_all(b"SHOW TABLES").type_mask, TypeMask::SHOW_TABLES);
        assert_eq!(
            parse_all(b"SHOW GLOBAL VARIABLES").type_mask,
            TypeMask::GSYSVAR_READ
        );
        assert_eq!(
            parse_all(b"SHOW MASTER STATUS").type_mask,
            TypeMask::MASTER_READ
        );
    }

    #[test]
    fn named_prepare_round_trip() {
        let info = parse_all(b"PREPARE stmt1 FROM 'SELECT * FROM t WHERE a = ?'");
        assert_eq!(info.type_mask, TypeMask::PREPARE_NAMED_STMT);
        assert_eq!(info.prepare_name.as_deref(), Some("stmt1"));
        assert_eq!(
            info.preparable_stmt.as_deref(),
            Some(&b"SELECT * FROM t WHERE a = ?"[..])
        );

        let exec = parse_all(b"EXECUTE stmt1");
        assert_eq!(exec.operation, Operation::Execute);
        assert_eq!(exec.prepare_name.as_deref(), Some("stmt1"));

        let dealloc = parse_all(b"DEALLOCATE PREPARE stmt1");
        assert_eq!(dealloc.type_mask, TypeMask::DEALLOC_PREPARE);
        assert_eq!(dealloc.prepare_name.as_deref(), Some("stmt1"));
    }

    #[test]
    fn kill_forms() {
        let basic = parse_all(b"KILL 42").kill.unwrap();
        assert_eq!(basic.id, 42);
        assert_eq!(basic.target, KillTarget::Connection);
        assert!(basic.soft);

        let hard_query = parse_all(b"KILL HARD QUERY 7").kill.unwrap();
        assert!(!hard_query.soft);
        assert_eq!(hard_query.target, KillTarget::Query);

        let query_id = parse_all(b"KILL QUERY ID 9").kill.unwrap();
        assert_eq!(query_id.target, KillTarget::QueryId);

        let user = parse_all(b"KILL USER alice").kill.unwrap();
        assert_eq!(user.user.as_deref(), Some("alice"));
    }

    #[test]
    fn use_statement() {
        let info = parse_all(b"USE shop");
        assert_eq!(info.operation, Operation::ChangeDb);
        assert_eq!(info.type_mask, TypeMask::SESSION_WRITE);
        assert_eq!(info.databases, vec!["shop".to_string()]);
    }

    #[test]
    fn classification_is_deterministic() {
        let sql = b"SELECT a, my_udf(b) FROM db1.t1 JOIN t2 WHERE c = 'x'";
        let first = parse_all(sql);
        let second = parse_all(sql);
        assert_eq!(first.type_mask, second.type_mask);
        assert_eq!(first.operation, second.operation);
        assert_eq!(first.tables, second.tables);
        assert_eq!(first.databases, second.databases);
        assert_eq!(first.canonical, second.canonical);
    }

    #[test]
    fn garbage_downgrades_result() {
        let info = parse_all(b"%%%");
        assert_eq!(info.result, ParseResult::Invalid);
        let partial = parse_all(b"FLUSH TABLES");
        assert_eq!(partial.result, ParseResult::Tokenized);
        assert!(partial.type_mask.contains(TypeMask::WRITE));
    }

    #[test]
    fn unary_minus_mode_switch() {
        let mut plugin = MariaDbClassifier::default();
        plugin.setup(ParserOptions {
            unary_minus_is_function: true,
            ..Default::default()
        });
        let info = plugin.parse(b"SELECT -1", CollectLevel::ALL);
        assert!(info.functions.iter().any(|f| f.name == "-"));

        let modern = MariaDbClassifier::default().parse(b"SELECT -1", CollectLevel::ALL);
        assert!(!modern.functions.iter().any(|f| f.name == "-"));
    }

    #[test]
    fn subquery_field_context() {
        let info = parse_all(b"SELECT a FROM t WHERE b IN (SELECT c FROM u)");
        let c_field = info.fields.iter().find(|f| f.name == "c").unwrap();
        assert!(c_field.context.contains(FieldContext::SUBQUERY));
        let a_field = info.fields.iter().find(|f| f.name == "a").unwrap();
        assert!(!a_field.context.contains(FieldContext::SUBQUERY));
    }
}
