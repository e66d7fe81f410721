pub mod builtin_functions;
pub mod canonical;
pub mod classifier;
pub mod hint;
pub mod multistmt;
pub mod pg_classifier;
pub mod tokenizer;
pub mod type_mask;

use crate::parser::type_mask::{Operation, TypeMask};
use bitflags::bitflags;

bitflags! {
    /// What a parse call is asked to collect. A later call demanding a
    /// strictly larger set than what a prior call produced triggers exactly
    /// one re-parse whose result is merged, capping per-packet parses at 2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CollectLevel: u8 {
        const ESSENTIALS = 0b0000_0001;
        const TABLES     = 0b0000_0010;
        const DATABASES  = 0b0000_0100;
        const FIELDS     = 0b0000_1000;
        const FUNCTIONS  = 0b0001_0000;
        const ALL        = 0b0001_1111;
    }
}

/// How far the parser got with a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ParseResult {
    Invalid,
    /// Only the leading keyword was recognized.
    Tokenized,
    PartiallyParsed,
    #[default]
    Parsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub db: Option<String>,
    pub table: String,
}

impl TableName {
    pub fn new(db: Option<&str>, table: &str) -> Self {
        Self {
            db: db.map(|d| d.to_string()),
            table: table.to_string(),
        }
    }

    /// `db.table`, falling back to `current_db` for unqualified names.
    pub fn qualified(&self, current_db: &str) -> String {
        match &self.db {
            Some(db) => format!("{}.{}", db, self.table),
            None => format!("{}.{}", current_db, self.table),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FieldContext: u8 {
        const SUBQUERY = 0b01;
        const UNION    = 0b10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldInfo {
    pub name: String,
    pub context: FieldContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionInfo {
    pub name: String,
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTarget {
    Connection,
    Query,
    QueryId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillInfo {
    pub soft: bool,
    pub target: KillTarget,
    pub id: u64,
    pub user: Option<String>,
}

/// Everything the classifier extracted from one statement. Attached to the
/// packet once and reused; only a strictly larger collection demand causes a
/// second (and final) parse.
#[derive(Debug, Clone, Default)]
pub struct StatementInfo {
    pub result: ParseResult,
    pub type_mask: TypeMask,
    pub operation: Operation,
    pub tables: Vec<TableName>,
    pub databases: Vec<String>,
    pub fields: Vec<FieldInfo>,
    pub functions: Vec<FunctionInfo>,
    pub prepare_name: Option<String>,
    /// Inner statement of `PREPARE name FROM '...'`.
    pub preparable_stmt: Option<Vec<u8>>,
    pub kill: Option<KillInfo>,
    pub canonical: String,
    /// FOUND_ROWS() and friends: route to the last-used backend.
    pub relates_to_previous: bool,
    pub collected: CollectLevel,
}

/// Parser behavior switches fixed at listener creation.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub sql_mode_oracle: bool,
    /// Pre-10.3 parsers report unary minus as a function reference.
    pub unary_minus_is_function: bool,
    pub server_version: (u32, u32, u32),
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            sql_mode_oracle: false,
            unary_minus_is_function: false,
            server_version: (10, 6, 0),
        }
    }
}

/// The protocol-pluggable parser boundary. A plugin is resolved once at
/// listener creation and used through this interface only.
pub trait ParserPlugin: Send + Sync {
    fn setup(&mut self, options: ParserOptions);
    /// Per-worker-thread hook, e.g. for a thread-local parser arena.
    fn thread_init(&self) {}
    fn thread_finish(&self) {}

    fn parse(&self, sql: &[u8], collect: CollectLevel) -> StatementInfo;

    fn get_type_mask(&self, sql: &[u8]) -> TypeMask {
        self.parse(sql, CollectLevel::ESSENTIALS).type_mask
    }

    fn get_operation(&self, sql: &[u8]) -> Operation {
        self.parse(sql, CollectLevel::ESSENTIALS).operation
    }

    fn get_canonical(&self, sql: &[u8]) -> String {
        self.parse(sql, CollectLevel::ESSENTIALS).canonical
    }

    fn get_table_names(&self, sql: &[u8]) -> Vec<TableName> {
        self.parse(sql, CollectLevel::TABLES).tables
    }

    fn get_database_names(&self, sql: &[u8]) -> Vec<String> {
        self.parse(sql, CollectLevel::DATABASES).databases
    }

    fn get_field_info(&self, sql: &[u8]) -> Vec<FieldInfo> {
        self.parse(sql, CollectLevel::FIELDS).fields
    }

    fn get_function_info(&self, sql: &[u8]) -> Vec<FunctionInfo> {
        self.parse(sql, CollectLevel::FUNCTIONS).functions
    }

    fn get_prepare_name(&self, sql: &[u8]) -> Option<String> {
        self.parse(sql, CollectLevel::ESSENTIALS).prepare_name
    }

    fn get_preparable_stmt(&self, sql: &[u8]) -> Option<Vec<u8>> {
        self.parse(sql, CollectLevel::ESSENTIALS).preparable_stmt
    }

    fn get_kill_info(&self, sql: &[u8]) -> Option<KillInfo> {
        self.parse(sql, CollectLevel::ESSENTIALS).kill
    }
}

/// Caches the parse result for one packet, enforcing the two-parse cap.
#[derive(Debug, Default)]
pub struct ClassifyCache {
    info: Option<StatementInfo>,
    parses: u8,
}

impl ClassifyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self) -> Option<&StatementInfo> {
        self.info.as_ref()
    }

    pub fn get(
        &mut self,
        plugin: &dyn ParserPlugin,
        sql: &[u8],
        collect: CollectLevel,
    ) -> &StatementInfo {
        let needs_parse = match &self.info {
            None => true,
            // only a strictly larger collection set triggers the re-parse
            Some(info) => !info.collected.contains(collect) && self.parses < 2,
        };
        if needs_parse {
            let demanded = match &self.info {
                Some(prior) => prior.collected | collect,
                None => collect,
            };
            let mut fresh = plugin.parse(sql, demanded);
            fresh.collected = demanded;
            self.info = Some(fresh);
            self.parses += 1;
        }
        self.info.as_ref().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::classifier::MariaDbClassifier;

    #[test]
    fn cache_parses_at_most_twice() {
        let plugin = MariaDbClassifier::default();
        let mut cache = ClassifyCache::new();
        let sql = b"SELECT a FROM t1 JOIN db2.t2";

        let first = cache.get(&plugin, sql, CollectLevel::ESSENTIALS);
        assert_eq!(first.result, ParseResult::Parsed);
        assert_eq!(cache.parses, 1);

        // same level: no re-parse
        cache.get(&plugin, sql, CollectLevel::ESSENTIALS);
        assert_eq!(cache.parses, 1);

        // strictly larger set: one more parse, merged level
        let wider = cache.get(&plugin, sql, CollectLevel::TABLES | CollectLevel::DATABASES);
        assert!(wider.collected.contains(CollectLevel::TABLES));
        assert_eq!(cache.parses, 2);

        // cap reached: never parses again
        cache.get(&plugin, sql, CollectLevel::ALL);
        assert_eq!(cache.parses, 2);
    }
}
