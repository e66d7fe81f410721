//! Read-only built-in function tables. A function reference that is not in
//! the applicable tables upgrades its statement to a write. The tables are
//! kept as explicit sorted arrays with binary search; the 10.2.3+ extension
//! and the Oracle-mode extension are gated separately.
//!
//! Function list source: https://mariadb.com/kb/en/mariadb/functions-and-operators/

/// Base set of read-only built-ins, sorted.
static BUILTIN_FUNCTIONS: &[&str] = &[
    "abs",
    "acos",
    "adddate",
    "addtime",
    "aes_decrypt",
    "aes_encrypt",
    "ascii",
    "asin",
    "atan",
    "atan2",
    "benchmark",
    "bin",
    "bit_and",
    "bit_count",
    "bit_length",
    "bit_or",
    "bit_xor",
    "cast",
    "ceil",
    "ceiling",
    "char",
    "char_length",
    "character_length",
    "charset",
    "coalesce",
    "coercibility",
    "collation",
    "column_check",
    "column_exists",
    "column_get",
    "column_json",
    "column_list",
    "compress",
    "concat",
    "concat_ws",
    "connection_id",
    "conv",
    "convert",
    "convert_tz",
    "cos",
    "cot",
    "count",
    "crc32",
    "curdate",
    "current_date",
    "current_time",
    "current_timestamp",
    "current_user",
    "curtime",
    "database",
    "date",
    "date_add",
    "date_format",
    "date_sub",
    "datediff",
    "day",
    "dayname",
    "dayofmonth",
    "dayofweek",
    "dayofyear",
    "decode",
    "degrees",
    "des_decrypt",
    "des_encrypt",
    "elt",
    "encode",
    "encrypt",
    "exp",
    "export_set",
    "extract",
    "extractvalue",
    "field",
    "find_in_set",
    "floor",
    "format",
    "from_base64",
    "from_days",
    "from_unixtime",
    "get_format",
    "get_lock",
    "greatest",
    "group_concat",
    "hex",
    "hour",
    "if",
    "ifnull",
    "inet6_aton",
    "inet6_ntoa",
    "inet_aton",
    "inet_ntoa",
    "instr",
    "interval",
    "is_free_lock",
    "is_ipv4",
    "is_ipv4_compat",
    "is_ipv4_mapped",
    "is_ipv6",
    "is_used_lock",
    "isnull",
    "last_day",
    "lcase",
    "least",
    "left",
    "length",
    "ln",
    "localtime",
    "localtimestamp",
    "locate",
    "log",
    "log10",
    "log2",
    "lower",
    "lpad",
    "ltrim",
    "make_set",
    "makedate",
    "maketime",
    "master_gtid_wait",
    "master_pos_wait",
    "max",
    "md5",
    "microsecond",
    "mid",
    "min",
    "minute",
    "mod",
    "month",
    "monthname",
    "name_const",
    "now",
    "nullif",
    "oct",
    "octet_length",
    "old_password",
    "ord",
    "period_add",
    "period_diff",
    "pi",
    "position",
    "pow",
    "power",
    "quarter",
    "quote",
    "radians",
    "rand",
    "release_lock",
    "repeat",
    "replace",
    "reverse",
    "right",
    "round",
    "rpad",
    "rtrim",
    "schema",
    "sec_to_time",
    "second",
    "session_user",
    "sha",
    "sha1",
    "sha2",
    "sign",
    "sin",
    "sleep",
    "soundex",
    "space",
    "sqrt",
    "std",
    "stddev",
    "stddev_pop",
    "stddev_samp",
    "str_to_date",
    "strcmp",
    "subdate",
    "substr",
    "substring",
    "substring_index",
    "subtime",
    "sum",
    "sysdate",
    "system_user",
    "tan",
    "time",
    "time_format",
    "time_to_sec",
    "timediff",
    "timestamp",
    "timestampadd",
    "timestampdiff",
    "to_base64",
    "to_days",
    "to_seconds",
    "trim",
    "truncate",
    "ucase",
    "uncompress",
    "uncompressed_length",
    "unhex",
    "unix_timestamp",
    "updatexml",
    "upper",
    "user",
    "utc_date",
    "utc_time",
    "utc_timestamp",
    "var_pop",
    "var_samp",
    "variance",
    "version",
    "week",
    "weekday",
    "weekofyear",
    "weight_string",
    "year",
    "yearweek",
];

/// Read-only built-ins added in 10.2.3: JSON and window functions. Sorted.
static BUILTIN_10_2_3_FUNCTIONS: &[&str] = &[
    "cume_dist",
    "dense_rank",
    "first_value",
    "json_array",
    "json_array_append",
    "json_array_insert",
    "json_compact",
    "json_contains",
    "json_contains_path",
    "json_depth",
    "json_detailed",
    "json_exists",
    "json_extract",
    "json_insert",
    "json_keys",
    "json_length",
    "json_loose",
    "json_merge",
    "json_object",
    "json_query",
    "json_quote",
    "json_remove",
    "json_replace",
    "json_search",
    "json_set",
    "json_type",
    "json_unquote",
    "json_valid",
    "json_value",
    "lag",
    "last_value",
    "lead",
    "nth_value",
    "ntile",
    "percent_rank",
    "rank",
    "row_number",
];

/// Oracle-mode additions. Sorted.
static ORACLE_FUNCTIONS: &[&str] = &["nvl", "nvl2"];

fn table_contains(table: &[&str], key: &str) -> bool {
    table
        .binary_search_by(|probe| probe.cmp(&key))
        .is_ok()
}

/// Whether `name` is a read-only built-in for the given server version and
/// SQL mode. Anything else upgrades the statement to a write.
pub fn is_builtin_readonly_function(
    name: &str,
    (major, minor, patch): (u32, u32, u32),
    check_oracle: bool,
) -> bool {
    let key = name.to_ascii_lowercase();
    if table_contains(BUILTIN_FUNCTIONS, &key) {
        return true;
    }
    let at_least_10_2_3 =
        major > 10 || (major == 10 && (minor > 2 || (minor == 2 && patch >= 3)));
    if at_least_10_2_3 && table_contains(BUILTIN_10_2_3_FUNCTIONS, &key) {
        return true;
    }
    check_oracle && table_contains(ORACLE_FUNCTIONS, &key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_are_sorted() {
        for table in [BUILTIN_FUNCTIONS, BUILTIN_10_2_3_FUNCTIONS, ORACLE_FUNCTIONS] {
            for pair in table.windows(2) {
                assert!(pair[0] < pair[1], "{} >= {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn version_gating() {
        assert!(is_builtin_readonly_function("NOW", (10, 1, 0), false));
        assert!(!is_builtin_readonly_function("json_extract", (10, 1, 0), false));
        assert!(is_builtin_readonly_function("json_extract", (10, 2, 3), false));
        assert!(is_builtin_readonly_function("rank", (11, 0, 0), false));
    }

    #[test]
    fn oracle_gating() {
        assert!(!is_builtin_readonly_function("nvl", (10, 6, 0), false));
        assert!(is_builtin_readonly_function("nvl", (10, 6, 0), true));
    }

    #[test]
    fn unknown_function_is_not_readonly() {
        assert!(!is_builtin_readonly_function("nextval", (10, 6, 0), false));
        assert!(!is_builtin_readonly_function("my_udf", (10, 6, 0), false));
    }
}
