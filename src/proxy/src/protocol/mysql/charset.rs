use hashbrown::HashMap;
use std::sync::OnceLock;

pub const UTF8_GENERAL_CI: u8 = 33;
pub const UTF8_MB4_GENERAL_CI: u8 = 45;
pub const BINARY: u8 = 63;

pub const DEFAULT_COLLATION_ID: u8 = UTF8_GENERAL_CI;

/// Collation name to id, the subset the proxy ever negotiates.
/// See: https://mariadb.com/kb/en/supported-character-sets-and-collations/
pub fn collation_names() -> &'static HashMap<&'static str, u8> {
    static COLLATIONS: OnceLock<HashMap<&'static str, u8>> = OnceLock::new();
    COLLATIONS.get_or_init(|| {
        HashMap::from_iter([
            ("big5_chinese_ci", 1_u8),
            ("latin1_swedish_ci", 8),
            ("ascii_general_ci", 11),
            ("ujis_japanese_ci", 12),
            ("sjis_japanese_ci", 13),
            ("latin1_general_ci", 48),
            ("binary", BINARY),
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("utf8_bin", 83),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("utf8mb4_bin", 46),
            ("utf8mb4_unicode_ci", 224),
            ("utf8mb4_unicode_520_ci", 246),
        ])
    })
}
