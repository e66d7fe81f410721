use num_derive::{FromPrimitive, ToPrimitive};
use strum_macros::AsRefStr;

// see: https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html
// max packet payload length.
pub const MAX_PAYLOAD_LEN: usize = 16_777_215;

pub const PACKET_HEADER_LEN: usize = 4;

/// auth-plugin-data-part-1 The first 8 bits of a random number will be used for subsequent password encryption.
/// 1 byte padding. 2-byte integer.
pub const AUTH_PLUGIN_DATA_PART_1_LENGTH: usize = 8;
/// The length of the random number required for encryption. (auth-plugin-data-part-1 + auth-plugin-data-part-2)
pub const SCRAMBLE_SIZE: usize = 20;

/// Prepared statement id meaning "the statement prepared most recently".
pub const PS_DIRECT_EXEC_ID: u32 = u32::MAX;

/// Offset of the 4-byte statement id in every COM_STMT_* packet payload.
pub const PS_ID_OFFSET: usize = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy, AsRefStr)]
pub enum AuthPluginName {
    #[strum(serialize = "mysql_old_password")]
    AuthMySQlOldPassword,
    #[strum(serialize = "caching_sha2_password")]
    AuthCachingSha2Password,
    #[strum(serialize = "sha256_password")]
    AuthSha256Password,
    #[strum(serialize = "mysql_native_password")]
    AuthNativePassword,
    #[strum(serialize = "mysql_clear_password")]
    AuthClearPassword,
    #[strum(serialize = "auth_unknown_plugin")]
    UnKnowPluginName,
}

impl AuthPluginName {
    pub fn from_bytes(name: &[u8]) -> Self {
        match name {
            b"mysql_old_password" => AuthPluginName::AuthMySQlOldPassword,
            b"caching_sha2_password" => AuthPluginName::AuthCachingSha2Password,
            b"sha256_password" => AuthPluginName::AuthSha256Password,
            b"mysql_native_password" => AuthPluginName::AuthNativePassword,
            b"mysql_clear_password" => AuthPluginName::AuthClearPassword,
            _ => AuthPluginName::UnKnowPluginName,
        }
    }
}

#[derive(Debug, PartialEq, ToPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum HeaderInfo {
    OKHeader = 0x00,
    ErrHeader = 0xff,
    EOFHeader = 0xfe,
    LocalInFileHeader = 0xfb,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, FromPrimitive, ToPrimitive, Hash)]
#[repr(u8)]
pub enum CommandCode {
    ComSleep = 0,
    ComQuit,
    ComInitDB,
    ComQuery,
    ComFieldList,
    ComCreateDB,
    ComDropDB,
    ComRefresh,
    ComShutdown,
    ComStatistics,
    ComProcessInfo,
    ComConnect,
    ComProcessKill,
    ComDebug,
    ComPing,
    ComTime,
    ComDelayedInsert,
    ComChangeUser,
    ComBinlogDump,
    ComTableDump,
    ComConnectOut,
    ComRegisterSlave,
    ComStmtPrepare,
    ComStmtExecute,
    ComStmtSendLongData,
    ComStmtClose,
    ComStmtReset,
    ComSetOption,
    ComStmtFetch,
    ComDaemon,
    ComBinlogDumpGtid,
    ComResetConnection,
    ComEnd,
}

impl CommandCode {
    /// Commands that carry a prepared statement id right after the command byte.
    pub fn is_ps_command(self) -> bool {
        matches!(
            self,
            CommandCode::ComStmtExecute
                | CommandCode::ComStmtSendLongData
                | CommandCode::ComStmtClose
                | CommandCode::ComStmtReset
                | CommandCode::ComStmtFetch
        )
    }

    pub fn all_sql_com() -> &'static hashbrown::HashMap<u8, &'static str> {
        static SQL_COM: std::sync::OnceLock<hashbrown::HashMap<u8, &'static str>> =
            std::sync::OnceLock::new();
        SQL_COM.get_or_init(|| {
            hashbrown::HashMap::from_iter([
                (0_u8, "ComSleep"),
                (1_u8, "ComQuit"),
                (2_u8, "ComInitDB"),
                (3_u8, "ComQuery"),
                (4_u8, "ComFieldList"),
                (5_u8, "ComCreateDB"),
                (6_u8, "ComDropDB"),
                (7_u8, "ComRefresh"),
                (8_u8, "ComShutdown"),
                (9_u8, "ComStatistics"),
                (10_u8, "ComProcessInfo"),
                (11_u8, "ComConnect"),
                (12_u8, "ComProcessKill"),
                (13_u8, "ComDebug"),
                (14_u8, "ComPing"),
                (15_u8, "ComTime"),
                (16_u8, "ComDelayedInsert"),
                (17_u8, "ComChangeUser"),
                (18_u8, "ComBinlogDump"),
                (19_u8, "ComTableDump"),
                (20_u8, "ComConnectOut"),
                (21_u8, "ComRegisterSlave"),
                (22_u8, "ComStmtPrepare"),
                (23_u8, "ComStmtExecute"),
                (24_u8, "ComStmtSendLongData"),
                (25_u8, "ComStmtClose"),
                (26_u8, "ComStmtReset"),
                (27_u8, "ComSetOption"),
                (28_u8, "ComStmtFetch"),
                (29_u8, "ComDaemon"),
                (30_u8, "ComBinlogDumpGtid"),
                (31_u8, "ComResetConnection"),
                (32_u8, "ComEnd"),
            ])
        })
    }
}

#[cfg(test)]
mod test {
    use crate::protocol::mysql::constants::*;
    use num_traits::FromPrimitive;

    #[test]
    pub fn max_packet_size_test() {
        let max_u24_size = 16_777_215;
        assert_eq!(max_u24_size, MAX_PAYLOAD_LEN);
    }

    #[test]
    pub fn test_command_code_round_trip() {
        assert_eq!(CommandCode::from_u8(3), Some(CommandCode::ComQuery));
        assert_eq!(
            CommandCode::from_u8(23),
            Some(CommandCode::ComStmtExecute)
        );
        assert!(CommandCode::ComStmtFetch.is_ps_command());
        assert!(!CommandCode::ComQuery.is_ps_command());
    }

    #[test]
    pub fn test_auth_plugin_names() {
        assert_eq!(
            AuthPluginName::from_bytes(b"mysql_native_password"),
            AuthPluginName::AuthNativePassword
        );
        assert_eq!(
            AuthPluginName::AuthNativePassword.as_ref(),
            "mysql_native_password"
        );
    }
}
