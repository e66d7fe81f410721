use bitflags::bitflags;
use strum_macros::AsRefStr;

bitflags! {
    /// Classification of one statement as a set of routing-relevant kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        const READ               = 1 << 0;
        const WRITE              = 1 << 1;
        const SESSION_WRITE      = 1 << 2;
        const MASTER_READ        = 1 << 3;
        const USERVAR_READ       = 1 << 4;
        const USERVAR_WRITE      = 1 << 5;
        const SYSVAR_READ        = 1 << 6;
        const GSYSVAR_READ       = 1 << 7;
        const GSYSVAR_WRITE      = 1 << 8;
        const PREPARE_STMT       = 1 << 9;
        const PREPARE_NAMED_STMT = 1 << 10;
        const EXEC_STMT          = 1 << 11;
        const DEALLOC_PREPARE    = 1 << 12;
        const BEGIN_TRX          = 1 << 13;
        const COMMIT             = 1 << 14;
        const ROLLBACK           = 1 << 15;
        const ENABLE_AUTOCOMMIT  = 1 << 16;
        const DISABLE_AUTOCOMMIT = 1 << 17;
        const READONLY           = 1 << 18;
        const READWRITE          = 1 << 19;
        const NEXT_TRX           = 1 << 20;
        const CREATE_TMP_TABLE   = 1 << 21;
        const SHOW_DATABASES     = 1 << 22;
        const SHOW_TABLES        = 1 << 23;
        const UNKNOWN            = 0;
    }
}

impl TypeMask {
    #[inline]
    pub fn contains_any(self, other: TypeMask) -> bool {
        self.intersects(other)
    }
}

/// The main operation of a statement, independent of the type mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, AsRefStr)]
pub enum Operation {
    #[default]
    Undefined,
    Select,
    Insert,
    Update,
    Delete,
    Replace,
    Truncate,
    CreateTable,
    CreateDb,
    AlterTable,
    DropTable,
    DropDb,
    ChangeDb,
    Load,
    LoadLocal,
    Grant,
    Revoke,
    Execute,
    Call,
    Set,
    Show,
    Kill,
    Prepare,
    Explain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_are_disjoint() {
        assert!(!TypeMask::READ.intersects(TypeMask::WRITE));
        assert!((TypeMask::BEGIN_TRX | TypeMask::READONLY).contains(TypeMask::READONLY));
        assert_eq!(TypeMask::UNKNOWN, TypeMask::empty());
    }
}
