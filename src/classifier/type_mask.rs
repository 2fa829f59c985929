use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::router::UseSqlVariablesIn;

/// Bitfield summarizing the SQL kind of a command.
///
/// A statement usually carries several bits, e.g. `START TRANSACTION READ
/// ONLY` is `BEGIN_TRX | READ` and `CREATE TEMPORARY TABLE` is
/// `WRITE | CREATE_TMP_TABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeMask(u32);

impl TypeMask {
    pub const UNKNOWN: TypeMask = TypeMask(0);
    pub const READ: TypeMask = TypeMask(1);
    pub const WRITE: TypeMask = TypeMask(1 << 1);
    /// Read that must see the primary's state (LAST_INSERT_ID, tmp tables)
    pub const MASTER_READ: TypeMask = TypeMask(1 << 2);
    pub const SESSION_WRITE: TypeMask = TypeMask(1 << 3);
    pub const USERVAR_READ: TypeMask = TypeMask(1 << 4);
    pub const USERVAR_WRITE: TypeMask = TypeMask(1 << 5);
    pub const SYSVAR_READ: TypeMask = TypeMask(1 << 6);
    pub const GSYSVAR_READ: TypeMask = TypeMask(1 << 7);
    pub const GSYSVAR_WRITE: TypeMask = TypeMask(1 << 8);
    pub const ENABLE_AUTOCOMMIT: TypeMask = TypeMask(1 << 9);
    pub const DISABLE_AUTOCOMMIT: TypeMask = TypeMask(1 << 10);
    pub const BEGIN_TRX: TypeMask = TypeMask(1 << 11);
    pub const COMMIT: TypeMask = TypeMask(1 << 12);
    pub const ROLLBACK: TypeMask = TypeMask(1 << 13);
    pub const PREPARE_STMT: TypeMask = TypeMask(1 << 14);
    pub const PREPARE_NAMED_STMT: TypeMask = TypeMask(1 << 15);
    pub const EXEC_STMT: TypeMask = TypeMask(1 << 16);
    pub const CREATE_TMP_TABLE: TypeMask = TypeMask(1 << 17);
    pub const READ_TMP_TABLE: TypeMask = TypeMask(1 << 18);
    pub const SHOW_TABLES: TypeMask = TypeMask(1 << 19);
    pub const SHOW_DATABASES: TypeMask = TypeMask(1 << 20);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`
    pub fn contains(self, other: TypeMask) -> bool {
        self.0 & other.0 == other.0 && !other.is_empty()
    }

    /// True when any bit of `other` is set in `self`
    pub fn intersects(self, other: TypeMask) -> bool {
        self.0 & other.0 != 0
    }

    /// `self` with the bits of `other` cleared
    pub fn without(self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 & !other.0)
    }

    /// The read-only recipe used by the route selector: not a write, not a
    /// primary-bound read, and at least one read-flavored bit. A user
    /// variable read only counts as read-only when variable handling is
    /// configured to reach all servers.
    pub fn is_read_only(self, use_sql_variables_in: UseSqlVariablesIn) -> bool {
        if self.intersects(TypeMask::MASTER_READ | TypeMask::WRITE) {
            return false;
        }

        if !self.intersects(
            TypeMask::READ
                | TypeMask::SHOW_TABLES
                | TypeMask::SHOW_DATABASES
                | TypeMask::USERVAR_READ
                | TypeMask::SYSVAR_READ
                | TypeMask::GSYSVAR_READ,
        ) {
            return false;
        }

        if self.intersects(TypeMask::USERVAR_READ) {
            return use_sql_variables_in == UseSqlVariablesIn::All;
        }

        true
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: TypeMask) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: &[(TypeMask, &str)] = &[
            (TypeMask::READ, "READ"),
            (TypeMask::WRITE, "WRITE"),
            (TypeMask::MASTER_READ, "MASTER_READ"),
            (TypeMask::SESSION_WRITE, "SESSION_WRITE"),
            (TypeMask::USERVAR_READ, "USERVAR_READ"),
            (TypeMask::USERVAR_WRITE, "USERVAR_WRITE"),
            (TypeMask::SYSVAR_READ, "SYSVAR_READ"),
            (TypeMask::GSYSVAR_READ, "GSYSVAR_READ"),
            (TypeMask::GSYSVAR_WRITE, "GSYSVAR_WRITE"),
            (TypeMask::ENABLE_AUTOCOMMIT, "ENABLE_AUTOCOMMIT"),
            (TypeMask::DISABLE_AUTOCOMMIT, "DISABLE_AUTOCOMMIT"),
            (TypeMask::BEGIN_TRX, "BEGIN_TRX"),
            (TypeMask::COMMIT, "COMMIT"),
            (TypeMask::ROLLBACK, "ROLLBACK"),
            (TypeMask::PREPARE_STMT, "PREPARE_STMT"),
            (TypeMask::PREPARE_NAMED_STMT, "PREPARE_NAMED_STMT"),
            (TypeMask::EXEC_STMT, "EXEC_STMT"),
            (TypeMask::CREATE_TMP_TABLE, "CREATE_TMP_TABLE"),
            (TypeMask::READ_TMP_TABLE, "READ_TMP_TABLE"),
            (TypeMask::SHOW_TABLES, "SHOW_TABLES"),
            (TypeMask::SHOW_DATABASES, "SHOW_DATABASES"),
        ];

        if self.is_empty() {
            return f.write_str("UNKNOWN");
        }

        let mut first = true;
        for (bit, name) in NAMES {
            if self.contains(*bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
