//! Lock modes and small closed enums consumed by dialect string transforms.

use serde::{Deserialize, Serialize};

/// Row lock requested for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    None,
    Optimistic,
    OptimisticForceIncrement,
    PessimisticRead,
    PessimisticWrite,
    PessimisticForceIncrement,
}

impl LockMode {
    /// Whether the mode asks the database for a row lock.
    pub const fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::PessimisticRead
                | LockMode::PessimisticWrite
                | LockMode::PessimisticForceIncrement
        )
    }
}

/// Which side `TRIM` strips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimSpec {
    Leading,
    Trailing,
    Both,
}

impl TrimSpec {
    pub const fn as_sql(self) -> &'static str {
        match self {
            TrimSpec::Leading => "LEADING",
            TrimSpec::Trailing => "TRAILING",
            TrimSpec::Both => "BOTH",
        }
    }
}
