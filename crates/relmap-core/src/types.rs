//! Semantic SQL types.
//!
//! A column's type is recorded as a portable code; each dialect decides how (and
//! whether) to render it. The numeric codes follow the JDBC `java.sql.Types`
//! constants so metadata produced by other tooling maps over unchanged.

use serde::{Deserialize, Serialize};

/// Portable SQL type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Bit,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Float,
    Real,
    Double,
    Numeric,
    Decimal,
    Char,
    Varchar,
    LongVarchar,
    Date,
    Time,
    Timestamp,
    Binary,
    Varbinary,
    Blob,
    Clob,
    /// UUID; not every dialect has a native type.
    Uuid,
    /// JSON document; not every dialect has a native type.
    Json,
    /// A vendor code with no portable meaning. Dialects reject it.
    Other(i32),
}

impl SqlType {
    /// The JDBC type code for this type.
    pub const fn code(self) -> i32 {
        match self {
            SqlType::Bit => -7,
            SqlType::Boolean => 16,
            SqlType::TinyInt => -6,
            SqlType::SmallInt => 5,
            SqlType::Integer => 4,
            SqlType::BigInt => -5,
            SqlType::Float => 6,
            SqlType::Real => 7,
            SqlType::Double => 8,
            SqlType::Numeric => 2,
            SqlType::Decimal => 3,
            SqlType::Char => 1,
            SqlType::Varchar => 12,
            SqlType::LongVarchar => -1,
            SqlType::Date => 91,
            SqlType::Time => 92,
            SqlType::Timestamp => 93,
            SqlType::Binary => -2,
            SqlType::Varbinary => -3,
            SqlType::Blob => 2004,
            SqlType::Clob => 2005,
            SqlType::Uuid => 1111,
            SqlType::Json => 2000,
            SqlType::Other(code) => code,
        }
    }

    /// Map a JDBC type code back to a semantic type.
    ///
    /// Unknown codes are preserved as [`SqlType::Other`]; rejecting them is the
    /// dialect's job.
    pub const fn from_code(code: i32) -> Self {
        match code {
            -7 => SqlType::Bit,
            16 => SqlType::Boolean,
            -6 => SqlType::TinyInt,
            5 => SqlType::SmallInt,
            4 => SqlType::Integer,
            -5 => SqlType::BigInt,
            6 => SqlType::Float,
            7 => SqlType::Real,
            8 => SqlType::Double,
            2 => SqlType::Numeric,
            3 => SqlType::Decimal,
            1 => SqlType::Char,
            12 => SqlType::Varchar,
            -1 => SqlType::LongVarchar,
            91 => SqlType::Date,
            92 => SqlType::Time,
            93 => SqlType::Timestamp,
            -2 => SqlType::Binary,
            -3 => SqlType::Varbinary,
            2004 => SqlType::Blob,
            2005 => SqlType::Clob,
            1111 => SqlType::Uuid,
            2000 => SqlType::Json,
            other => SqlType::Other(other),
        }
    }

    /// Whether the type is an integer type usable for generated keys.
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Integer | SqlType::BigInt
        )
    }

    /// Whether values of this type are textual.
    pub const fn is_textual(self) -> bool {
        matches!(
            self,
            SqlType::Char | SqlType::Varchar | SqlType::LongVarchar | SqlType::Clob
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_map_back() {
        for ty in [
            SqlType::Boolean,
            SqlType::BigInt,
            SqlType::Varchar,
            SqlType::Timestamp,
            SqlType::Blob,
            SqlType::Decimal,
        ] {
            assert_eq!(SqlType::from_code(ty.code()), ty);
        }
    }

    #[test]
    fn test_unknown_code_is_other() {
        assert_eq!(SqlType::from_code(-155), SqlType::Other(-155));
        assert_eq!(SqlType::Other(-155).code(), -155);
    }

    #[test]
    fn test_integral() {
        assert!(SqlType::BigInt.is_integral());
        assert!(!SqlType::Double.is_integral());
        assert!(SqlType::Clob.is_textual());
    }
}
