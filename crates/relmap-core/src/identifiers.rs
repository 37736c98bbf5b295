//! Identifier validation.

use std::sync::OnceLock;

use regex::Regex;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is valid")
    })
}

/// Words reserved by at least one supported product, sorted and uppercase.
const RESERVED_WORDS: &[&str] = &[
    "ALL", "AND", "ANY", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "CHECK", "COLUMN",
    "CONSTRAINT", "CREATE", "CROSS", "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP",
    "CURRENT_USER", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END", "EXCEPT",
    "EXISTS", "FALSE", "FETCH", "FOR", "FOREIGN", "FROM", "FULL", "GRANT", "GROUP", "HAVING",
    "IN", "INNER", "INSERT", "INTERSECT", "INTO", "IS", "JOIN", "LEFT", "LIKE", "LIMIT",
    "NATURAL", "NOT", "NULL", "OFFSET", "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES",
    "RIGHT", "SELECT", "SESSION_USER", "SET", "SOME", "TABLE", "THEN", "TO", "TRUE", "UNION",
    "UNIQUE", "UPDATE", "USER", "USING", "VALUES", "WHEN", "WHERE", "WITH",
];

/// Whether `name`, in any case, is a reserved SQL word.
pub fn is_reserved_word(name: &str) -> bool {
    RESERVED_WORDS
        .binary_search(&name.to_ascii_uppercase().as_str())
        .is_ok()
}

/// Whether `name` can be used unquoted as a table, column, schema or sequence name.
///
/// Generated SQL never quotes identifiers, so mapping metadata is validated against
/// this when the metamodel is built. Reserved words are rejected.
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name) && !is_reserved_word(name)
}

/// `schema.name`, or just `name` without a schema.
pub fn qualified_name(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("{schema}.{name}"),
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(is_valid_identifier("person"));
        assert!(is_valid_identifier("_tmp$1"));
        assert!(is_valid_identifier("PERSON_DETAIL"));
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("1person"));
        assert!(!is_valid_identifier("person; DROP TABLE x"));
        assert!(!is_valid_identifier("a b"));
    }

    #[test]
    fn test_reserved_words_rejected() {
        assert!(is_reserved_word("Order"));
        assert!(is_reserved_word("user"));
        assert!(!is_valid_identifier("ORDER"));
        assert!(!is_valid_identifier("group"));
        assert!(is_valid_identifier("orders"));
        assert!(is_valid_identifier("purchase_order"));
        assert!(RESERVED_WORDS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_qualify() {
        assert_eq!(qualified_name(Some("PUBLIC"), "person"), "PUBLIC.person");
        assert_eq!(qualified_name(None, "person"), "person");
        assert_eq!(qualified_name(Some(""), "person"), "person");
    }
}
