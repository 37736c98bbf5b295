//! Session and schema configuration.

use serde::{Deserialize, Serialize};

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Begin a transaction on the first flush if none is open.
    pub auto_begin: bool,
    /// Drop dirty-check snapshots after commit so the next flush re-reads state.
    pub expire_on_commit: bool,
    /// Flush pending changes before committing.
    pub flush_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            expire_on_commit: false,
            flush_on_commit: true,
        }
    }
}

impl SessionConfig {
    pub fn auto_begin(mut self, enabled: bool) -> Self {
        self.auto_begin = enabled;
        self
    }

    pub fn expire_on_commit(mut self, enabled: bool) -> Self {
        self.expire_on_commit = enabled;
        self
    }

    pub fn flush_on_commit(mut self, enabled: bool) -> Self {
        self.flush_on_commit = enabled;
        self
    }
}

/// What the session factory does to the schema at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DdlMode {
    /// Leave the database alone.
    #[default]
    None,
    /// Create generators, tables and foreign keys.
    Create,
    /// Drop everything the metamodel maps, then create.
    DropAndCreate,
}

/// Schema generation settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub ddl: DdlMode,
    /// Schema for generators that do not name one. `None` asks the connection.
    pub default_schema: Option<String>,
}

impl SchemaConfig {
    pub fn ddl(mut self, mode: DdlMode) -> Self {
        self.ddl = mode;
        self
    }

    pub fn default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = Some(schema.into());
        self
    }
}

/// Everything a [`SessionFactory`](crate::SessionFactory) needs besides the metamodel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub session: SessionConfig,
    pub schema: SchemaConfig,
}

impl PersistenceConfig {
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn schema(mut self, schema: SchemaConfig) -> Self {
        self.schema = schema;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_begin);
        assert!(!config.expire_on_commit);
        assert!(config.flush_on_commit);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PersistenceConfig =
            serde_json::from_str(r#"{"schema": {"ddl": "DropAndCreate"}}"#).unwrap();
        assert_eq!(config.schema.ddl, DdlMode::DropAndCreate);
        assert!(config.schema.default_schema.is_none());
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_builders() {
        let config = PersistenceConfig::default()
            .session(SessionConfig::default().auto_begin(false))
            .schema(SchemaConfig::default().ddl(DdlMode::Create).default_schema("APP"));
        assert!(!config.session.auto_begin);
        assert_eq!(config.schema.default_schema.as_deref(), Some("APP"));
    }
}
