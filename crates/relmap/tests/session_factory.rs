use relmap::prelude::*;
use relmap_core::testing::RecordingConnection;

fn metamodel() -> Arc<Metamodel> {
    let ticket = EntityMetadata::new("Ticket")
        .table(TableMetadata::new("ticket"))
        .attribute(AttributeMetadata::generated_id(
            "id",
            ColumnMetadata::new(SqlType::BigInt),
            GenerationType::Auto,
            None,
        ))
        .attribute(AttributeMetadata::basic(
            "title",
            ColumnMetadata::new(SqlType::Varchar).length(120),
        ));
    Arc::new(Metamodel::build(vec![ticket], Vec::new()).unwrap())
}

fn create_schema() -> PersistenceConfig {
    PersistenceConfig::default().schema(SchemaConfig::default().ddl(DdlMode::Create))
}

#[test]
fn factory_creates_schema_and_sessions_write_through_it() {
    let conn = RecordingConnection::new("PostgreSQL");
    let factory = SessionFactory::new(&conn, metamodel(), create_schema()).unwrap();
    let ddl = conn.executed_sql();
    assert_eq!(ddl.len(), 2);
    assert_eq!(ddl[0], "CREATE SEQUENCE ticket_seq START WITH 1 INCREMENT BY 1");
    assert!(ddl[1].starts_with("CREATE TABLE ticket ("));

    conn.clear();
    conn.respond(
        "nextval('ticket_seq')",
        vec![Row::from_pairs([("nextval", Value::BigInt(41))])],
    );

    let mut session = factory.open(&conn);
    let ticket = session
        .persist(EntityRecord::new("Ticket").with("title", "Flaky build"))
        .unwrap();
    session.commit().unwrap();

    assert_eq!(
        conn.executed_sql(),
        vec![
            "BEGIN",
            "INSERT INTO ticket (id, title) VALUES ($1, $2)",
            "COMMIT",
        ]
    );
    assert_eq!(session.get(ticket).unwrap().get("id"), Some(&Value::BigInt(41)));

    let found = session
        .find("Ticket", vec![Value::BigInt(41)], LockMode::None)
        .unwrap();
    assert_eq!(found, Some(ticket));
    assert!(conn.matching("SELECT title").is_empty());
    assert_eq!(
        session
            .status_of(&EntityRecord::new("Ticket").with("id", 41_i64))
            .unwrap(),
        Status::Managed
    );

    session.close().unwrap();
    assert_eq!(session.status(ticket), Some(Status::Detached));
}

#[test]
fn config_loads_from_json() {
    let config: PersistenceConfig = serde_json::from_str(
        r#"{ "session": { "auto_begin": false }, "schema": { "ddl": "DropAndCreate" } }"#,
    )
    .unwrap();
    assert!(!config.session.auto_begin);
    assert!(config.session.flush_on_commit);
    assert_eq!(config.schema.ddl, DdlMode::DropAndCreate);

    let conn = RecordingConnection::new("HSQL Database Engine");
    let factory = SessionFactory::new(&conn, metamodel(), config).unwrap();
    assert_eq!(
        conn.executed_sql()[..2],
        [
            "DROP TABLE ticket IF EXISTS CASCADE",
            "DROP SEQUENCE ticket_seq IF EXISTS CASCADE",
        ]
    );

    let mut session = factory.open(&conn);
    session
        .persist(EntityRecord::new("Ticket").with("title", "No transaction"))
        .unwrap();
    assert!(session.flush().is_err());
    assert_eq!(session.debug_state().pending_new, 1);
}

#[test]
fn sessions_from_one_factory_are_independent() {
    let conn = RecordingConnection::new("PostgreSQL");
    let factory = SessionFactory::new(&conn, metamodel(), PersistenceConfig::default()).unwrap();
    assert!(conn.statements().is_empty());

    let first = factory.open(&conn);
    let second = factory.open(&conn);
    assert_ne!(first.id(), second.id());
    assert!(Arc::ptr_eq(first.metamodel(), second.metamodel()));
}

#[test]
fn generated_integer_key_is_found_by_any_integer_width() {
    let ticket = EntityMetadata::new("Ticket")
        .table(TableMetadata::new("ticket"))
        .attribute(AttributeMetadata::generated_id(
            "id",
            ColumnMetadata::new(SqlType::Integer),
            GenerationType::Auto,
            None,
        ))
        .attribute(AttributeMetadata::basic(
            "title",
            ColumnMetadata::new(SqlType::Varchar).length(120),
        ));
    let metamodel = Arc::new(Metamodel::build(vec![ticket], Vec::new()).unwrap());
    let conn = RecordingConnection::new("PostgreSQL");
    conn.respond(
        "nextval('ticket_seq')",
        vec![Row::from_pairs([("nextval", Value::BigInt(41))])],
    );
    let factory = SessionFactory::new(&conn, metamodel, PersistenceConfig::default()).unwrap();

    let mut session = factory.open(&conn);
    let ticket = session
        .persist(EntityRecord::new("Ticket").with("title", "Narrow key"))
        .unwrap();
    session.commit().unwrap();
    assert_eq!(session.get(ticket).unwrap().get("id"), Some(&Value::Int(41)));

    for ids in [vec![Value::BigInt(41)], vec![Value::SmallInt(41)]] {
        let found = session.find("Ticket", ids, LockMode::None).unwrap();
        assert_eq!(found, Some(ticket));
    }
    assert!(conn.matching("SELECT title").is_empty());
    assert_eq!(session.debug_state().managed, 1);

    session.record_mut(ticket).unwrap().set("title", "Renamed");
    session.commit().unwrap();
    assert_eq!(conn.matching("UPDATE ticket").len(), 1);
}
