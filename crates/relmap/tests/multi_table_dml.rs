use relmap::prelude::*;
use relmap::{DmlOperation, HsqlDialect};
use relmap_core::QueryErrorKind;
use relmap_core::testing::RecordingConnection;

fn person() -> EntityMetadata {
    EntityMetadata::new("Person")
        .table(TableMetadata::new("person"))
        .secondary_table(
            SecondaryTableMetadata::new("person_detail")
                .pk_join_column(PkJoinColumnMetadata::new("person_id").references("id")),
        )
        .attribute(AttributeMetadata::id("id", ColumnMetadata::new(SqlType::BigInt)))
        .attribute(AttributeMetadata::basic(
            "name",
            ColumnMetadata::new(SqlType::Varchar).length(80),
        ))
        .attribute(AttributeMetadata::basic(
            "bio",
            ColumnMetadata::new(SqlType::Varchar).length(2000).table("person_detail"),
        ))
}

fn employee() -> EntityMetadata {
    EntityMetadata::new("Employee")
        .table(TableMetadata::new("employee"))
        .parent("Person")
        .secondary_table(SecondaryTableMetadata::new("employee_badge"))
        .attribute(AttributeMetadata::basic("salary", ColumnMetadata::new(SqlType::Integer)))
        .attribute(AttributeMetadata::basic(
            "badge",
            ColumnMetadata::new(SqlType::Varchar).length(16).table("employee_badge"),
        ))
}

fn session() -> Session<RecordingConnection> {
    let metamodel = Metamodel::build(vec![person(), employee()], Vec::new()).unwrap();
    Session::new(
        RecordingConnection::new("HSQL Database Engine"),
        Arc::new(HsqlDialect),
        Arc::new(metamodel),
    )
}

#[test]
fn primary_and_secondary_table_each_get_their_own_insert() {
    let mut session = session();
    let ada = session
        .persist(
            EntityRecord::new("Person")
                .with("id", 1_i64)
                .with("name", "Ada")
                .with("bio", "Analyst"),
        )
        .unwrap();
    session.flush().unwrap();

    let conn = session.connection();
    assert_eq!(
        conn.executed_sql(),
        vec![
            "BEGIN",
            "INSERT INTO person (id, name) VALUES (?, ?)",
            "INSERT INTO person_detail (person_id, bio) VALUES (?, ?)",
        ]
    );
    let detail = conn.matching("INSERT INTO person_detail");
    assert_eq!(detail[0].params, vec![Value::BigInt(1), Value::from("Analyst")]);

    let instance = session.instance(ada).unwrap();
    assert!(instance.is_executed());
    assert_eq!(instance.transaction(), session.transaction());
}

#[test]
fn failed_secondary_insert_leaves_transaction_unset() {
    let mut session = session();
    session.connection().fail_on(
        "INSERT INTO person_detail",
        QueryErrorKind::Constraint,
        "bio too long",
    );
    let ada = session
        .persist(EntityRecord::new("Person").with("id", 1_i64).with("name", "Ada"))
        .unwrap();

    let err = session.flush().unwrap_err();
    let Error::Dml(dml) = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(dml.operation, DmlOperation::Insert);
    assert_eq!(dml.table, "person_detail");
    assert_eq!(dml.entity, "Person");
    assert!(matches!(err.root(), Error::Query(q) if q.kind == QueryErrorKind::Constraint));

    assert_eq!(session.instance(ada).unwrap().transaction(), None);
    assert_eq!(session.pending_new_count(), 1);
    assert_eq!(session.connection().matching("INSERT INTO person (").len(), 1);
}

#[test]
fn subtype_writes_own_tables_before_supertype_tables() {
    let mut session = session();
    let lin = session
        .persist(
            EntityRecord::new("Employee")
                .with("id", 9_i64)
                .with("name", "Lin")
                .with("salary", 10)
                .with("badge", "B-1"),
        )
        .unwrap();
    session.flush().unwrap();
    assert_eq!(
        session.connection().executed_sql()[1..],
        [
            "INSERT INTO employee (id, salary) VALUES (?, ?)",
            "INSERT INTO employee_badge (id, badge) VALUES (?, ?)",
            "INSERT INTO person (id, name) VALUES (?, ?)",
            "INSERT INTO person_detail (person_id, bio) VALUES (?, ?)",
        ]
    );

    session.connection().clear();
    session.record_mut(lin).unwrap().set("salary", 12);
    session.flush().unwrap();
    assert_eq!(
        session.connection().executed_sql(),
        vec![
            "UPDATE employee SET salary = ? WHERE id = ?",
            "UPDATE employee_badge SET badge = ? WHERE id = ?",
            "UPDATE person SET name = ? WHERE id = ?",
            "UPDATE person_detail SET bio = ? WHERE person_id = ?",
        ]
    );

    session.connection().clear();
    session.remove(lin).unwrap();
    session.flush().unwrap();
    assert_eq!(
        session.connection().executed_sql(),
        vec![
            "DELETE FROM person_detail WHERE person_id = ?",
            "DELETE FROM person WHERE id = ?",
            "DELETE FROM employee_badge WHERE id = ?",
            "DELETE FROM employee WHERE id = ?",
        ]
    );
    assert_eq!(session.status(lin), None);
}

#[test]
fn update_of_missing_row_names_the_table() {
    let mut session = session();
    let ada = session
        .persist(EntityRecord::new("Person").with("id", 1_i64).with("name", "Ada"))
        .unwrap();
    session.flush().unwrap();

    session.connection().affect("UPDATE person SET", 0);
    session.record_mut(ada).unwrap().set("name", "Grace");
    let err = session.flush().unwrap_err();
    let Error::Dml(dml) = &err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!(dml.operation, DmlOperation::Update);
    assert_eq!(dml.table, "person");
    assert_eq!(dml.identity, "[1]");
}
