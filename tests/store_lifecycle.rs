use itemdb::{
    Attribute, DbErrorCode, DbLocation, IdentifiedObject, ItemStore, ItemdbConfig, Predicate,
    ScalarKind, Value,
};
use tempfile::tempdir;

#[test]
fn jobs_are_rejected_outside_the_started_phase() {
    let store = ItemStore::in_memory();
    let err = store.read(|_| Ok(())).unwrap_err();
    assert_eq!(err.code(), DbErrorCode::Lifecycle);

    store.start().expect("start");
    store.read(|_| Ok(())).expect("read after start");
    assert!(store.start().is_err(), "second start must fail");

    store.stop();
    let err = store.write(|_| Ok(())).unwrap_err();
    assert_eq!(err.code(), DbErrorCode::Lifecycle);
    // stop is idempotent
    store.stop();
}

#[test]
fn migrations_run_in_order_inside_one_transaction() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    store
        .add_migration("seed-inbox", move |ctx| {
            let item = ctx.materialize(&IdentifiedObject::new("note:inbox"))?;
            ctx.write_value(item, title, Some(&Value::str("Inbox")))?;
            Ok(())
        })
        .unwrap();
    store
        .add_migration("retitle-inbox", move |ctx| {
            let item = ctx.resolve("note:inbox")?.expect("seeded by the first migration");
            ctx.write_value(item, title, Some(&Value::str("Inbox!")))?;
            Ok(())
        })
        .unwrap();
    store.start().expect("start");

    let stored = store
        .read(move |ctx| {
            let item = ctx.resolve("note:inbox")?.unwrap();
            ctx.read_value(item, title)
        })
        .unwrap();
    assert_eq!(stored, Some(Value::str("Inbox!")));
    assert!(
        store.add_migration("late", |_| Ok(())).is_err(),
        "migrations are fixed once started"
    );
}

#[test]
fn failed_migration_is_terminal() {
    let store = ItemStore::in_memory();
    store
        .add_migration("explode", |_| Err(itemdb::DbError::Validation("boom".into())))
        .unwrap();
    let err = store.start().unwrap_err();
    assert_eq!(err.code(), DbErrorCode::Migration);
    assert!(err.to_string().contains("explode"));

    // The store never becomes usable, not even via another start.
    assert!(store.start().is_err());
    assert_eq!(store.read(|_| Ok(())).unwrap_err().code(), DbErrorCode::Lifecycle);
}

#[test]
fn data_survives_a_reopen() {
    let dir = tempdir().expect("tempdir");
    let location = DbLocation::file(dir.path().join("notes.db"));

    {
        let store = ItemStore::open(location.clone(), ItemdbConfig::desktop());
        let title = store
            .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
            .unwrap();
        store.start().unwrap();
        store
            .write(move |ctx| {
                let item = ctx.materialize(&IdentifiedObject::new("note:todo"))?;
                ctx.write_value(item, title, Some(&Value::str("buy milk")))?;
                Ok(())
            })
            .unwrap();
        store.stop();
    }

    let store = ItemStore::open(location, ItemdbConfig::desktop());
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();
    assert!(store.current_icn().raw() > 0, "committed ICN is durable");
    let item = store.find_materialized("note:todo").unwrap().expect("persisted");
    let stored = store.read(move |ctx| ctx.read_value(item, title)).unwrap();
    assert_eq!(stored, Some(Value::str("buy milk")));
}

#[test]
fn dump_exports_a_consistent_snapshot() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    let labels = store
        .register_attribute(Attribute::set("note:labels", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();
    let item = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, title, Some(&Value::str("plan")))?;
            ctx.write_values(item, labels, &[Value::str("work"), Value::str("urgent")])?;
            Ok(item)
        })
        .unwrap();

    let dump = store.dump().unwrap();
    assert_eq!(dump.icn, store.current_icn());
    let slot = dump
        .items
        .iter()
        .find(|slot| slot.item == item)
        .expect("written item appears in the dump");
    let titles = slot
        .values
        .iter()
        .find(|(id, _)| id == "note:title")
        .map(|(_, values)| values.clone())
        .unwrap();
    assert_eq!(titles, vec![Value::str("plan")]);
    let label_values = slot
        .values
        .iter()
        .find(|(id, _)| id == "note:labels")
        .map(|(_, values)| values.len())
        .unwrap();
    assert_eq!(label_values, 2);
}

#[test]
fn queries_work_through_the_facade() {
    let store = ItemStore::in_memory();
    let done = store
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();
    store.start().unwrap();
    let (open_item, _done_item) = store
        .write(move |ctx| {
            let a = ctx.next_item()?;
            ctx.write_value(a, done, Some(&Value::Bool(false)))?;
            let b = ctx.next_item()?;
            ctx.write_value(b, done, Some(&Value::Bool(true)))?;
            Ok((a, b))
        })
        .unwrap();
    let open = store
        .read(move |ctx| ctx.query(&Predicate::equals(done, Value::Bool(false))))
        .unwrap();
    assert_eq!(open, vec![open_item]);
}
