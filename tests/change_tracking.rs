use itemdb::{
    Attribute, DbError, ItemStore, Predicate, ScalarKind, TriggerDef, Value,
};

#[test]
fn every_touching_commit_bumps_the_icn_once() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();
    let before = store.current_icn();

    store
        .write(move |ctx| {
            let a = ctx.next_item()?;
            ctx.write_value(a, title, Some(&Value::str("one")))?;
            let b = ctx.next_item()?;
            ctx.write_value(b, title, Some(&Value::str("two")))?;
            Ok(())
        })
        .unwrap();
    assert_eq!(store.current_icn(), before.next(), "many writes, one stamp");

    // A write job that changes nothing does not consume an ICN.
    store.write(|_| Ok(())).unwrap();
    assert_eq!(store.current_icn(), before.next());
}

#[test]
fn unchanged_writes_leave_items_unstamped() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();
    let item = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, title, Some(&Value::str("same")))?;
            Ok(item)
        })
        .unwrap();
    let after_insert = store.current_icn();

    store
        .write(move |ctx| {
            ctx.write_value(item, title, Some(&Value::str("same")))?;
            Ok(())
        })
        .unwrap();
    assert_eq!(store.current_icn(), after_insert);
    let changed = store
        .read(move |ctx| ctx.changed_since(after_insert))
        .unwrap();
    assert!(changed.is_empty());
}

#[test]
fn changed_since_reports_exactly_the_touched_items() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();

    let (first, second) = store
        .write(move |ctx| {
            let a = ctx.next_item()?;
            ctx.write_value(a, title, Some(&Value::str("a")))?;
            let b = ctx.next_item()?;
            ctx.write_value(b, title, Some(&Value::str("b")))?;
            Ok((a, b))
        })
        .unwrap();
    let mid = store.current_icn();
    store
        .write(move |ctx| {
            ctx.write_value(second, title, Some(&Value::str("b2")))?;
            Ok(())
        })
        .unwrap();

    let since_mid = store.read(move |ctx| ctx.changed_since(mid)).unwrap();
    assert_eq!(since_mid, vec![second]);
    let since_start = store
        .read(move |ctx| ctx.changed_since(itemdb::Icn::ZERO))
        .unwrap();
    assert!(since_start.contains(&first));
    assert!(since_start.contains(&second));
}

#[test]
fn failed_write_jobs_leave_no_trace() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("note:title", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();
    let before = store.current_icn();

    let err = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, title, Some(&Value::str("phantom")))?;
            Err::<(), _>(DbError::Validation("change of plans".into()))
        })
        .unwrap_err();
    assert_eq!(err.code().as_str(), "validation");
    assert_eq!(store.current_icn(), before, "rolled back commit takes no ICN");

    let found = store
        .read(move |ctx| ctx.query(&Predicate::equals(title, Value::str("phantom"))))
        .unwrap();
    assert!(found.is_empty());
}

#[test]
fn propagating_references_mark_the_target_changed() {
    let store = ItemStore::in_memory();
    let title = store
        .register_attribute(Attribute::scalar("task:title", ScalarKind::Str))
        .unwrap();
    let parent = store
        .register_attribute(Attribute::scalar("task:parent", ScalarKind::Ref).propagating())
        .unwrap();
    store.start().unwrap();

    let (child, project) = store
        .write(move |ctx| {
            let project = ctx.next_item()?;
            ctx.write_value(project, title, Some(&Value::str("project")))?;
            let child = ctx.next_item()?;
            ctx.write_value(child, title, Some(&Value::str("subtask")))?;
            ctx.write_value(child, parent, Some(&Value::item(project)))?;
            Ok((child, project))
        })
        .unwrap();
    let before = store.current_icn();

    // Touching only the child also stamps the project it points at.
    store
        .write(move |ctx| {
            ctx.write_value(child, title, Some(&Value::str("subtask v2")))?;
            Ok(())
        })
        .unwrap();
    let changed = store.read(move |ctx| ctx.changed_since(before)).unwrap();
    assert!(changed.contains(&child));
    assert!(changed.contains(&project), "propagation reaches the referenced item");
}

#[test]
fn triggers_fire_on_matching_touched_items_in_the_same_commit() {
    let store = ItemStore::in_memory();
    let done = store
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();
    let closed_at = store
        .register_attribute(Attribute::scalar("task:closed_at", ScalarKind::Timestamp))
        .unwrap();
    store
        .register_trigger(TriggerDef::new(
            "stamp-closed",
            Predicate::equals(done, Value::Bool(true)),
            move |ctx, items| {
                for &item in items {
                    ctx.write_value(item, closed_at, Some(&Value::Timestamp(1_000)))?;
                }
                Ok(())
            },
        ))
        .unwrap();
    store.start().unwrap();

    let (finished, open) = store
        .write(move |ctx| {
            let finished = ctx.next_item()?;
            ctx.write_value(finished, done, Some(&Value::Bool(true)))?;
            let open = ctx.next_item()?;
            ctx.write_value(open, done, Some(&Value::Bool(false)))?;
            Ok((finished, open))
        })
        .unwrap();

    let (stamped, untouched) = store
        .read(move |ctx| {
            Ok((ctx.read_value(finished, closed_at)?, ctx.read_value(open, closed_at)?))
        })
        .unwrap();
    assert_eq!(stamped, Some(Value::Timestamp(1_000)));
    assert_eq!(untouched, None, "trigger only sees matching items");
}

#[test]
fn late_triggers_can_sweep_existing_items() {
    let store = ItemStore::in_memory();
    let done = store
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();
    let archived = store
        .register_attribute(Attribute::scalar("task:archived", ScalarKind::Bool))
        .unwrap();
    store.start().unwrap();
    let finished = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, done, Some(&Value::Bool(true)))?;
            Ok(item)
        })
        .unwrap();

    store
        .register_trigger(
            TriggerDef::new(
                "archive-done",
                Predicate::equals(done, Value::Bool(true)),
                move |ctx, items| {
                    for &item in items {
                        ctx.write_value(item, archived, Some(&Value::Bool(true)))?;
                    }
                    Ok(())
                },
            )
            .run_on_existing(),
        )
        .unwrap();

    let got = store
        .read(move |ctx| ctx.read_value(finished, archived))
        .unwrap();
    assert_eq!(got, Some(Value::Bool(true)), "installation swept the backlog");
}
