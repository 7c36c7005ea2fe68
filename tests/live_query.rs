use itemdb::{
    Attribute, ExecGate, Icn, ItemId, ItemStore, LiveEvent, LiveListener, Predicate, ScalarKind,
    Value,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Note {
    Snapshot(Vec<ItemId>),
    Changed { added: Vec<ItemId>, removed: Vec<ItemId> },
    Passed(Icn),
}

#[derive(Default)]
struct Recorder {
    notes: Mutex<Vec<Note>>,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }
}

impl LiveListener for Recorder {
    fn on_snapshot(&self, items: &[ItemId], _icn: Icn) {
        self.notes.lock().unwrap().push(Note::Snapshot(items.to_vec()));
    }

    fn on_changed(&self, event: &LiveEvent) {
        self.notes.lock().unwrap().push(Note::Changed {
            added: event.added.clone(),
            removed: event.removed.clone(),
        });
    }

    fn on_icn_passed(&self, icn: Icn) {
        self.notes.lock().unwrap().push(Note::Passed(icn));
    }
}

/// Refresh passes run as queued read jobs; a waited-on read submitted
/// after them cannot finish before they do.
fn drain(store: &ItemStore) {
    store.read(|_| Ok(())).unwrap();
}

#[test]
fn first_delivery_is_a_snapshot() {
    let store = ItemStore::in_memory();
    let done = store
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();
    store.start().unwrap();
    let finished = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, done, Some(&Value::Bool(true)))?;
            Ok(item)
        })
        .unwrap();

    let recorder = Recorder::new();
    let _handle = store
        .subscribe(
            Predicate::equals(done, Value::Bool(true)),
            ExecGate::Inline,
            recorder.clone(),
        )
        .unwrap();
    drain(&store);

    assert_eq!(recorder.notes(), vec![Note::Snapshot(vec![finished])]);
}

#[test]
fn commits_deliver_adds_removes_and_bare_passes() {
    let store = ItemStore::in_memory();
    let done = store
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();
    let note = store
        .register_attribute(Attribute::scalar("task:note", ScalarKind::Str))
        .unwrap();
    store.start().unwrap();

    let recorder = Recorder::new();
    let _handle = store
        .subscribe(
            Predicate::equals(done, Value::Bool(true)),
            ExecGate::Inline,
            recorder.clone(),
        )
        .unwrap();
    drain(&store);
    assert_eq!(recorder.notes(), vec![Note::Snapshot(vec![])]);

    // New matching item.
    let item = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, done, Some(&Value::Bool(true)))?;
            Ok(item)
        })
        .unwrap();
    drain(&store);
    assert_eq!(
        recorder.notes().last().unwrap(),
        &Note::Changed { added: vec![item], removed: vec![] }
    );

    // The item stops matching.
    store
        .write(move |ctx| {
            ctx.write_value(item, done, Some(&Value::Bool(false)))?;
            Ok(())
        })
        .unwrap();
    drain(&store);
    assert_eq!(
        recorder.notes().last().unwrap(),
        &Note::Changed { added: vec![], removed: vec![item] }
    );

    // A commit that does not affect this query still reports its ICN.
    store
        .write(move |ctx| {
            let other = ctx.next_item()?;
            ctx.write_value(other, note, Some(&Value::str("unrelated")))?;
            Ok(())
        })
        .unwrap();
    let icn = store.current_icn();
    drain(&store);
    assert_eq!(recorder.notes().last().unwrap(), &Note::Passed(icn));
}

#[test]
fn listeners_on_equivalent_predicates_share_one_query() {
    let store = ItemStore::in_memory();
    let a = store
        .register_attribute(Attribute::scalar("t:a", ScalarKind::Int))
        .unwrap();
    let b = store
        .register_attribute(Attribute::scalar("t:b", ScalarKind::Int))
        .unwrap();
    store.start().unwrap();

    let first = Recorder::new();
    let second = Recorder::new();
    let left = Predicate::and(vec![
        Predicate::equals(a, Value::Int(1)),
        Predicate::equals(b, Value::Int(2)),
    ]);
    let right = Predicate::and(vec![
        Predicate::equals(b, Value::Int(2)),
        Predicate::equals(a, Value::Int(1)),
    ]);
    let _h1 = store.subscribe(left, ExecGate::Inline, first.clone()).unwrap();
    let _h2 = store.subscribe(right, ExecGate::Inline, second.clone()).unwrap();
    drain(&store);

    let item = store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, a, Some(&Value::Int(1)))?;
            ctx.write_value(item, b, Some(&Value::Int(2)))?;
            Ok(item)
        })
        .unwrap();
    drain(&store);

    for recorder in [&first, &second] {
        let notes = recorder.notes();
        assert_eq!(notes[0], Note::Snapshot(vec![]));
        assert_eq!(
            notes.last().unwrap(),
            &Note::Changed { added: vec![item], removed: vec![] }
        );
    }
}

#[test]
fn subscribing_with_a_foreign_attribute_handle_fails_up_front() {
    let other = ItemStore::in_memory();
    let foreign = other
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();

    let store = ItemStore::in_memory();
    store.start().unwrap();

    let recorder = Recorder::new();
    let err = match store.subscribe(
        Predicate::equals(foreign, Value::Bool(true)),
        ExecGate::Inline,
        recorder.clone(),
    ) {
        Ok(_) => panic!("unknown attribute handle was accepted"),
        Err(err) => err,
    };
    assert_eq!(err.code().as_str(), "attribute_config");
    assert!(recorder.notes().is_empty(), "nothing was subscribed");
}

#[test]
fn dropping_the_handle_stops_notifications() {
    let store = ItemStore::in_memory();
    let done = store
        .register_attribute(Attribute::scalar("task:done", ScalarKind::Bool))
        .unwrap();
    store.start().unwrap();

    let recorder = Recorder::new();
    let handle = store
        .subscribe(
            Predicate::equals(done, Value::Bool(true)),
            ExecGate::Inline,
            recorder.clone(),
        )
        .unwrap();
    drain(&store);
    drop(handle);

    store
        .write(move |ctx| {
            let item = ctx.next_item()?;
            ctx.write_value(item, done, Some(&Value::Bool(true)))?;
            Ok(())
        })
        .unwrap();
    drain(&store);
    assert_eq!(recorder.notes(), vec![Note::Snapshot(vec![])]);
}

#[test]
fn identified_terms_re_resolve_each_pass() {
    let store = ItemStore::in_memory();
    let assignee = store
        .register_attribute(Attribute::scalar("task:assignee", ScalarKind::Ref))
        .unwrap();
    store.start().unwrap();

    let recorder = Recorder::new();
    let _handle = store
        .subscribe(
            Predicate::equals_identified(assignee, "user:me"),
            ExecGate::Inline,
            recorder.clone(),
        )
        .unwrap();
    drain(&store);
    assert_eq!(recorder.notes(), vec![Note::Snapshot(vec![])]);

    // Materializing the identity and pointing a task at it lands in one
    // commit; the pass resolves the fresh identity and reloads.
    let task = store
        .write(move |ctx| {
            let me = ctx.materialize(&itemdb::IdentifiedObject::new("user:me"))?;
            let task = ctx.next_item()?;
            ctx.write_value(task, assignee, Some(&Value::item(me)))?;
            Ok(task)
        })
        .unwrap();
    drain(&store);
    assert_eq!(
        recorder.notes().last().unwrap(),
        &Note::Changed { added: vec![task], removed: vec![] }
    );
}
