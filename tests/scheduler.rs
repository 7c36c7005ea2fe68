use itemdb::{ExecGate, ItemStore, Priority};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Parks the worker inside a read job until the returned sender fires.
fn block_worker(store: &ItemStore) -> (mpsc::Sender<()>, itemdb::JobHandle<()>) {
    let (release, gate) = mpsc::channel::<()>();
    let handle = store
        .submit_read(Priority::FOREGROUND, move |_| {
            let _ = gate.recv();
            Ok(())
        })
        .unwrap();
    (release, handle)
}

#[test]
fn higher_priority_jobs_overtake_queued_work() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (release, blocker) = block_worker(&store);

    // Queued while the worker is parked, so selection order decides.
    let o = order.clone();
    let background = store
        .submit_read(Priority::BACKGROUND, move |_| {
            o.lock().unwrap().push("background");
            Ok(())
        })
        .unwrap();
    let o = order.clone();
    let foreground = store
        .submit_read(Priority::FOREGROUND, move |_| {
            o.lock().unwrap().push("foreground");
            Ok(())
        })
        .unwrap();

    release.send(()).unwrap();
    blocker.wait().unwrap();
    foreground.wait().unwrap();
    background.wait().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["foreground", "background"]);
}

#[test]
fn equal_priority_runs_in_submission_order() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (release, blocker) = block_worker(&store);
    let mut handles = Vec::new();
    for n in 0..4 {
        let o = order.clone();
        let handle = store
            .submit_read(Priority::FOREGROUND, move |_| {
                o.lock().unwrap().push(n);
                Ok(())
            })
            .unwrap();
        handles.push(handle);
    }

    release.send(()).unwrap();
    blocker.wait().unwrap();
    for handle in handles {
        handle.wait().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn cancelling_a_queued_job_skips_it() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let ran = Arc::new(Mutex::new(false));
    let (release, blocker) = block_worker(&store);
    let r = ran.clone();
    let queued = store
        .submit_read(Priority::FOREGROUND, move |_| {
            *r.lock().unwrap() = true;
            Ok(())
        })
        .unwrap();
    queued.cancel();
    release.send(()).unwrap();
    blocker.wait().unwrap();

    let err = queued.wait().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!*ran.lock().unwrap(), "body never ran");
}

#[test]
fn cancelling_a_running_job_interrupts_it() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let (started_tx, started) = mpsc::channel::<()>();
    let handle: itemdb::JobHandle<()> = store
        .submit_read(Priority::FOREGROUND, move |ctx| {
            started_tx.send(()).unwrap();
            loop {
                ctx.ensure_alive()?;
                thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

    started.recv().unwrap();
    handle.cancel();
    let err = handle.wait().unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn hurrying_lets_a_job_cut_its_work_short() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let (started_tx, started) = mpsc::channel::<()>();
    let handle = store
        .submit_read(Priority::FOREGROUND, move |ctx| {
            started_tx.send(()).unwrap();
            let mut rounds = 0u32;
            while !ctx.hurried() {
                ctx.ensure_alive()?;
                thread::sleep(Duration::from_millis(5));
                rounds += 1;
            }
            Ok(rounds)
        })
        .unwrap();

    started.recv().unwrap();
    handle.hurry();
    handle.wait().unwrap();
}

#[test]
fn arriving_foreground_work_hurries_a_running_background_job() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let (started_tx, started) = mpsc::channel::<()>();
    let background = store
        .submit_write(Priority::BACKGROUND, move |ctx| {
            started_tx.send(()).unwrap();
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while !ctx.hurried() {
                ctx.ensure_alive()?;
                assert!(std::time::Instant::now() < deadline, "background job was never hurried");
                thread::sleep(Duration::from_millis(2));
            }
            Ok(())
        })
        .unwrap();

    started.recv().unwrap();
    let foreground = store.submit_write(Priority::FOREGROUND, |_| Ok(())).unwrap();
    background.wait().unwrap();
    foreground.wait().unwrap();
}

#[test]
fn wait_timeout_returns_the_handle_while_the_job_is_stuck_in_line() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let (release, blocker) = block_worker(&store);
    let queued = store
        .submit_read(Priority::FOREGROUND, |_| Ok(42))
        .unwrap();

    let queued = match queued.wait_timeout(Duration::from_millis(50)) {
        Err(handle) => handle,
        Ok(result) => panic!("job finished behind a parked worker: {result:?}"),
    };

    release.send(()).unwrap();
    blocker.wait().unwrap();
    assert_eq!(queued.wait().unwrap(), 42);
}

#[test]
fn completion_callbacks_deliver_the_result() {
    let store = ItemStore::in_memory();
    store.start().unwrap();

    let (tx, rx) = mpsc::channel();
    store
        .submit_read(Priority::FOREGROUND, |_| Ok("done"))
        .unwrap()
        .on_complete(ExecGate::Inline, move |result| {
            tx.send(result).unwrap();
        });
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap(), "done");
}

#[test]
fn jobs_submitted_after_stop_are_rejected() {
    let store = ItemStore::in_memory();
    store.start().unwrap();
    store.write(|_| Ok(())).unwrap();
    store.stop();

    let err = match store.submit_read(Priority::FOREGROUND, |_| Ok(())) {
        Ok(_) => panic!("stopped store accepted a job"),
        Err(err) => err,
    };
    assert_eq!(err.code().as_str(), "lifecycle");
}
