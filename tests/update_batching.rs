//! Update manager batching tests.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use state_store::{
    PendingUpdate, PrimitiveKind, Root, StoreError, StructSchema, TypeDesc, UpdateManager,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn test_schema() -> Arc<StructSchema> {
    StructSchema::builder("Root")
        .field(1, "counters", TypeDesc::map(PrimitiveKind::String, TypeDesc::integer()))
        .build()
}

/// Records every state callback as `(old, new)` counter maps.
fn recording_manager() -> (UpdateManager, Arc<Mutex<Vec<(serde_json::Value, serde_json::Value)>>>) {
    let manager = UpdateManager::new(Root::new(test_schema()));
    let calls = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    manager.set_state_callback(move |old, new| {
        let old = old.get_json(&["counters"]).unwrap_or_default();
        let new = new.get_json(&["counters"]).unwrap_or_default();
        recorded.lock().push((old, new));
    });
    (manager, calls)
}

/// Park the update thread until the returned sender is dropped or used.
fn hold(manager: &UpdateManager) -> Sender<()> {
    let (release, released) = bounded::<()>(0);
    let (started, running) = bounded::<()>(1);
    manager
        .enqueue(
            PendingUpdate::new("hold", move |_| {
                let _ = started.send(());
                let _ = released.recv();
                Ok(None)
            })
            .non_coalescing(),
        )
        .unwrap();
    running.recv_timeout(WAIT).unwrap();
    release
}

fn set_counter(key: String, value: i64, done: Sender<String>) -> PendingUpdate {
    let name = key.clone();
    PendingUpdate::with_storage(format!("set-{}", key), move |s| {
        s.set(&["counters", key.as_str()], &value)
    })
    .on_success(move || {
        let _ = done.send(name);
    })
}

fn wait_for(done: &Receiver<String>, n: usize) -> Vec<String> {
    (0..n).map(|_| done.recv_timeout(WAIT).unwrap()).collect()
}

#[test]
fn test_concurrent_updates_coalesce() {
    let (manager, calls) = recording_manager();
    let manager = Arc::new(manager);
    let (done, finished) = unbounded();

    let release = hold(&manager);
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let manager = manager.clone();
            let done = done.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    manager
                        .enqueue(set_counter(format!("w{}-{}", w, i), i, done.clone()))
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(manager.pending(), 40);
    drop(release);

    assert_eq!(wait_for(&finished, 40).len(), 40);
    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, serde_json::json!({}));
    assert_eq!(calls[0].1.as_object().unwrap().len(), 40);
    assert_eq!(manager.num_batches(), 1);
}

#[test]
fn test_non_coalescing_update_splits_batches() {
    let (manager, calls) = recording_manager();
    let (done, finished) = unbounded();

    let release = hold(&manager);
    manager.enqueue(set_counter("a".into(), 1, done.clone())).unwrap();
    manager.enqueue(set_counter("b".into(), 1, done.clone())).unwrap();
    manager
        .enqueue(set_counter("c".into(), 1, done.clone()).non_coalescing())
        .unwrap();
    manager.enqueue(set_counter("d".into(), 1, done.clone())).unwrap();
    manager.enqueue(set_counter("e".into(), 1, done.clone())).unwrap();
    drop(release);

    // Applied in enqueue order.
    assert_eq!(wait_for(&finished, 5), vec!["a", "b", "c", "d", "e"]);

    let keys: Vec<Vec<String>> = calls
        .lock()
        .iter()
        .map(|(_, new)| new.as_object().unwrap().keys().cloned().collect())
        .collect();
    assert_eq!(
        keys,
        vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string()
            ],
        ]
    );
}

#[test]
fn test_failed_update_does_not_spoil_batch() {
    let (manager, calls) = recording_manager();
    let (done, finished) = unbounded();
    let (errors, failed) = unbounded();

    let release = hold(&manager);
    manager.enqueue(set_counter("a".into(), 1, done.clone())).unwrap();
    manager
        .enqueue(
            PendingUpdate::with_storage("bad", |s| s.set(&["nope"], &1)).on_error(move |e| {
                let _ = errors.send(e);
            }),
        )
        .unwrap();
    manager.enqueue(set_counter("b".into(), 2, done.clone())).unwrap();
    drop(release);

    assert_eq!(wait_for(&finished, 2), vec!["a", "b"]);
    assert!(matches!(
        failed.recv_timeout(WAIT).unwrap(),
        StoreError::InvalidPath { .. }
    ));
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(manager.current().get::<i64, _>(&["counters", "b"]).unwrap(), 2);
}

#[test]
fn test_later_updates_see_earlier_ones() {
    let (manager, _calls) = recording_manager();
    let release = hold(&manager);
    let (done, finished) = unbounded();
    manager.enqueue(set_counter("x".into(), 1, done.clone())).unwrap();
    manager
        .enqueue(PendingUpdate::with_storage("bump", |s| {
            let x: i64 = s.get(&["counters", "x"])?;
            s.set(&["counters", "x"], &(x + 10))
        }))
        .unwrap();
    drop(release);
    wait_for(&finished, 1);

    manager
        .enqueue_blocking(PendingUpdate::new("noop", |_| Ok(None)))
        .unwrap();
    assert_eq!(manager.current().get::<i64, _>(&["counters", "x"]).unwrap(), 11);
}

#[test]
fn test_blocking_update_reports_error() {
    let (manager, calls) = recording_manager();
    let result = manager.enqueue_blocking(PendingUpdate::with_storage("bad", |s| {
        s.set(&["counters", "x"], "text")
    }));
    assert!(matches!(result, Err(StoreError::TypeError(_))));
    assert!(calls.lock().is_empty());
    assert_eq!(manager.num_batches(), 0);
}

#[test]
fn test_stop_drains_then_rejects() {
    let (manager, calls) = recording_manager();
    let (done, finished) = unbounded();
    for i in 0..5 {
        manager
            .enqueue(set_counter(format!("k{}", i), i, done.clone()))
            .unwrap();
    }
    manager.stop();
    assert!(manager.is_stopped());
    assert_eq!(wait_for(&finished, 5).len(), 5);
    assert!(!calls.lock().is_empty());

    let (errors, failed) = unbounded();
    let result = manager.enqueue(
        PendingUpdate::new("late", |_| Ok(None)).on_error(move |e| {
            let _ = errors.send(e);
        }),
    );
    assert_eq!(result, Err(StoreError::Stopped));
    assert_eq!(failed.recv_timeout(WAIT).unwrap(), StoreError::Stopped);
}
