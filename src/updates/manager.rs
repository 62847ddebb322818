//! Single-writer update loop.

use crate::error::{Result, StoreError};
use crate::state::{CowStorage, Root};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, trace};

type ApplyFn = Box<dyn FnOnce(&Root) -> Result<Option<Root>> + Send>;
type SuccessFn = Box<dyn FnOnce() + Send>;
type ErrorFn = Box<dyn FnOnce(StoreError) + Send>;

/// Called once per batch that changed the tree, with the roots before and
/// after the batch.
pub type StateCallback = Arc<dyn Fn(&Root, &Root) + Send + Sync>;

/// A queued mutation.
///
/// The mutation function receives the latest root and returns the next one,
/// or `None` if it changed nothing. Exactly one of `on_success` and
/// `on_error` fires, after which the update is dropped.
pub struct PendingUpdate {
    name: String,
    apply: ApplyFn,
    coalescing: bool,
    enqueued_at: Instant,
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
}

impl PendingUpdate {
    pub fn new<F>(name: impl Into<String>, apply: F) -> Self
    where
        F: FnOnce(&Root) -> Result<Option<Root>> + Send + 'static,
    {
        Self {
            name: name.into(),
            apply: Box::new(apply),
            coalescing: true,
            enqueued_at: Instant::now(),
            on_success: None,
            on_error: None,
        }
    }

    /// An update that edits a working copy of the latest root.
    pub fn with_storage<F>(name: impl Into<String>, edit: F) -> Self
    where
        F: FnOnce(&mut CowStorage) -> Result<()> + Send + 'static,
    {
        Self::new(name, move |root: &Root| {
            let mut storage = root.storage();
            edit(&mut storage)?;
            if storage.is_modified_from(root) {
                Ok(Some(storage.publish()))
            } else {
                Ok(None)
            }
        })
    }

    /// Apply this update in a batch of its own.
    pub fn non_coalescing(mut self) -> Self {
        self.coalescing = false;
        self
    }

    pub fn on_success<F: FnOnce() + Send + 'static>(mut self, f: F) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F: FnOnce(StoreError) + Send + 'static>(mut self, f: F) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_coalescing(&self) -> bool {
        self.coalescing
    }

    fn fail(self, err: StoreError) {
        if let Some(on_error) = self.on_error {
            on_error(err);
        }
    }
}

enum Signal {
    Wake,
    Stop,
}

#[derive(Default)]
struct Queue {
    updates: VecDeque<PendingUpdate>,
    stopped: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    current: RwLock<Root>,
    callback: RwLock<Option<StateCallback>>,
    batches: AtomicU64,
}

impl Shared {
    /// Take the next batch: a run of coalescing updates, or a single
    /// non-coalescing one at the head of the queue.
    fn next_batch(&self) -> Vec<PendingUpdate> {
        let mut queue = self.queue.lock();
        let updates = &mut queue.updates;
        let mut batch = Vec::new();
        while let Some(front) = updates.front() {
            if !front.coalescing {
                if batch.is_empty() {
                    batch.extend(updates.pop_front());
                }
                break;
            }
            batch.extend(updates.pop_front());
        }
        batch
    }

    /// Apply one batch. Returns `false` if the store can no longer publish,
    /// in which case every update of the batch has been failed.
    fn apply_batch(&self, batch: Vec<PendingUpdate>) -> bool {
        let started = Instant::now();
        let size = batch.len();
        let old = self.current.read().clone();
        let mut state = old.clone();
        let mut applied: Vec<(Option<SuccessFn>, Option<ErrorFn>)> = Vec::with_capacity(size);
        let mut rest = batch.into_iter();

        while let Some(update) = rest.next() {
            let PendingUpdate {
                name,
                apply,
                enqueued_at,
                on_success,
                on_error,
                ..
            } = update;
            trace!(update = %name, queued_us = enqueued_at.elapsed().as_micros() as u64, "applying update");
            let result = match panic::catch_unwind(AssertUnwindSafe(|| apply(&state))) {
                Ok(result) => result,
                Err(payload) => {
                    error!(update = %name, panic = panic_message(&*payload), "update panicked");
                    self.halt();
                    abandon(on_error, applied, rest);
                    return false;
                }
            };
            match result {
                Ok(Some(next)) if !Arc::ptr_eq(next.schema(), state.schema()) => {
                    error!(update = %name, "update returned a root of another schema");
                    self.halt();
                    abandon(on_error, applied, rest);
                    return false;
                }
                Ok(Some(next)) => {
                    state = next;
                    applied.push((on_success, on_error));
                }
                Ok(None) => applied.push((on_success, on_error)),
                Err(e) => {
                    debug!(update = %name, error = %e, "update failed");
                    if let Some(on_error) = on_error {
                        on_error(e);
                    }
                }
            }
        }

        let changed = !state.is_same(&old);
        if changed {
            *self.current.write() = state.clone();
            self.batches.fetch_add(1, Ordering::SeqCst);
            let callback = self.callback.read().clone();
            if let Some(callback) = callback {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(&old, &state))) {
                    error!(panic = panic_message(&*payload), "state callback panicked");
                    self.halt();
                    abandon(None, applied, std::iter::empty());
                    return false;
                }
            }
        }
        let num_applied = applied.len();
        for (on_success, _) in applied {
            if let Some(on_success) = on_success {
                on_success();
            }
        }
        debug!(
            batch = size,
            applied = num_applied,
            changed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "applied update batch"
        );
        true
    }

    /// Refuse further work.
    fn halt(&self) {
        self.queue.lock().stopped = true;
    }

    /// Refuse further work and fail whatever is still queued.
    fn shut_down(&self) {
        let leftover: Vec<PendingUpdate> = {
            let mut queue = self.queue.lock();
            queue.stopped = true;
            queue.updates.drain(..).collect()
        };
        for update in leftover {
            update.fail(StoreError::Stopped);
        }
    }
}

/// Fail every update of a batch that cannot be published.
fn abandon(
    current: Option<ErrorFn>,
    applied: Vec<(Option<SuccessFn>, Option<ErrorFn>)>,
    rest: impl Iterator<Item = PendingUpdate>,
) {
    let errors = current
        .into_iter()
        .chain(applied.into_iter().filter_map(|(_, on_error)| on_error));
    for on_error in errors {
        on_error(StoreError::Stopped);
    }
    for update in rest {
        update.fail(StoreError::Stopped);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn run(shared: Arc<Shared>, signals: Receiver<Signal>) {
    while let Ok(signal) = signals.recv() {
        if matches!(signal, Signal::Stop) {
            break;
        }
        loop {
            let batch = shared.next_batch();
            if batch.is_empty() {
                break;
            }
            if !shared.apply_batch(batch) {
                error!("update loop cannot publish, stopping the store");
                shared.shut_down();
                return;
            }
        }
    }
    debug!("update loop exited");
}

/// Serializes every mutation of one store onto a dedicated thread.
///
/// Updates apply in enqueue order. Consecutive coalescing updates are
/// applied as one batch that publishes one root and fires the state
/// callback once.
pub struct UpdateManager {
    shared: Arc<Shared>,
    signals: Sender<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateManager {
    pub fn new(root: Root) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            current: RwLock::new(root),
            callback: RwLock::new(None),
            batches: AtomicU64::new(0),
        });
        let (signals, receiver) = unbounded();
        let worker_shared = shared.clone();
        let worker = thread::spawn(move || run(worker_shared, receiver));
        Self {
            shared,
            signals,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Install the callback fired after each batch that changed the tree.
    ///
    /// It runs on the update thread; it must not block on a new update.
    pub fn set_state_callback<F>(&self, callback: F)
    where
        F: Fn(&Root, &Root) + Send + Sync + 'static,
    {
        *self.shared.callback.write() = Some(Arc::new(callback));
    }

    /// The last published root.
    pub fn current(&self) -> Root {
        self.shared.current.read().clone()
    }

    /// Queue an update without waiting for it.
    pub fn enqueue(&self, update: PendingUpdate) -> Result<()> {
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            drop(queue);
            update.fail(StoreError::Stopped);
            return Err(StoreError::Stopped);
        }
        queue.updates.push_back(update);
        drop(queue);
        let _ = self.signals.send(Signal::Wake);
        Ok(())
    }

    /// Queue an update and park the caller until it succeeded or failed.
    ///
    /// Must not be called from the update thread.
    pub fn enqueue_blocking(&self, mut update: PendingUpdate) -> Result<()> {
        let done = Arc::new((Mutex::new(None::<Result<()>>), Condvar::new()));

        let user_success = update.on_success.take();
        let success = done.clone();
        update.on_success = Some(Box::new(move || {
            if let Some(f) = user_success {
                f();
            }
            complete(&success, Ok(()));
        }));

        let user_error = update.on_error.take();
        let failure = done.clone();
        update.on_error = Some(Box::new(move |e: StoreError| {
            if let Some(f) = user_error {
                f(e.clone());
            }
            complete(&failure, Err(e));
        }));

        self.enqueue(update)?;

        let (lock, condvar) = &*done;
        let mut result = lock.lock();
        while result.is_none() {
            condvar.wait(&mut result);
        }
        result.take().unwrap_or(Err(StoreError::Stopped))
    }

    /// Updates waiting to be applied.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().updates.len()
    }

    /// Batches that changed the tree so far.
    pub fn num_batches(&self) -> u64 {
        self.shared.batches.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }

    /// Finish queued work, stop the update thread and reject later updates.
    pub fn stop(&self) {
        let already = std::mem::replace(&mut self.shared.queue.lock().stopped, true);
        if !already {
            let _ = self.signals.send(Signal::Stop);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("update thread panicked");
            }
        }
        self.shared.shut_down();
    }
}

impl Drop for UpdateManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn complete(slot: &(Mutex<Option<Result<()>>>, Condvar), result: Result<()>) {
    *slot.0.lock() = Some(result);
    slot.1.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{StructSchema, TypeDesc};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn root() -> Root {
        Root::new(
            StructSchema::builder("Root")
                .field(1, "tx", TypeDesc::bool())
                .field(2, "count", TypeDesc::integer())
                .build(),
        )
    }

    fn set_count(value: i64) -> PendingUpdate {
        PendingUpdate::with_storage("set-count", move |s| s.set(&["count"], &value))
    }

    #[test]
    fn test_blocking_update_publishes() {
        let manager = UpdateManager::new(root());
        manager
            .enqueue_blocking(PendingUpdate::with_storage("tx", |s| s.set(&["tx"], &true)))
            .unwrap();
        assert_eq!(manager.current().get::<bool, _>(&["tx"]).unwrap(), true);
        assert_eq!(manager.num_batches(), 1);
    }

    #[test]
    fn test_failed_update_does_not_poison_batch() {
        let manager = UpdateManager::new(root());
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        manager
            .enqueue(PendingUpdate::new("hold", move |_| {
                let _ = release_rx.recv();
                Ok(None)
            }))
            .unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        manager
            .enqueue(
                PendingUpdate::with_storage("bad", |s| s.set(&["missing"], &1))
                    .on_error(move |_| {
                        e.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();
        manager.enqueue(set_count(1)).unwrap();
        release_tx.send(()).unwrap();

        manager.enqueue_blocking(set_count(2)).unwrap();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(manager.current().get::<i64, _>(&["count"]).unwrap(), 2);
    }

    #[test]
    fn test_blocking_error_is_returned() {
        let manager = UpdateManager::new(root());
        let result = manager.enqueue_blocking(PendingUpdate::with_storage("bad", |s| s.set(&["tx"], &"yes")));
        assert!(matches!(result, Err(StoreError::TypeError(_))));
        assert_eq!(manager.num_batches(), 0);
    }

    #[test]
    fn test_noop_update_fires_no_callback() {
        let manager = UpdateManager::new(root());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        manager.set_state_callback(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        manager
            .enqueue_blocking(PendingUpdate::new("noop", |_| Ok(None)))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_rejects_updates() {
        let manager = UpdateManager::new(root());
        manager.stop();
        assert!(manager.is_stopped());
        let failed = Arc::new(AtomicUsize::new(0));
        let f = failed.clone();
        let result = manager.enqueue(set_count(1).on_error(move |e| {
            assert_eq!(e, StoreError::Stopped);
            f.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(result, Err(StoreError::Stopped));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.enqueue_blocking(set_count(2)),
            Err(StoreError::Stopped)
        );
    }

    #[test]
    fn test_unpublishable_root_stops_the_loop() {
        let manager = UpdateManager::new(root());
        let other = StructSchema::builder("Other")
            .field(1, "x", TypeDesc::integer())
            .build();
        let result = manager.enqueue_blocking(PendingUpdate::new("bad", move |_| {
            Ok(Some(Root::new(other)))
        }));
        assert_eq!(result, Err(StoreError::Stopped));
        assert!(manager.is_stopped());
        assert_eq!(manager.enqueue_blocking(set_count(1)), Err(StoreError::Stopped));
        assert_eq!(manager.current().get::<i64, _>(&["count"]).unwrap(), 0);
    }

    #[test]
    fn test_panicking_update_fails_its_batch_and_queue() {
        let manager = UpdateManager::new(root());
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        manager
            .enqueue(
                PendingUpdate::new("hold", move |_| {
                    let _ = release_rx.recv();
                    Ok(None)
                })
                .non_coalescing(),
            )
            .unwrap();

        let (errors_tx, errors_rx) = crossbeam_channel::unbounded();
        let failing = |name: &'static str, update: PendingUpdate| {
            let errors_tx = errors_tx.clone();
            update.on_error(move |e| {
                let _ = errors_tx.send((name, e));
            })
        };
        manager.enqueue(failing("before", set_count(1))).unwrap();
        manager
            .enqueue(failing(
                "boom",
                PendingUpdate::new("boom", |_| panic!("mutation blew up")),
            ))
            .unwrap();
        manager.enqueue(failing("after", set_count(2))).unwrap();
        manager
            .enqueue(failing("queued", set_count(3)).non_coalescing())
            .unwrap();
        release_tx.send(()).unwrap();

        let mut failed: Vec<_> = (0..4)
            .map(|_| errors_rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        failed.sort_by_key(|(name, _)| *name);
        assert_eq!(
            failed,
            vec![
                ("after", StoreError::Stopped),
                ("before", StoreError::Stopped),
                ("boom", StoreError::Stopped),
                ("queued", StoreError::Stopped),
            ]
        );
        assert!(manager.is_stopped());
        assert_eq!(manager.num_batches(), 0);
        assert_eq!(manager.enqueue_blocking(set_count(4)), Err(StoreError::Stopped));
    }

    #[test]
    fn test_readers_see_old_root_during_update() {
        let manager = UpdateManager::new(root());
        let before = manager.current();
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
        manager
            .enqueue(PendingUpdate::with_storage("slow", move |s| {
                s.set(&["count"], &5)?;
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(manager.current().is_same(&before));
        release_tx.send(()).unwrap();
        manager.enqueue_blocking(PendingUpdate::new("sync", |_| Ok(None))).unwrap();
        assert_eq!(manager.current().get::<i64, _>(&["count"]).unwrap(), 5);
        assert_eq!(before.get::<i64, _>(&["count"]).unwrap(), 0);
    }
}
