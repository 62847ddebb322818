//! Main store tying the tree, the update loop and subscriptions together.

use crate::error::Result;
use crate::schema::StructSchema;
use crate::state::Root;
use crate::subscriptions::{
    AccessPolicy, AllowAll, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionManager, SubscriptionRequest,
};
use crate::types::{to_path, ConcretePath, Delta, ExtendedPath, Patch, Protocol};
use crate::updates::{PendingUpdate, UpdateManager};
use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Max buffered events per subscription before it is disconnected.
    /// Default: 1000
    pub subscription_buffer_size: usize,

    /// Resolution of heartbeat and GR hold timers.
    /// Default: 50ms
    pub timer_tick: Duration,

    /// Heartbeat interval for subscriptions that do not set one.
    pub default_heartbeat_interval: Option<Duration>,

    /// GR hold time for subscriptions that do not set one.
    pub default_gr_hold_time: Duration,

    /// Hold new subscriptions until a publisher owns their namespace.
    pub track_publishers: bool,

    /// Replace, rather than reject, a duplicate subscriber id.
    pub force_register_subscriptions: bool,

    /// Report struct members by numeric id in subscription output.
    pub use_id_paths: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            subscription_buffer_size: 1000,
            timer_tick: Duration::from_millis(50),
            default_heartbeat_interval: None,
            default_gr_hold_time: Duration::ZERO,
            track_publishers: false,
            force_register_subscriptions: false,
            use_id_paths: false,
        }
    }
}

impl StoreConfig {
    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            buffer_size: self.subscription_buffer_size,
            default_heartbeat_interval: self.default_heartbeat_interval,
            default_gr_hold_time: self.default_gr_hold_time,
            track_publishers: self.track_publishers,
            force_register: self.force_register_subscriptions,
            use_id_paths: self.use_id_paths,
            ..SubscriptionConfig::default()
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub num_subscriptions: usize,
    /// Anchored paths, including ones resolved from extended paths.
    pub num_resolved_paths: usize,
    pub num_path_stores: usize,
    pub num_publishers: usize,
    pub pending_updates: usize,
    pub batches_applied: u64,
}

struct Timer {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// A schema-typed tree that many readers can subscribe to.
///
/// Reads go straight to the last published root. Writes are queued on the
/// update thread; the convenience writers below block until their update
/// was applied. Every published change is pushed to the affected
/// subscriptions before the next batch runs.
pub struct SubscribableStore {
    config: StoreConfig,
    updates: UpdateManager,
    subscriptions: Arc<SubscriptionManager>,
    timer: Mutex<Option<Timer>>,
}

impl SubscribableStore {
    /// Create a store whose tree starts with default values.
    pub fn new(schema: Arc<StructSchema>, config: StoreConfig) -> Self {
        Self::with_root(Root::new(schema), config)
    }

    pub fn with_root(root: Root, config: StoreConfig) -> Self {
        Self::with_policy(root, config, Arc::new(AllowAll))
    }

    pub fn with_policy(root: Root, config: StoreConfig, policy: Arc<dyn AccessPolicy>) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::with_policy(
            root.clone(),
            config.subscription_config(),
            policy,
        ));

        let updates = UpdateManager::new(root);
        let serving = subscriptions.clone();
        updates.set_state_callback(move |old, new| serving.serve(old, new));

        let (stop, stopped) = bounded::<()>(1);
        let ticker = tick(config.timer_tick);
        let ticking = subscriptions.clone();
        let thread = thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => ticking.tick(Instant::now()),
                recv(stopped) -> _ => break,
            }
        });

        info!(tick_ms = config.timer_tick.as_millis() as u64, "store started");
        Self {
            config,
            updates,
            subscriptions,
            timer: Mutex::new(Some(Timer { stop, thread })),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The last published root.
    pub fn root(&self) -> Root {
        self.updates.current()
    }

    // --- Reads ---

    pub fn get<T: DeserializeOwned, S: AsRef<str>>(&self, path: &[S]) -> Result<T> {
        self.root().get(path)
    }

    pub fn get_json<S: AsRef<str>>(&self, path: &[S]) -> Result<serde_json::Value> {
        self.root().get_json(path)
    }

    pub fn get_encoded<S: AsRef<str>>(&self, path: &[S], protocol: Protocol) -> Result<Vec<u8>> {
        self.root().get_encoded(path, protocol)
    }

    /// Every concrete path matching `path`, with its encoded value.
    pub fn get_encoded_extended(
        &self,
        path: &ExtendedPath,
        protocol: Protocol,
    ) -> Result<Vec<(ConcretePath, Vec<u8>)>> {
        self.root().get_encoded_extended_with(
            path,
            protocol,
            Some(self.subscriptions.regex_cache()),
            self.config.use_id_paths,
        )
    }

    // --- Writes ---

    pub fn set<T: Serialize + ?Sized, S: AsRef<str>>(&self, path: &[S], value: &T) -> Result<()> {
        let path = to_path(path);
        let json = serde_json::to_value(value)?;
        self.update_blocking(PendingUpdate::with_storage("set", move |s| {
            s.set_json(path.as_slice(), &json)
        }))
    }

    pub fn set_encoded<S: AsRef<str>>(&self, path: &[S], bytes: &[u8], protocol: Protocol) -> Result<()> {
        let path = to_path(path);
        let bytes = bytes.to_vec();
        self.update_blocking(PendingUpdate::with_storage("set-encoded", move |s| {
            s.set_encoded(path.as_slice(), &bytes, protocol)
        }))
    }

    pub fn remove<S: AsRef<str>>(&self, path: &[S]) -> Result<()> {
        let path = to_path(path);
        self.update_blocking(PendingUpdate::with_storage("remove", move |s| s.remove(path.as_slice())))
    }

    pub fn patch(&self, patch: Patch) -> Result<()> {
        self.update_blocking(PendingUpdate::with_storage("patch", move |s| s.patch(&patch)))
    }

    /// Apply a delta. Units that apply are kept even if others fail; the
    /// first failure is returned.
    pub fn patch_delta(&self, delta: Delta) -> Result<()> {
        let first_error = Arc::new(Mutex::new(None));
        let slot = first_error.clone();
        self.update_blocking(PendingUpdate::new("patch-delta", move |root: &Root| {
            let mut storage = root.storage();
            if let Err(e) = storage.patch_delta(&delta) {
                *slot.lock() = Some(e);
            }
            if storage.is_modified_from(root) {
                Ok(Some(storage.publish()))
            } else {
                Ok(None)
            }
        }))?;
        let first_error = first_error.lock().take();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue an update without waiting for it.
    pub fn update(&self, update: PendingUpdate) -> Result<()> {
        debug!(update = update.name(), "queueing update");
        self.updates.enqueue(update)
    }

    /// Queue an update and wait until it was applied or rejected.
    pub fn update_blocking(&self, update: PendingUpdate) -> Result<()> {
        self.updates.enqueue_blocking(update)
    }

    // --- Subscriptions ---

    pub fn subscribe(&self, request: SubscriptionRequest) -> Result<SubscriptionHandle> {
        self.subscriptions.subscribe(request)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.subscriptions.unsubscribe(id)
    }

    pub fn register_publisher<S: AsRef<str>>(&self, publisher_id: &str, path: &[S]) -> Result<()> {
        self.subscriptions.register_publisher(publisher_id, path)
    }

    pub fn unregister_publisher<S: AsRef<str>>(
        &self,
        publisher_id: &str,
        path: &[S],
        graceful_restart: bool,
    ) -> Result<()> {
        self.subscriptions
            .unregister_publisher(publisher_id, path, graceful_restart)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            num_subscriptions: self.subscriptions.num_subscriptions(),
            num_resolved_paths: self.subscriptions.num_resolved_paths(),
            num_path_stores: self.subscriptions.num_path_stores(),
            num_publishers: self.subscriptions.num_publishers(),
            pending_updates: self.updates.pending(),
            batches_applied: self.updates.num_batches(),
        }
    }

    /// Apply queued updates, then stop the update and timer threads and
    /// terminate every subscription. Later writes fail with `Stopped`.
    pub fn stop(&self) {
        self.updates.stop();
        if let Some(timer) = self.timer.lock().take() {
            let _ = timer.stop.send(());
            let _ = timer.thread.join();
            self.subscriptions.stop();
            info!("store stopped");
        }
    }
}

impl Drop for SubscribableStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::schema::TypeDesc;

    fn schema() -> Arc<StructSchema> {
        StructSchema::builder("Root")
            .field(1, "tx", TypeDesc::bool())
            .field(2, "name", TypeDesc::string())
            .build()
    }

    #[test]
    fn test_set_get() {
        let store = SubscribableStore::new(schema(), StoreConfig::default());
        store.set(&["name"], "eth0").unwrap();
        assert_eq!(store.get::<String, _>(&["name"]).unwrap(), "eth0");
        assert_eq!(store.stats().batches_applied, 1);
    }

    #[test]
    fn test_stop_rejects_writes() {
        let store = SubscribableStore::new(schema(), StoreConfig::default());
        let handle = store
            .subscribe(SubscriptionRequest::new("s").path("tx", &["tx"]))
            .unwrap();
        store.stop();
        assert_eq!(store.set(&["tx"], &false), Err(StoreError::Stopped));
        assert_eq!(store.stats().num_subscriptions, 0);

        let last = std::iter::from_fn(|| handle.try_recv().ok()).last();
        assert_eq!(
            last,
            Some(crate::subscriptions::SubscriptionEvent::Terminated {
                code: crate::subscriptions::TerminationCode::Stopped
            })
        );
        // Reads keep working on the last root.
        assert!(store.get::<bool, _>(&["tx"]).is_ok());
    }
}
