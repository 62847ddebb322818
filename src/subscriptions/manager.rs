//! Subscription manager: registers subscriptions and serves published roots.

use super::path_store::{LookupKinds, SubscriptionPathStore, SubscriptionRef};
use super::publishers::{AccessPolicy, AllowAll, PublisherInfo, PublisherRegistry};
use super::types::{
    SubscriptionConfig, SubscriptionEvent, SubscriptionHandle, SubscriptionId, SubscriptionMode,
    SubscriptionPath, SubscriptionRequest, SubscriptionState, TerminationCode,
};
use crate::error::{join_path, Result, StoreError};
use crate::nodes::Node;
use crate::schema::TypeDesc;
use crate::state::{build_patch, Root};
use crate::types::{
    to_path, ConcretePath, Delta, DeltaUnit, ExtendedPath, Patch, PatchNode, PathElem, Protocol,
    ValuePatch,
};
use crate::visitors::{
    canonicalize_path, visit_delta, visit_extended, CompiledPath, DeltaElem, DeltaElemTag,
    DeltaMode, DeltaOptions, DeltaVisitor, RegexCache,
};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

enum KeyPath {
    Concrete(ConcretePath),
    Extended(Arc<CompiledPath>),
}

enum SendOutcome {
    Sent,
    Full,
    Gone,
}

/// What a subscriber claims: the same subscriber may follow different
/// paths, or the same paths in another mode, at once.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ClientKey {
    subscriber_id: String,
    /// Canonical form of each keyed path.
    paths: BTreeMap<String, ExtendedPath>,
    mode: SubscriptionMode,
}

impl ClientKey {
    fn describe(&self) -> String {
        let paths: Vec<String> = self
            .paths
            .values()
            .map(|p| {
                p.elems()
                    .iter()
                    .map(|e| match e {
                        PathElem::Raw(raw) => raw.clone(),
                        PathElem::Regex(re) => format!("{{{}}}", re),
                        PathElem::Any => "*".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .collect();
        format!(
            "subscriber {} on /{} ({:?})",
            self.subscriber_id,
            paths.join(", /"),
            self.mode
        )
    }
}

/// Internal subscription state.
struct Subscription {
    id: SubscriptionId,
    client: ClientKey,
    paths: BTreeMap<String, KeyPath>,
    /// Publisher namespace of each path, `None` for a leading wildcard.
    namespaces: Vec<Option<String>>,
    protocol: Protocol,
    mode: SubscriptionMode,
    sender: Sender<SubscriptionEvent>,
    state: SubscriptionState,
    heartbeat_interval: Option<Duration>,
    gr_hold_time: Duration,
    /// When a GR hold or the wait for a first publisher runs out.
    deadline: Option<Instant>,
    last_sent: Instant,
}

impl Subscription {
    fn send(&mut self, event: SubscriptionEvent) -> SendOutcome {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.last_sent = Instant::now();
                SendOutcome::Sent
            }
            Err(TrySendError::Full(_)) => SendOutcome::Full,
            Err(TrySendError::Disconnected(_)) => SendOutcome::Gone,
        }
    }

    fn depends_on(&self, publisher: &PublisherInfo) -> bool {
        self.namespaces.iter().any(|ns| publisher.owns(ns.as_deref()))
    }

    fn is_covered(&self, publishers: &PublisherRegistry) -> bool {
        self.namespaces.iter().all(|ns| publishers.covers(ns.as_deref()))
    }

    /// Data flows once the initial sync went out.
    fn receives_data(&self) -> bool {
        self.state != SubscriptionState::Resolving
    }
}

/// Events queued during one pass, flushed per subscription.
#[derive(Default)]
struct Outbox {
    events: BTreeMap<SubscriptionId, Vec<SubscriptionEvent>>,
    deltas: BTreeMap<(SubscriptionId, String), Delta>,
}

impl Outbox {
    fn push(&mut self, id: SubscriptionId, event: SubscriptionEvent) {
        self.events.entry(id).or_default().push(event);
    }

    fn delta(&mut self, id: SubscriptionId, key: &str, protocol: Protocol) -> &mut Delta {
        self.deltas
            .entry((id, key.to_string()))
            .or_insert_with(|| Delta {
                changes: Vec::new(),
                protocol,
            })
    }

    fn into_batches(self) -> BTreeMap<SubscriptionId, Vec<SubscriptionEvent>> {
        let Outbox { mut events, deltas } = self;
        for ((id, key), delta) in deltas {
            events
                .entry(id)
                .or_default()
                .push(SubscriptionEvent::Delta { key, delta });
        }
        events
    }
}

fn encode(node: Option<&Arc<Node>>, protocol: Protocol) -> Result<Option<Vec<u8>>> {
    node.map(|n| n.encode(protocol)).transpose()
}

/// Queue the full-sync item for one path of `sub`.
fn sync_item(
    out: &mut Outbox,
    sub: &Subscription,
    key: &str,
    path: &[String],
    node: Option<&Arc<Node>>,
) -> Result<()> {
    let protocol = sub.protocol;
    match sub.mode {
        SubscriptionMode::Path => out.push(
            sub.id,
            SubscriptionEvent::State {
                key: key.to_string(),
                path: path.to_vec(),
                value: encode(node, protocol)?,
                protocol,
            },
        ),
        SubscriptionMode::Delta => {
            let unit = encode(node, protocol)?.map(|new| DeltaUnit {
                path: path.to_vec(),
                old: None,
                new: Some(new),
            });
            out.delta(sub.id, key, protocol).changes.extend(unit);
        }
        SubscriptionMode::Patch => {
            let patch = match node {
                Some(node) => PatchNode::Value(ValuePatch {
                    value: node.encode(protocol)?,
                    protocol,
                }),
                None => PatchNode::Delete,
            };
            out.push(
                sub.id,
                SubscriptionEvent::Patch {
                    key: key.to_string(),
                    patch: Patch {
                        base_path: path.to_vec(),
                        patch,
                    },
                },
            );
        }
    }
    Ok(())
}

/// A subscription touched by one reported change.
struct Hit {
    sub: SubscriptionRef,
    path: ConcretePath,
    old: Option<Arc<Node>>,
    new: Option<Arc<Node>>,
    /// Anchored exactly at `path` rather than at an ancestor.
    target: bool,
    /// A minimal change, or the edge of an added or removed subtree.
    edge: bool,
}

/// Queue the incremental item for one hit.
fn change_item(out: &mut Outbox, sub: &Subscription, hit: &Hit) -> Result<()> {
    let protocol = sub.protocol;
    let key = &hit.sub.key;
    match sub.mode {
        SubscriptionMode::Path if hit.target => out.push(
            sub.id,
            SubscriptionEvent::State {
                key: key.clone(),
                path: hit.path.clone(),
                value: encode(hit.new.as_ref(), protocol)?,
                protocol,
            },
        ),
        SubscriptionMode::Delta if hit.edge => {
            let unit = DeltaUnit {
                path: hit.path.clone(),
                old: encode(hit.old.as_ref(), protocol)?,
                new: encode(hit.new.as_ref(), protocol)?,
            };
            out.delta(sub.id, key, protocol).changes.push(unit);
        }
        SubscriptionMode::Patch if hit.target => {
            if let Some(patch) = build_patch(hit.old.as_ref(), hit.new.as_ref(), protocol)? {
                out.push(
                    sub.id,
                    SubscriptionEvent::Patch {
                        key: key.clone(),
                        patch: Patch {
                            base_path: hit.path.clone(),
                            patch,
                        },
                    },
                );
            }
        }
        _ => {}
    }
    Ok(())
}

/// Walks the diff of two roots, recording who is affected and which
/// paths came and went.
struct ServeCollector<'a> {
    store: &'a SubscriptionPathStore,
    hits: Vec<Hit>,
    added: Vec<ConcretePath>,
    deleted: Vec<ConcretePath>,
}

impl DeltaVisitor for ServeCollector<'_> {
    fn visit(&mut self, elem: DeltaElem<'_>) {
        let edge = elem.tag == DeltaElemTag::Minimal || elem.is_added() || elem.is_removed();
        if elem.is_added() {
            self.added.push(elem.path.to_vec());
        } else if elem.is_removed() {
            self.deleted.push(elem.path.to_vec());
        }

        let mut found: Vec<(SubscriptionRef, bool)> = self
            .store
            .find(elem.path, LookupKinds::TARGET)
            .into_iter()
            .map(|s| (s, true))
            .collect();
        if edge {
            found.extend(
                self.store
                    .find(elem.path, LookupKinds::PARENTS)
                    .into_iter()
                    .map(|s| (s, false)),
            );
        }
        for (sub, target) in found {
            self.hits.push(Hit {
                sub,
                path: elem.path.to_vec(),
                old: elem.old.cloned(),
                new: elem.new.cloned(),
                target,
                edge,
            });
        }
    }

    fn should_descend(&mut self, path: &[String]) -> bool {
        self.store.has_interest(path)
    }
}

struct Registry {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    by_client: HashMap<ClientKey, SubscriptionId>,
    path_store: SubscriptionPathStore,
    publishers: PublisherRegistry,
    /// Root the subscriptions are in sync with.
    last_served: Root,
}

impl Registry {
    /// Drop a subscription, telling it why if there is room.
    fn remove(&mut self, id: SubscriptionId, code: Option<TerminationCode>) {
        let Some(mut sub) = self.subscriptions.remove(&id) else {
            return;
        };
        if self.by_client.get(&sub.client) == Some(&id) {
            self.by_client.remove(&sub.client);
        }
        self.path_store.remove_subscription(id);
        if let Some(code) = code {
            let _ = sub.send(SubscriptionEvent::Terminated { code });
            info!(subscription = %id, subscriber = %sub.client.subscriber_id, ?code, "subscription terminated");
        } else {
            debug!(subscription = %id, "subscriber went away");
        }
    }

    fn notify(&mut self, id: SubscriptionId, event: SubscriptionEvent) {
        let outcome = match self.subscriptions.get_mut(&id) {
            Some(sub) => sub.send(event),
            None => return,
        };
        match outcome {
            SendOutcome::Sent => {}
            SendOutcome::Full => {
                warn!(subscription = %id, "subscriber buffer full, disconnecting");
                self.remove(id, Some(TerminationCode::BufferOverflow));
            }
            SendOutcome::Gone => self.remove(id, None),
        }
    }

    fn set_state(&mut self, id: SubscriptionId, state: SubscriptionState) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.state = state;
            self.notify(id, SubscriptionEvent::StateChanged { state });
        }
    }

    /// Send queued events. Returns how many subscriptions got something.
    fn deliver(&mut self, out: Outbox) -> usize {
        let mut dropped = Vec::new();
        let mut served = 0;
        for (id, events) in out.into_batches() {
            let Some(sub) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            if !sub.receives_data() {
                continue;
            }
            served += 1;
            for event in events {
                match sub.send(event) {
                    SendOutcome::Sent => {}
                    SendOutcome::Full => {
                        dropped.push((id, Some(TerminationCode::BufferOverflow)));
                        break;
                    }
                    SendOutcome::Gone => {
                        dropped.push((id, None));
                        break;
                    }
                }
            }
        }
        for (id, code) in dropped {
            if code.is_some() {
                warn!(subscription = %id, "subscriber buffer full, disconnecting");
            }
            self.remove(id, code);
        }
        served
    }

    /// Send one full-sync item per path from the last served root.
    fn initial_sync(&mut self, id: SubscriptionId, use_id_paths: bool) {
        let Some(sub) = self.subscriptions.get(&id) else {
            return;
        };
        let root = &self.last_served;
        let mut out = Outbox::default();
        for (key, path) in &sub.paths {
            let result = match path {
                KeyPath::Concrete(path) => {
                    sync_item(&mut out, sub, key, path, root.get_node(path.as_slice()))
                }
                KeyPath::Extended(pattern) => {
                    let mut matches = Vec::new();
                    visit_extended(root.node(), pattern, use_id_paths, |p, node| {
                        matches.push((p.to_vec(), node.clone()));
                    });
                    if matches.is_empty() && sub.mode == SubscriptionMode::Delta {
                        out.delta(id, key, sub.protocol);
                    }
                    matches
                        .iter()
                        .try_for_each(|(p, node)| sync_item(&mut out, sub, key, p, Some(node)))
                }
            };
            if let Err(e) = result {
                warn!(subscription = %id, key = %key, error = %e, "initial sync failed");
            }
        }
        self.deliver(out);
    }

    fn activate(&mut self, id: SubscriptionId, use_id_paths: bool) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.state = SubscriptionState::Active;
            sub.deadline = None;
        }
        self.initial_sync(id, use_id_paths);
        if self.subscriptions.contains_key(&id) {
            self.notify(
                id,
                SubscriptionEvent::StateChanged {
                    state: SubscriptionState::Active,
                },
            );
        }
    }

    /// Forget restarting publishers no held subscription waits for.
    fn release_publishers(&mut self) {
        let subscriptions = &self.subscriptions;
        let released = self.publishers.release(|publisher| {
            subscriptions.values().any(|s| {
                s.state == SubscriptionState::DisconnectedGrHold && s.depends_on(publisher)
            })
        });
        for publisher in released {
            debug!(publisher = %publisher.id, path = %join_path(&publisher.path), "restarting publisher released");
        }
    }

    fn expire(&mut self, id: SubscriptionId) {
        warn!(subscription = %id, "GR hold expired");
        self.set_state(id, SubscriptionState::DisconnectedGrHoldExpired);
        self.remove(id, Some(TerminationCode::PublisherGone));
    }
}

/// Manages subscriptions and pushes changes to them.
///
/// The update thread calls [`SubscriptionManager::serve`] with every
/// published root; caller threads subscribe and unsubscribe concurrently.
/// All bookkeeping sits behind one lock, so a subscriber either sees a root
/// through its initial sync or through the serve pass that follows.
pub struct SubscriptionManager {
    registry: RwLock<Registry>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    regex_cache: RegexCache,
    policy: Arc<dyn AccessPolicy>,
    config: SubscriptionConfig,
}

impl SubscriptionManager {
    pub fn new(root: Root, config: SubscriptionConfig) -> Self {
        Self::with_policy(root, config, Arc::new(AllowAll))
    }

    pub fn with_policy(root: Root, config: SubscriptionConfig, policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            registry: RwLock::new(Registry {
                subscriptions: HashMap::new(),
                by_client: HashMap::new(),
                path_store: SubscriptionPathStore::new(),
                publishers: PublisherRegistry::default(),
                last_served: root,
            }),
            next_id: AtomicU64::new(1),
            regex_cache: RegexCache::new(config.regex_cache_size),
            policy,
            config,
        }
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    pub(crate) fn regex_cache(&self) -> &RegexCache {
        &self.regex_cache
    }

    /// Canonicalize the literal prefix of an extended path.
    fn canonical_extended(&self, ty: &TypeDesc, path: &ExtendedPath) -> Result<ExtendedPath> {
        let prefix_len = path.literal_prefix_len();
        let (prefix, rest) = path.elems().split_at(prefix_len);
        let raw: Vec<&str> = prefix
            .iter()
            .filter_map(|e| match e {
                PathElem::Raw(raw) => Some(raw.as_str()),
                _ => None,
            })
            .collect();
        let mut elems: Vec<PathElem> = canonicalize_path(ty, raw.as_slice(), self.config.use_id_paths)?
            .into_iter()
            .map(PathElem::Raw)
            .collect();
        elems.extend(rest.iter().cloned());
        Ok(ExtendedPath(elems))
    }

    /// Register a subscription and send its initial sync.
    ///
    /// Fails if a path is invalid for the schema, if the subscriber may
    /// not use extended paths, or if the same subscriber already follows
    /// the same paths in the same mode (unless force registration is
    /// configured, in which case the live subscription is terminated).
    pub fn subscribe(&self, request: SubscriptionRequest) -> Result<SubscriptionHandle> {
        if request.paths.is_empty() {
            return Err(StoreError::InvalidOperation(
                "subscription request has no paths".to_string(),
            ));
        }
        if request.has_extended_paths()
            && !self
                .policy
                .is_extended_subscription_allowed(&request.subscriber_id)
        {
            return Err(StoreError::SubscriptionNotPermitted(request.subscriber_id));
        }

        let mut reg = self.registry.write();
        let ty = reg.last_served.type_desc();
        let use_id = self.config.use_id_paths;
        let mut paths = BTreeMap::new();
        let mut canonical = BTreeMap::new();
        for (key, path) in &request.paths {
            let (compiled, claimed) = match path {
                SubscriptionPath::Concrete(p) => {
                    let p = canonicalize_path(&ty, p.as_slice(), use_id)?;
                    let claimed = ExtendedPath(p.iter().cloned().map(PathElem::Raw).collect());
                    (KeyPath::Concrete(p), claimed)
                }
                SubscriptionPath::Extended(p) => {
                    let p = self.canonical_extended(&ty, p)?;
                    let compiled = CompiledPath::compile(&p, Some(&self.regex_cache))?;
                    (KeyPath::Extended(Arc::new(compiled)), p)
                }
            };
            paths.insert(key.clone(), compiled);
            canonical.insert(key.clone(), claimed);
        }
        let client = ClientKey {
            subscriber_id: request.subscriber_id.clone(),
            paths: canonical,
            mode: request.mode,
        };

        if let Some(&existing) = reg.by_client.get(&client) {
            if !self.config.force_register {
                return Err(StoreError::DuplicateRegistration(client.describe()));
            }
            reg.remove(existing, Some(TerminationCode::DuplicateRegistration));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.config.buffer_size);

        let tree = reg.last_served.node().clone();
        for (key, path) in &paths {
            match path {
                KeyPath::Concrete(p) => {
                    reg.path_store.add(
                        p,
                        SubscriptionRef {
                            id,
                            key: key.clone(),
                            resolved: false,
                        },
                    );
                }
                KeyPath::Extended(pattern) => {
                    reg.path_store.incrementally_resolve(id, key, pattern.clone());
                    reg.path_store.resolve_existing(&tree, id, key, pattern, use_id);
                }
            }
        }

        let gr_hold_time = request
            .gr_hold_time
            .unwrap_or(self.config.default_gr_hold_time);
        let subscription = Subscription {
            id,
            client: client.clone(),
            paths,
            namespaces: request.paths.values().map(|p| p.namespace()).collect(),
            protocol: request.protocol,
            mode: request.mode,
            sender,
            state: SubscriptionState::Resolving,
            heartbeat_interval: request
                .heartbeat_interval
                .or(self.config.default_heartbeat_interval),
            gr_hold_time,
            deadline: None,
            last_sent: Instant::now(),
        };
        let waiting = self.config.track_publishers && !subscription.is_covered(&reg.publishers);
        reg.subscriptions.insert(id, subscription);
        reg.by_client.insert(client, id);

        info!(
            subscription = %id,
            subscriber = %request.subscriber_id,
            paths = request.paths.len(),
            mode = ?request.mode,
            waiting,
            "subscription registered"
        );

        if waiting {
            if !gr_hold_time.is_zero() {
                if let Some(sub) = reg.subscriptions.get_mut(&id) {
                    sub.deadline = Some(Instant::now() + gr_hold_time);
                }
            }
            reg.set_state(id, SubscriptionState::Resolving);
        } else {
            reg.activate(id, use_id);
        }

        Ok(SubscriptionHandle { id, receiver })
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut reg = self.registry.write();
        if !reg.subscriptions.contains_key(&id) {
            return Err(StoreError::UnknownSubscription(id.0));
        }
        reg.remove(id, Some(TerminationCode::Unsubscribed));
        Ok(())
    }

    /// Push the changes between `old` and `new` to every affected
    /// subscription, then resolve extended subscriptions against paths
    /// that appeared.
    pub fn serve(&self, old: &Root, new: &Root) {
        let started = Instant::now();
        let mut guard = self.registry.write();
        let reg = &mut *guard;

        let options = DeltaOptions {
            mode: DeltaMode::Full,
            use_id_paths: self.config.use_id_paths,
        };
        let mut collector = ServeCollector {
            store: &reg.path_store,
            hits: Vec::new(),
            added: Vec::new(),
            deleted: Vec::new(),
        };
        visit_delta(old.node(), new.node(), options, &mut collector);
        let ServeCollector {
            hits, added, deleted, ..
        } = collector;

        let mut out = Outbox::default();
        for hit in &hits {
            let Some(sub) = reg.subscriptions.get(&hit.sub.id) else {
                continue;
            };
            if let Err(e) = change_item(&mut out, sub, hit) {
                warn!(subscription = %sub.id, path = %join_path(&hit.path), error = %e, "failed to encode change");
            }
        }

        for path in &deleted {
            reg.path_store.prune_deleted_path(path);
        }
        for path in &added {
            for promotion in reg.path_store.process_added_path(path) {
                let Some(sub) = reg.subscriptions.get(&promotion.id) else {
                    continue;
                };
                let node = new.get_node(promotion.path.as_slice());
                if let Err(e) = sync_item(&mut out, sub, &promotion.key, &promotion.path, node) {
                    warn!(subscription = %sub.id, error = %e, "failed to sync resolved path");
                }
            }
        }

        reg.last_served = new.clone();
        let served = reg.deliver(out);
        debug!(
            hits = hits.len(),
            added = added.len(),
            deleted = deleted.len(),
            served,
            elapsed_us = started.elapsed().as_micros() as u64,
            "served root"
        );
    }

    /// Register a publisher for the subtree at `path`.
    ///
    /// Subscriptions waiting for this namespace become active; ones held
    /// through a graceful restart resume without a new initial sync.
    pub fn register_publisher<S: AsRef<str>>(&self, publisher_id: &str, path: &[S]) -> Result<()> {
        let path = to_path(path);
        if !self.policy.is_publisher_allowed(publisher_id, &path) {
            return Err(StoreError::PublisherNotPermitted {
                publisher: publisher_id.to_string(),
                path: join_path(&path),
            });
        }

        let mut reg = self.registry.write();
        let registration = reg.publishers.register(publisher_id, &path)?;
        info!(publisher = publisher_id, path = %join_path(&path), ?registration, "publisher registered");

        let ready: Vec<(SubscriptionId, SubscriptionState)> = reg
            .subscriptions
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    SubscriptionState::Resolving | SubscriptionState::DisconnectedGrHold
                ) && s.is_covered(&reg.publishers)
            })
            .map(|s| (s.id, s.state))
            .collect();
        for (id, state) in ready {
            if state == SubscriptionState::Resolving {
                reg.activate(id, self.config.use_id_paths);
            } else {
                if let Some(sub) = reg.subscriptions.get_mut(&id) {
                    sub.deadline = None;
                }
                info!(subscription = %id, "publisher back within GR hold");
                reg.set_state(id, SubscriptionState::Active);
            }
        }
        Ok(())
    }

    /// Disconnect the publisher registered for `path`.
    ///
    /// Without a graceful restart, subscriptions left with no publisher are
    /// terminated with `AllPublishersGone`. With one, they are held for
    /// their GR hold time, or terminated with `PublisherGone` right away if
    /// it is zero.
    pub fn unregister_publisher<S: AsRef<str>>(
        &self,
        publisher_id: &str,
        path: &[S],
        graceful_restart: bool,
    ) -> Result<()> {
        let path = to_path(path);
        let mut reg = self.registry.write();
        let info = reg.publishers.unregister(publisher_id, &path, graceful_restart)?;
        info!(publisher = publisher_id, path = %join_path(&path), graceful_restart, "publisher disconnected");

        let affected: Vec<(SubscriptionId, Duration)> = reg
            .subscriptions
            .values()
            .filter(|s| {
                s.state == SubscriptionState::Active
                    && s.depends_on(&info)
                    && !s.is_covered(&reg.publishers)
            })
            .map(|s| (s.id, s.gr_hold_time))
            .collect();

        let now = Instant::now();
        for (id, hold) in affected {
            if !graceful_restart {
                reg.set_state(id, SubscriptionState::Disconnected);
                reg.remove(id, Some(TerminationCode::AllPublishersGone));
            } else if hold.is_zero() {
                reg.set_state(id, SubscriptionState::Disconnected);
                reg.remove(id, Some(TerminationCode::PublisherGone));
            } else {
                if let Some(sub) = reg.subscriptions.get_mut(&id) {
                    sub.deadline = Some(now + hold);
                }
                info!(subscription = %id, hold_ms = hold.as_millis() as u64, "holding for GR");
                reg.set_state(id, SubscriptionState::DisconnectedGrHold);
            }
        }
        if graceful_restart {
            reg.release_publishers();
        }
        Ok(())
    }

    /// Expire GR holds and send heartbeats that are due.
    pub fn tick(&self, now: Instant) {
        let mut reg = self.registry.write();
        let mut expired = Vec::new();
        let mut dropped = Vec::new();
        for (id, sub) in reg.subscriptions.iter_mut() {
            if sub.deadline.is_some_and(|d| d <= now) {
                expired.push(*id);
                continue;
            }
            if sub.state != SubscriptionState::Active {
                continue;
            }
            let Some(interval) = sub.heartbeat_interval else {
                continue;
            };
            if now.saturating_duration_since(sub.last_sent) >= interval {
                match sub.send(SubscriptionEvent::Heartbeat) {
                    SendOutcome::Sent => {}
                    SendOutcome::Full => dropped.push((*id, Some(TerminationCode::BufferOverflow))),
                    SendOutcome::Gone => dropped.push((*id, None)),
                }
            }
        }
        let any_expired = !expired.is_empty();
        for id in expired {
            reg.expire(id);
        }
        if any_expired {
            reg.release_publishers();
        }
        for (id, code) in dropped {
            reg.remove(id, code);
        }
    }

    /// Terminate every open stream.
    pub fn stop(&self) {
        let mut reg = self.registry.write();
        let ids: Vec<SubscriptionId> = reg.subscriptions.keys().copied().collect();
        for id in ids {
            reg.remove(id, Some(TerminationCode::Stopped));
        }
    }

    /// Number of registered subscriptions.
    pub fn num_subscriptions(&self) -> usize {
        self.registry.read().subscriptions.len()
    }

    /// Number of anchored paths in the path store, resolved ones included.
    pub fn num_resolved_paths(&self) -> usize {
        self.registry.read().path_store.num_subscriptions()
    }

    /// Number of live path store trie nodes.
    pub fn num_path_stores(&self) -> usize {
        self.registry.read().path_store.num_path_stores()
    }

    pub fn num_publishers(&self) -> usize {
        self.registry.read().publishers.num_connected()
    }

    /// Registered publishers, including ones away on a graceful restart.
    pub fn num_known_publishers(&self) -> usize {
        self.registry.read().publishers.len()
    }

    pub fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.registry.read().subscriptions.get(&id).map(|s| s.state)
    }
}
