//! Subscription requests, events and handles.

use crate::types::{ConcretePath, Delta, ExtendedPath, Patch, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Configuration shared by every subscription of one manager.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before the subscriber is disconnected.
    /// Default: 1000
    pub buffer_size: usize,

    /// Heartbeat interval for requests that do not set one.
    pub default_heartbeat_interval: Option<Duration>,

    /// GR hold time for requests that do not set one.
    pub default_gr_hold_time: Duration,

    /// Hold subscriptions in `Resolving` until a publisher owns their
    /// namespace.
    pub track_publishers: bool,

    /// A duplicate subscriber id replaces the live subscription instead of
    /// being rejected.
    pub force_register: bool,

    /// Report struct members by numeric id.
    pub use_id_paths: bool,

    /// Capacity of the compiled regex cache.
    pub regex_cache_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            default_heartbeat_interval: None,
            default_gr_hold_time: Duration::ZERO,
            track_publishers: false,
            force_register: false,
            use_id_paths: false,
            regex_cache_size: 256,
        }
    }
}

/// What a subscriber receives on change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// The full encoded value at the subscribed path.
    #[default]
    Path,
    /// `(path, old, new)` units for every changed leaf at or below the path.
    Delta,
    /// A structural patch rooted at the subscribed path.
    Patch,
}

/// One path of a subscription request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPath {
    Concrete(ConcretePath),
    Extended(ExtendedPath),
}

impl SubscriptionPath {
    pub fn concrete<S: AsRef<str>>(path: &[S]) -> Self {
        SubscriptionPath::Concrete(crate::types::to_path(path))
    }

    /// First token, which names the publisher namespace.
    pub(crate) fn namespace(&self) -> Option<String> {
        match self {
            SubscriptionPath::Concrete(path) => path.first().cloned(),
            SubscriptionPath::Extended(path) => match path.elems().first() {
                Some(crate::types::PathElem::Raw(raw)) => Some(raw.clone()),
                _ => None,
            },
        }
    }
}

impl From<ExtendedPath> for SubscriptionPath {
    fn from(path: ExtendedPath) -> Self {
        SubscriptionPath::Extended(path)
    }
}

/// A client's request to follow one or more paths.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub subscriber_id: String,
    pub paths: BTreeMap<String, SubscriptionPath>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub heartbeat_interval: Option<Duration>,
    #[serde(default)]
    pub gr_hold_time: Option<Duration>,
}

impl SubscriptionRequest {
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            paths: BTreeMap::new(),
            protocol: Protocol::default(),
            mode: SubscriptionMode::default(),
            heartbeat_interval: None,
            gr_hold_time: None,
        }
    }

    pub fn path<S: AsRef<str>>(mut self, key: impl Into<String>, path: &[S]) -> Self {
        self.paths.insert(key.into(), SubscriptionPath::concrete(path));
        self
    }

    pub fn extended(mut self, key: impl Into<String>, path: ExtendedPath) -> Self {
        self.paths.insert(key.into(), SubscriptionPath::Extended(path));
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn mode(mut self, mode: SubscriptionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn gr_hold_time(mut self, hold: Duration) -> Self {
        self.gr_hold_time = Some(hold);
        self
    }

    pub fn has_extended_paths(&self) -> bool {
        self.paths
            .values()
            .any(|p| matches!(p, SubscriptionPath::Extended(_)))
    }
}

/// Connectivity of a subscription to its publishers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Waiting for a publisher before the initial sync.
    Resolving,
    Active,
    Disconnected,
    /// Publisher went away gracefully; held open until the GR hold expires.
    DisconnectedGrHold,
    DisconnectedGrHoldExpired,
}

/// Why a subscription stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCode {
    /// Another registration took over this subscriber id.
    DuplicateRegistration,
    /// The publisher did not come back within the GR hold time.
    PublisherGone,
    /// Every publisher of the namespace disconnected.
    AllPublishersGone,
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The store was stopped.
    Stopped,
}

/// Events delivered on a subscription stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    /// Full value at a path. `value` is absent if the path does not exist.
    State {
        key: String,
        path: ConcretePath,
        value: Option<Vec<u8>>,
        protocol: Protocol,
    },

    /// Leaf-level changes for one subscribed path.
    Delta { key: String, delta: Delta },

    /// Structural patch for one subscribed path.
    Patch { key: String, patch: Patch },

    /// No change within the heartbeat interval.
    Heartbeat,

    StateChanged { state: SubscriptionState },

    /// Last event of a stream.
    Terminated { code: TerminationCode },
}

impl SubscriptionEvent {
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            SubscriptionEvent::State { .. }
                | SubscriptionEvent::Delta { .. }
                | SubscriptionEvent::Patch { .. }
        )
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<SubscriptionEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<SubscriptionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<SubscriptionEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Next data event, skipping heartbeats and state changes.
    pub fn recv_data(&self, timeout: Duration) -> Option<SubscriptionEvent> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            match self.receiver.recv_timeout(left) {
                Ok(event) if event.is_data() => return Some(event),
                Ok(SubscriptionEvent::Terminated { .. }) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = SubscriptionRequest::new("agent")
            .path("tx", &["ports", "1", "tx"])
            .extended("counters", ExtendedPath::new().raw("counters").regex("eth.*"))
            .mode(SubscriptionMode::Delta);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["subscriberId"], "agent");
        assert_eq!(json["mode"], "delta");
        assert_eq!(json["paths"]["tx"]["concrete"][2], "tx");
        assert_eq!(json["paths"]["counters"]["extended"][1]["regex"], "eth.*");

        let back: SubscriptionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
        assert!(back.has_extended_paths());
    }

    #[test]
    fn test_event_tagging() {
        let event = SubscriptionEvent::Terminated {
            code: TerminationCode::PublisherGone,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "terminated");
        assert_eq!(json["code"], "publisher_gone");
        assert!(!event.is_data());
    }

    #[test]
    fn test_namespace() {
        assert_eq!(SubscriptionPath::concrete(&["a", "b"]).namespace().as_deref(), Some("a"));
        assert_eq!(SubscriptionPath::Extended(ExtendedPath::new().any()).namespace(), None);
    }
}
