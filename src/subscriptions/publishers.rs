//! Publisher registration and access control.

use crate::error::{join_path, Result, StoreError};
use crate::types::ConcretePath;
use std::collections::HashMap;
use std::time::Instant;

/// Decides who may publish and who may use extended paths.
pub trait AccessPolicy: Send + Sync {
    fn is_publisher_allowed(&self, publisher_id: &str, path: &[String]) -> bool;

    fn is_extended_subscription_allowed(&self, subscriber_id: &str) -> bool;
}

/// Permits everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_publisher_allowed(&self, _publisher_id: &str, _path: &[String]) -> bool {
        true
    }

    fn is_extended_subscription_allowed(&self, _subscriber_id: &str) -> bool {
        true
    }
}

#[derive(Clone, Debug)]
pub struct PublisherInfo {
    pub id: String,
    /// Subtree this publisher owns. Empty means the whole tree.
    pub path: ConcretePath,
    /// Set while the publisher is away on a graceful restart.
    pub disconnected_at: Option<Instant>,
}

impl PublisherInfo {
    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Top-level namespace owned, `None` for the whole tree.
    pub fn namespace(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    /// True if this publisher serves paths under `namespace`. A `None`
    /// namespace stands for a wildcard, which every publisher may serve.
    pub fn owns(&self, namespace: Option<&str>) -> bool {
        match (self.namespace(), namespace) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }
}

/// How a registration was accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    New,
    /// Came back from a graceful restart.
    Reconnected,
}

/// Known publishers, keyed by id and owned path. One publisher id may
/// serve several paths, each registered on its own.
#[derive(Default)]
pub struct PublisherRegistry {
    publishers: HashMap<(String, ConcretePath), PublisherInfo>,
}

impl PublisherRegistry {
    pub fn register(&mut self, id: &str, path: &[String]) -> Result<Registration> {
        match self.publishers.get_mut(&(id.to_string(), path.to_vec())) {
            Some(info) if info.is_connected() => Err(StoreError::DuplicateRegistration(format!(
                "publisher {} on /{}",
                id,
                join_path(path)
            ))),
            Some(info) => {
                info.disconnected_at = None;
                Ok(Registration::Reconnected)
            }
            None => {
                self.publishers.insert(
                    (id.to_string(), path.to_vec()),
                    PublisherInfo {
                        id: id.to_string(),
                        path: path.to_vec(),
                        disconnected_at: None,
                    },
                );
                Ok(Registration::New)
            }
        }
    }

    /// Disconnect a publisher. A graceful restart keeps its entry so it can
    /// reconnect; otherwise it is forgotten.
    pub fn unregister(
        &mut self,
        id: &str,
        path: &[String],
        graceful_restart: bool,
    ) -> Result<PublisherInfo> {
        let key = (id.to_string(), path.to_vec());
        let unknown = || StoreError::UnknownPublisher(format!("{} on /{}", id, join_path(path)));
        if graceful_restart {
            let info = self.publishers.get_mut(&key).ok_or_else(unknown)?;
            if !info.is_connected() {
                return Err(unknown());
            }
            info.disconnected_at = Some(Instant::now());
            Ok(info.clone())
        } else {
            self.publishers.remove(&key).ok_or_else(unknown)
        }
    }

    /// Forget publishers away on a graceful restart that nothing is held
    /// for anymore. Returns the forgotten entries.
    pub fn release<F>(&mut self, mut held: F) -> Vec<PublisherInfo>
    where
        F: FnMut(&PublisherInfo) -> bool,
    {
        let released: Vec<(String, ConcretePath)> = self
            .publishers
            .iter()
            .filter(|(_, info)| !info.is_connected() && !held(info))
            .map(|(key, _)| key.clone())
            .collect();
        released
            .iter()
            .filter_map(|key| self.publishers.remove(key))
            .collect()
    }

    /// Is some connected publisher serving `namespace`?
    pub fn covers(&self, namespace: Option<&str>) -> bool {
        self.publishers
            .values()
            .any(|p| p.is_connected() && p.owns(namespace))
    }

    pub fn get(&self, id: &str, path: &[String]) -> Option<&PublisherInfo> {
        self.publishers.get(&(id.to_string(), path.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }

    pub fn num_connected(&self) -> usize {
        self.publishers.values().filter(|p| p.is_connected()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(tokens: &[&str]) -> Vec<String> {
        crate::types::to_path(tokens)
    }

    #[test]
    fn test_duplicate_and_reconnect() {
        let mut registry = PublisherRegistry::default();
        let bgp = path(&["bgp"]);
        assert_eq!(registry.register("bgp", &bgp).unwrap(), Registration::New);
        assert!(matches!(
            registry.register("bgp", &bgp),
            Err(StoreError::DuplicateRegistration(_))
        ));

        registry.unregister("bgp", &bgp, true).unwrap();
        assert!(!registry.covers(Some("bgp")));
        assert_eq!(registry.get("bgp", &bgp).map(|p| p.is_connected()), Some(false));
        assert_eq!(registry.register("bgp", &bgp).unwrap(), Registration::Reconnected);
        assert!(registry.covers(Some("bgp")));
    }

    #[test]
    fn test_one_id_several_paths() {
        let mut registry = PublisherRegistry::default();
        registry.register("agent", &path(&["tx"])).unwrap();
        assert_eq!(
            registry.register("agent", &path(&["count"])).unwrap(),
            Registration::New
        );
        assert_eq!(registry.num_connected(), 2);

        registry.unregister("agent", &path(&["tx"]), false).unwrap();
        assert!(!registry.covers(Some("tx")));
        assert!(registry.covers(Some("count")));
        assert!(matches!(
            registry.unregister("agent", &path(&["tx"]), false),
            Err(StoreError::UnknownPublisher(_))
        ));
    }

    #[test]
    fn test_plain_disconnect_forgets() {
        let mut registry = PublisherRegistry::default();
        registry.register("agent", &path(&[])).unwrap();
        assert!(registry.covers(Some("anything")));
        assert!(registry.covers(None));

        registry.unregister("agent", &path(&[]), false).unwrap();
        assert!(registry.get("agent", &path(&[])).is_none());
        assert!(matches!(
            registry.unregister("agent", &path(&[]), false),
            Err(StoreError::UnknownPublisher(_))
        ));
    }

    #[test]
    fn test_release_drops_unheld_restarts() {
        let mut registry = PublisherRegistry::default();
        registry.register("fib", &path(&["fib"])).unwrap();
        registry.register("rib", &path(&["rib"])).unwrap();
        registry.register("arp", &path(&["arp"])).unwrap();
        registry.unregister("fib", &path(&["fib"]), true).unwrap();
        registry.unregister("rib", &path(&["rib"]), true).unwrap();

        let released = registry.release(|p| p.id == "rib");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].id, "fib");
        assert!(registry.get("fib", &path(&["fib"])).is_none());
        assert!(registry.get("rib", &path(&["rib"])).is_some());
        // Connected publishers are never released.
        assert!(registry.get("arp", &path(&["arp"])).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_namespace_ownership() {
        let mut registry = PublisherRegistry::default();
        registry.register("fib", &path(&["fib", "v4"])).unwrap();
        assert!(registry.covers(Some("fib")));
        assert!(!registry.covers(Some("rib")));
        assert!(registry.covers(None));
        assert_eq!(registry.num_connected(), 1);
    }
}
