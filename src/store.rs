//! Shared proxy store.
//!
//! Every component reads and writes pool state only through [`ProxyStore`].
//! Each operation is atomic with respect to every other; no caller holds a
//! lock across operations.

use crate::error::StoreError;
use crate::proxy::{Protocol, ProxyRecord};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use std::collections::{HashMap, HashSet};

/// Role a set of proxies plays inside a protocol pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Proxies currently served to callers.
    Usable,
    /// Proxies that passed the current validation round, awaiting promotion.
    Validated,
}

/// Contract the pool requires from its backing store.
///
/// Roles are unordered sets keyed by `(address, protocol)`.
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// Number of members in `(protocol, role)`.
    async fn count(&self, protocol: Protocol, role: Role) -> Result<usize, StoreError>;

    /// Insert `record`. Returns `false` if it was already present.
    async fn add(&self, protocol: Protocol, role: Role, record: ProxyRecord)
        -> Result<bool, StoreError>;

    /// Every member of `(protocol, role)`, left in place.
    async fn members(&self, protocol: Protocol, role: Role)
        -> Result<HashSet<ProxyRecord>, StoreError>;

    /// Remove and return every member of `(protocol, role)`.
    async fn drain_all(&self, protocol: Protocol, role: Role)
        -> Result<HashSet<ProxyRecord>, StoreError>;

    /// Move every member of `from` into `to`, leaving `from` empty.
    async fn move_all(&self, protocol: Protocol, from: Role, to: Role) -> Result<(), StoreError>;

    /// A random member of `(protocol, role)`, left in place.
    async fn random_member(&self, protocol: Protocol, role: Role)
        -> Result<Option<ProxyRecord>, StoreError>;

    /// Replace the usable set with the validated set in one step.
    ///
    /// Readers see either the old usable set or the new one. Returns the new
    /// usable size.
    async fn promote(&self, protocol: Protocol) -> Result<usize, StoreError>;
}

/// In-process store. One mutex guards all roles so every operation,
/// including the multi-role ones, is a single atomic step.
#[derive(Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<(Protocol, Role), HashSet<ProxyRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a role's members.
    pub fn snapshot(&self, protocol: Protocol, role: Role) -> HashSet<ProxyRecord> {
        self.sets
            .lock()
            .get(&(protocol, role))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProxyStore for MemoryStore {
    async fn count(&self, protocol: Protocol, role: Role) -> Result<usize, StoreError> {
        Ok(self.sets.lock().get(&(protocol, role)).map_or(0, HashSet::len))
    }

    async fn add(
        &self,
        protocol: Protocol,
        role: Role,
        record: ProxyRecord,
    ) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .lock()
            .entry((protocol, role))
            .or_default()
            .insert(record))
    }

    async fn members(
        &self,
        protocol: Protocol,
        role: Role,
    ) -> Result<HashSet<ProxyRecord>, StoreError> {
        Ok(self.snapshot(protocol, role))
    }

    async fn drain_all(
        &self,
        protocol: Protocol,
        role: Role,
    ) -> Result<HashSet<ProxyRecord>, StoreError> {
        Ok(self
            .sets
            .lock()
            .remove(&(protocol, role))
            .unwrap_or_default())
    }

    async fn move_all(&self, protocol: Protocol, from: Role, to: Role) -> Result<(), StoreError> {
        if from == to {
            return Ok(());
        }
        let mut sets = self.sets.lock();
        if let Some(moved) = sets.remove(&(protocol, from)) {
            sets.entry((protocol, to)).or_default().extend(moved);
        }
        Ok(())
    }

    async fn random_member(
        &self,
        protocol: Protocol,
        role: Role,
    ) -> Result<Option<ProxyRecord>, StoreError> {
        let sets = self.sets.lock();
        let mut rng = rand::rng();
        Ok(sets
            .get(&(protocol, role))
            .and_then(|set| set.iter().choose(&mut rng))
            .cloned())
    }

    async fn promote(&self, protocol: Protocol) -> Result<usize, StoreError> {
        let mut sets = self.sets.lock();
        let validated = sets.remove(&(protocol, Role::Validated)).unwrap_or_default();
        let size = validated.len();
        sets.insert((protocol, Role::Usable), validated);
        Ok(size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::proxy::ProxyAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    /// [`MemoryStore`] that can fail one read and counts random picks.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub inner: MemoryStore,
        /// The next `members` call for this protocol fails.
        pub fail_members: Mutex<Option<Protocol>>,
        /// The next `drain_all` call for this protocol fails.
        pub fail_drain: Mutex<Option<Protocol>>,
        pub random_member_calls: AtomicUsize,
    }

    /// Clear `slot` and report a failure if it names `protocol`.
    fn trip(slot: &Mutex<Option<Protocol>>, protocol: Protocol) -> Result<(), StoreError> {
        let mut slot = slot.lock();
        if *slot == Some(protocol) {
            *slot = None;
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        Ok(())
    }

    #[async_trait]
    impl ProxyStore for FlakyStore {
        async fn count(&self, protocol: Protocol, role: Role) -> Result<usize, StoreError> {
            self.inner.count(protocol, role).await
        }

        async fn add(
            &self,
            protocol: Protocol,
            role: Role,
            record: ProxyRecord,
        ) -> Result<bool, StoreError> {
            self.inner.add(protocol, role, record).await
        }

        async fn members(
            &self,
            protocol: Protocol,
            role: Role,
        ) -> Result<HashSet<ProxyRecord>, StoreError> {
            trip(&self.fail_members, protocol)?;
            self.inner.members(protocol, role).await
        }

        async fn drain_all(
            &self,
            protocol: Protocol,
            role: Role,
        ) -> Result<HashSet<ProxyRecord>, StoreError> {
            trip(&self.fail_drain, protocol)?;
            self.inner.drain_all(protocol, role).await
        }

        async fn move_all(&self, protocol: Protocol, from: Role, to: Role) -> Result<(), StoreError> {
            self.inner.move_all(protocol, from, to).await
        }

        async fn random_member(
            &self,
            protocol: Protocol,
            role: Role,
        ) -> Result<Option<ProxyRecord>, StoreError> {
            self.random_member_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.random_member(protocol, role).await
        }

        async fn promote(&self, protocol: Protocol) -> Result<usize, StoreError> {
            self.inner.promote(protocol).await
        }
    }

    fn record(host: &str, protocol: Protocol) -> ProxyRecord {
        ProxyRecord::new(ProxyAddr::new(host, 8080), protocol, "test", 10.0)
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let store = MemoryStore::new();
        assert!(assert_ok!(store.add(Protocol::Http, Role::Validated, record("a", Protocol::Http)).await));
        assert!(!assert_ok!(store.add(Protocol::Http, Role::Validated, record("a", Protocol::Http)).await));
        assert_eq!(assert_ok!(store.count(Protocol::Http, Role::Validated).await), 1);
        assert_eq!(assert_ok!(store.count(Protocol::Https, Role::Validated).await), 0);
    }

    #[tokio::test]
    async fn drain_all_empties_the_role() {
        let store = MemoryStore::new();
        for host in ["a", "b", "c"] {
            assert_ok!(store.add(Protocol::Https, Role::Usable, record(host, Protocol::Https)).await);
        }
        let drained = assert_ok!(store.drain_all(Protocol::Https, Role::Usable).await);
        assert_eq!(drained.len(), 3);
        assert_eq!(assert_ok!(store.count(Protocol::Https, Role::Usable).await), 0);
        assert!(assert_ok!(store.drain_all(Protocol::Https, Role::Usable).await).is_empty());
    }

    #[tokio::test]
    async fn move_all_merges_into_target() {
        let store = MemoryStore::new();
        assert_ok!(store.add(Protocol::Http, Role::Usable, record("a", Protocol::Http)).await);
        assert_ok!(store.add(Protocol::Http, Role::Validated, record("a", Protocol::Http)).await);
        assert_ok!(store.add(Protocol::Http, Role::Validated, record("b", Protocol::Http)).await);

        assert_ok!(store.move_all(Protocol::Http, Role::Validated, Role::Usable).await);
        assert_eq!(assert_ok!(store.count(Protocol::Http, Role::Usable).await), 2);
        assert_eq!(assert_ok!(store.count(Protocol::Http, Role::Validated).await), 0);
    }

    #[tokio::test]
    async fn promote_replaces_usable_with_validated() {
        let store = MemoryStore::new();
        assert_ok!(store.add(Protocol::Http, Role::Usable, record("stale", Protocol::Http)).await);
        assert_ok!(store.add(Protocol::Http, Role::Validated, record("a", Protocol::Http)).await);
        assert_ok!(store.add(Protocol::Http, Role::Validated, record("c", Protocol::Http)).await);
        let before = store.snapshot(Protocol::Http, Role::Validated);

        assert_eq!(assert_ok!(store.promote(Protocol::Http).await), 2);
        assert_eq!(store.snapshot(Protocol::Http, Role::Usable), before);
        assert!(store.snapshot(Protocol::Http, Role::Validated).is_empty());
    }

    #[tokio::test]
    async fn random_member_leaves_set_intact() {
        let store = MemoryStore::new();
        assert!(assert_ok!(store.random_member(Protocol::Http, Role::Usable).await).is_none());
        assert_ok!(store.add(Protocol::Http, Role::Usable, record("a", Protocol::Http)).await);
        let picked = assert_ok!(store.random_member(Protocol::Http, Role::Usable).await);
        assert_eq!(picked, Some(record("a", Protocol::Http)));
        assert_eq!(assert_ok!(store.count(Protocol::Http, Role::Usable).await), 1);
    }
}
