//! Routing registry mapping the token carried by kernel events to the sink of
//! the queue instance that owns it.
//!
//! Lookups happen once per packet from every receive thread, mutation only
//! when a queue starts or stops, so the table sits behind a reader/writer
//! lock.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use tracing::trace;

use crate::{error::RegistryError, packet::Packet};

/// Token the kernel echoes back with every event of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutingIndex(u32);

impl RoutingIndex {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Seed derived from the wall clock, truncated to the kernel's 32-bit token.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self(nanos as u32)
    }
}

impl fmt::Display for RoutingIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that accepts packets routed to a queue instance.
pub trait PacketSink: Send + Sync {
    /// Hand `packet` to the consumer, blocking until it is taken.
    ///
    /// Returns the packet when it can no longer be delivered, e.g. because the
    /// sink was closed while waiting.
    fn deliver(&self, packet: Packet) -> Result<(), Packet>;

    /// Stop accepting packets and end the consumer's sequence.
    fn close(&self);
}

#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<RoutingIndex, Arc<dyn PacketSink>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        index: RoutingIndex,
        sink: Arc<dyn PacketSink>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&index) {
            return Err(RegistryError::Occupied(index));
        }
        entries.insert(index, sink);
        trace!(
            event.name = "registry.registered",
            queue.index = %index,
            "registered routing index"
        );
        Ok(())
    }

    /// Register `sink` under the first free index at or after `seed`.
    ///
    /// With `n` entries registered, one of the `n + 1` indexes starting at
    /// `seed` is free, so probing stops there.
    pub fn register_unique(
        &self,
        seed: RoutingIndex,
        sink: Arc<dyn PacketSink>,
    ) -> Result<RoutingIndex, RegistryError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let max_probes = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        for probe in 0..=max_probes {
            let index = RoutingIndex(seed.raw().wrapping_add(probe));
            if !entries.contains_key(&index) {
                entries.insert(index, sink);
                trace!(
                    event.name = "registry.registered",
                    queue.index = %index,
                    probes = probe,
                    "registered routing index"
                );
                return Ok(index);
            }
        }
        Err(RegistryError::Exhausted)
    }

    pub fn lookup(&self, index: RoutingIndex) -> Option<Arc<dyn PacketSink>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }

    pub fn unregister(&self, index: RoutingIndex) -> Option<Arc<dyn PacketSink>> {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&index);
        trace!(
            event.name = "registry.unregistered",
            queue.index = %index,
            found = removed.is_some(),
            "unregistered routing index"
        );
        removed
    }

    pub fn contains(&self, index: RoutingIndex) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, thread};

    use super::*;

    #[derive(Default)]
    struct NullSink {
        closed: Mutex<bool>,
    }

    impl PacketSink for NullSink {
        fn deliver(&self, packet: Packet) -> Result<(), Packet> {
            Err(packet)
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn sink() -> Arc<dyn PacketSink> {
        Arc::new(NullSink::default())
    }

    #[test]
    fn test_register_then_lookup_returns_same_sink() {
        let registry = Registry::new();
        for raw in [0, 1, 7, u32::MAX] {
            let index = RoutingIndex::new(raw);
            let sink = sink();
            registry.register(index, sink.clone()).unwrap();
            let found = registry.lookup(index).expect("registered sink");
            assert!(Arc::ptr_eq(&found, &sink));
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_unregister_removes_entry() {
        let registry = Registry::new();
        let index = RoutingIndex::new(11);
        registry.register(index, sink()).unwrap();

        assert!(registry.unregister(index).is_some());
        assert!(registry.lookup(index).is_none());
        assert!(registry.unregister(index).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_occupied_index() {
        let registry = Registry::new();
        let index = RoutingIndex::new(3);
        let first = sink();
        registry.register(index, first.clone()).unwrap();

        let err = registry.register(index, sink()).unwrap_err();
        assert!(matches!(err, RegistryError::Occupied(i) if i == index));
        assert!(Arc::ptr_eq(&registry.lookup(index).unwrap(), &first));
    }

    #[test]
    fn test_register_unique_probes_past_taken_indexes() {
        let registry = Registry::new();
        registry.register(RoutingIndex::new(u32::MAX), sink()).unwrap();
        registry.register(RoutingIndex::new(0), sink()).unwrap();

        let index = registry
            .register_unique(RoutingIndex::new(u32::MAX), sink())
            .unwrap();
        assert_eq!(index, RoutingIndex::new(1));
    }

    #[test]
    fn test_register_unique_probes_at_most_entry_count() {
        let registry = Registry::new();
        for raw in 0..100 {
            registry.register(RoutingIndex::new(raw), sink()).unwrap();
        }

        let packed = registry
            .register_unique(RoutingIndex::new(0), sink())
            .unwrap();
        assert_eq!(packed, RoutingIndex::new(100));

        let sparse = registry
            .register_unique(RoutingIndex::new(5000), sink())
            .unwrap();
        assert_eq!(sparse, RoutingIndex::new(5000));
        assert_eq!(registry.len(), 102);
    }

    #[test]
    fn test_concurrent_lookups_see_complete_entries() {
        let registry = Arc::new(Registry::new());
        let index = RoutingIndex::new(99);
        registry.register(index, sink()).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(registry.lookup(index).is_some());
                        let _ = registry.lookup(RoutingIndex::new(1000));
                    }
                })
            })
            .collect();

        for raw in 1000..1100 {
            registry.register(RoutingIndex::new(raw), sink()).unwrap();
            registry.unregister(RoutingIndex::new(raw));
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
