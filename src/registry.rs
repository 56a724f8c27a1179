//! Fixed-capacity connection table keyed by descriptor.
//!
//! Descriptors are a small dense integer domain bounded by the open-file
//! limit, so slots are indexed directly instead of hashed. The table is
//! allocated once and never resized; removal only empties a slot.

use crate::conn::Conn;
use crate::error::RegistryError;
use std::os::unix::io::RawFd;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::trace;

/// Registry of live connections.
///
/// One reader/writer lock guards the whole table: `add`/`remove` take it
/// exclusively, queries share it. Every operation is a short in-memory
/// critical section.
pub struct ConnectionRegistry {
    slots: RwLock<Vec<Option<Arc<dyn Conn>>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: RwLock::new(slots),
            capacity,
        }
    }

    /// Register `conn` in the slot named by its descriptor.
    ///
    /// Re-adding the connection already in the slot is a no-op. A different
    /// occupant is never overwritten.
    pub fn add(&self, conn: Arc<dyn Conn>) -> Result<(), RegistryError> {
        let fd = conn.fd();
        let idx = self.index(fd)?;

        let mut slots = self.write();
        match &slots[idx] {
            Some(existing) if Arc::ptr_eq(existing, &conn) => return Ok(()),
            Some(_) => return Err(RegistryError::Occupied(fd)),
            None => {}
        }
        slots[idx] = Some(conn);
        trace!(fd, "Connection registered");
        Ok(())
    }

    /// Empty the slot named by `conn`'s descriptor.
    ///
    /// Removal is by descriptor, not identity: whatever occupies the slot is
    /// taken out and returned.
    pub fn remove(&self, conn: &dyn Conn) -> Result<Option<Arc<dyn Conn>>, RegistryError> {
        self.remove_fd(conn.fd())
    }

    /// Empty slot `fd`, returning its previous occupant.
    pub fn remove_fd(&self, fd: RawFd) -> Result<Option<Arc<dyn Conn>>, RegistryError> {
        let idx = self.index(fd)?;
        let prev = self.write()[idx].take();
        if prev.is_some() {
            trace!(fd, "Connection unregistered");
        }
        Ok(prev)
    }

    /// Look up the connection in slot `fd`. An empty slot is `Ok(None)`.
    pub fn get(&self, fd: RawFd) -> Result<Option<Arc<dyn Conn>>, RegistryError> {
        let idx = self.index(fd)?;
        Ok(self.read()[idx].clone())
    }

    /// Snapshot of all registered connections in ascending descriptor order.
    ///
    /// The snapshot is taken under a single read lock and is owned by the
    /// caller; later registry changes do not affect it.
    pub fn get_all(&self) -> Vec<Arc<dyn Conn>> {
        self.read().iter().flatten().cloned().collect()
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        self.read().iter().filter(|slot| slot.is_some()).count()
    }

    /// Check if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of slots, fixed at construction.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn index(&self, fd: RawFd) -> Result<usize, RegistryError> {
        match usize::try_from(fd) {
            Ok(idx) if idx < self.capacity => Ok(idx),
            _ => Err(RegistryError::OutOfBounds {
                fd,
                capacity: self.capacity,
            }),
        }
    }

    // A panic while holding the lock cannot leave a slot half-written, so
    // the poisoned guard is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<dyn Conn>>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Option<Arc<dyn Conn>>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubConn;
    use std::sync::mpsc;
    use std::thread;

    fn fds(conns: &[Arc<dyn Conn>]) -> Vec<RawFd> {
        conns.iter().map(|c| c.fd()).collect()
    }

    #[test]
    fn test_add_get_round_trip() {
        let registry = ConnectionRegistry::new(8);
        let conn: Arc<dyn Conn> = StubConn::new(5);

        registry.add(Arc::clone(&conn)).unwrap();

        let found = registry.get(5).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
        assert!(registry.get(4).unwrap().is_none());
    }

    #[test]
    fn test_remove_clears_slot() {
        let registry = ConnectionRegistry::new(4);
        let conn: Arc<dyn Conn> = StubConn::new(3);

        registry.add(Arc::clone(&conn)).unwrap();
        let removed = registry.remove(conn.as_ref()).unwrap();
        assert!(removed.is_some());
        assert!(registry.get(3).unwrap().is_none());

        // Second remove finds nothing
        assert!(registry.remove(conn.as_ref()).unwrap().is_none());
    }

    #[test]
    fn test_remove_is_by_descriptor() {
        let registry = ConnectionRegistry::new(4);
        let occupant: Arc<dyn Conn> = StubConn::new(2);
        let other: Arc<dyn Conn> = StubConn::new(2);

        registry.add(Arc::clone(&occupant)).unwrap();
        let removed = registry.remove(other.as_ref()).unwrap().unwrap();

        assert!(Arc::ptr_eq(&removed, &occupant));
        assert!(registry.get(2).unwrap().is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_capacity_bound() {
        let registry = ConnectionRegistry::new(3);

        assert_eq!(
            registry.add(StubConn::new(3)),
            Err(RegistryError::OutOfBounds { fd: 3, capacity: 3 })
        );
        assert_eq!(
            registry.add(StubConn::new(-1)),
            Err(RegistryError::OutOfBounds { fd: -1, capacity: 3 })
        );
        assert!(registry.get(100).is_err());
        assert!(registry.remove_fd(-7).is_err());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.capacity(), 3);
    }

    #[test]
    fn test_add_rejects_different_occupant() {
        let registry = ConnectionRegistry::new(4);
        let first: Arc<dyn Conn> = StubConn::new(1);
        let second: Arc<dyn Conn> = StubConn::new(1);

        registry.add(Arc::clone(&first)).unwrap();
        assert_eq!(
            registry.add(Arc::clone(&second)),
            Err(RegistryError::Occupied(1))
        );

        // Same connection again is fine
        registry.add(Arc::clone(&first)).unwrap();

        let found = registry.get(1).unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_count_matches_snapshot() {
        let registry = ConnectionRegistry::new(16);
        for fd in [9, 2, 14, 0, 7] {
            registry.add(StubConn::new(fd)).unwrap();
        }
        registry.remove_fd(14).unwrap();

        let all = registry.get_all();
        assert_eq!(registry.count(), 4);
        assert_eq!(all.len(), registry.count());
        assert_eq!(fds(&all), vec![0, 2, 7, 9]);
    }

    #[test]
    fn test_snapshot_independent_of_later_mutation() {
        let registry = ConnectionRegistry::new(4);
        registry.add(StubConn::new(0)).unwrap();
        registry.add(StubConn::new(1)).unwrap();

        let snapshot = registry.get_all();
        registry.remove_fd(0).unwrap();
        registry.add(StubConn::new(2)).unwrap();

        assert_eq!(fds(&snapshot), vec![0, 1]);
        assert_eq!(fds(&registry.get_all()), vec![1, 2]);
    }

    #[test]
    fn test_add_visible_to_causally_later_reader() {
        let registry = Arc::new(ConnectionRegistry::new(64));
        let (tx, rx) = mpsc::channel();

        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for fd in 0..64 {
                    let conn: Arc<dyn Conn> = StubConn::new(fd);
                    registry.add(Arc::clone(&conn)).unwrap();
                    tx.send(conn).unwrap();
                }
            })
        };

        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for conn in rx {
                    let found = registry.get(conn.fd()).unwrap().unwrap();
                    assert!(Arc::ptr_eq(&found, &conn));
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(registry.count(), 64);
    }

    #[test]
    fn test_concurrent_add_remove_distinct_slots() {
        let registry = Arc::new(ConnectionRegistry::new(256));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..64 {
                        let fd = worker * 64 + i;
                        let conn: Arc<dyn Conn> = StubConn::new(fd);
                        registry.add(Arc::clone(&conn)).unwrap();
                        if i % 2 == 0 {
                            registry.remove(conn.as_ref()).unwrap();
                        }
                        // Snapshot never exceeds the table
                        assert!(registry.get_all().len() <= 256);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.count(), 128);
        assert!(fds(&registry.get_all()).iter().all(|fd| fd % 2 == 1));
    }
}
