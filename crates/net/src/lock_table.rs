//! Per-address mutual exclusion for registry-mutating operations.
//!
//! Connect, disconnect, and shutdown against the *same* remote address must
//! serialize; operations against different addresses must not block each
//! other. The table hands out one `Arc<Mutex<()>>` per address, created on
//! first use. The only global critical section is the map shard taken while
//! creating or fetching the lock object itself, never held across I/O.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

/// Table of per-address locks, created on demand.
#[derive(Debug, Default)]
pub(crate) struct AddressLockTable {
    locks: DashMap<SocketAddr, Arc<Mutex<()>>>,
}

impl AddressLockTable {
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Returns the lock object for `addr`, creating it on first use.
    pub(crate) fn lock_for(&self, addr: SocketAddr) -> Arc<Mutex<()>> {
        self.locks
            .entry(addr)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry once the address has no registry entries left.
    ///
    /// The entry is removed only while the table holds the sole reference.
    /// An outstanding guard (or a `lock_for` that already cloned the `Arc`)
    /// keeps the entry in place, so every concurrent acquirer contends on
    /// the same mutex; removal only bounds the table's growth.
    pub(crate) fn release(&self, addr: SocketAddr) {
        self.locks
            .remove_if(&addr, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Holds a per-address lock for the duration of a registry mutation.
pub(crate) struct AddressGuard {
    lock: Arc<Mutex<()>>,
}

impl AddressGuard {
    pub(crate) fn acquire(table: &AddressLockTable, addr: SocketAddr) -> Self {
        Self {
            lock: table.lock_for(addr),
        }
    }

    pub(crate) fn enter(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().expect("address lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn same_address_returns_same_lock() {
        let table = AddressLockTable::new();

        let first = table.lock_for(addr(6666));
        let second = table.lock_for(addr(6666));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn different_addresses_do_not_share_locks() {
        let table = AddressLockTable::new();

        let first = table.lock_for(addr(6666));
        let second = table.lock_for(addr(6667));

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn release_bounds_the_table() {
        let table = AddressLockTable::new();
        table.lock_for(addr(6666));

        table.release(addr(6666));

        assert_eq!(table.len(), 0);
    }

    #[test]
    fn release_keeps_a_held_lock_in_place() {
        let table = AddressLockTable::new();
        let first = table.lock_for(addr(6666));
        let held = first.lock().expect("first acquirer holds the lock");

        table.release(addr(6666));

        // The holder pins the entry; a later acquirer must contend on the
        // same mutex instead of minting a fresh, immediately free one.
        assert_eq!(table.len(), 1);
        let second = table.lock_for(addr(6666));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.try_lock().is_err());

        drop(held);
        drop(first);
        drop(second);
        table.release(addr(6666));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn concurrent_first_use_creates_one_lock() {
        let table = Arc::new(AddressLockTable::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || table.lock_for(addr(6666))));
        }
        let locks: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread joins"))
            .collect();

        for lock in &locks[1..] {
            assert!(Arc::ptr_eq(&locks[0], lock));
        }
    }

    #[test]
    fn guard_serializes_same_address() {
        let table = Arc::new(AddressLockTable::new());
        let guard = AddressGuard::acquire(&table, addr(6666));
        let held = guard.enter();

        let table2 = Arc::clone(&table);
        let contender = thread::spawn(move || {
            let guard = AddressGuard::acquire(&table2, addr(6666));
            let _held = guard.enter();
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!contender.is_finished());
        drop(held);
        contender.join().expect("contender finishes after release");
    }
}
