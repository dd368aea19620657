use crate::error::{Result, StoreError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Opaque handle identifying one append/lock context, issued at session
/// start. The engine keys its current-tail map and lock bookkeeping by this.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct OwnerId(pub(crate) u64);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LockMode {
    Shared,
    Exclusive,
}

struct Holder {
    mode: LockMode,
    count: u32,
    entered: bool,
}

/// Advisory reader/writer lock with owner tracking and a bounded wait.
///
/// Acquisitions by the same owner nest without deadlocking, including a
/// shared-to-exclusive upgrade while the owner is the sole holder. Waiters
/// park on a condvar and give up with `LockTimeout` once the configured
/// interval elapses.
pub struct TimeoutLock {
    timeout: Duration,
    state: Mutex<HashMap<OwnerId, Holder>>,
    cond: Condvar,
}

impl TimeoutLock {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Block until the lock is granted in `mode`, or fail with
    /// `LockTimeout` once the configured interval elapses.
    pub fn acquire(&self, owner: OwnerId, mode: LockMode) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            if Self::grantable(&state, owner, mode) {
                match state.entry(owner) {
                    std::collections::hash_map::Entry::Occupied(mut entry) => {
                        let holder = entry.get_mut();
                        holder.count += 1;
                        if mode == LockMode::Exclusive {
                            holder.mode = LockMode::Exclusive;
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        entry.insert(Holder {
                            mode,
                            count: 1,
                            entered: false,
                        });
                    }
                }
                return Ok(());
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return Err(StoreError::LockTimeout);
            }
        }
    }

    fn grantable(state: &HashMap<OwnerId, Holder>, owner: OwnerId, mode: LockMode) -> bool {
        let others = state.keys().any(|&held| held != owner);
        match (state.get(&owner), mode) {
            // re-entrance: a shared request always nests under our own hold,
            // an exclusive request nests only if we already hold exclusively
            // or can upgrade as the sole holder
            (Some(holder), LockMode::Shared) => {
                holder.mode == LockMode::Exclusive
                    || !state
                        .values()
                        .any(|other| other.mode == LockMode::Exclusive)
            }
            (Some(holder), LockMode::Exclusive) => {
                holder.mode == LockMode::Exclusive || !others
            }
            (None, LockMode::Shared) => !state
                .values()
                .any(|holder| holder.mode == LockMode::Exclusive),
            (None, LockMode::Exclusive) => state.is_empty(),
        }
    }

    /// Mark the owner as active inside the protected section.
    pub fn enter(&self, owner: OwnerId) {
        if let Some(holder) = self.state.lock().get_mut(&owner) {
            holder.entered = true;
        }
    }

    /// Drop a single acquisition by `owner`, waking waiters when the owner
    /// releases its last hold.
    pub fn release(&self, owner: OwnerId) {
        let mut state = self.state.lock();
        if let Some(holder) = state.get_mut(&owner) {
            holder.count -= 1;
            if holder.count == 0 {
                state.remove(&owner);
            }
        }
        drop(state);
        self.cond.notify_all();
    }

    pub fn has_lock(&self, owner: OwnerId) -> bool {
        self.state.lock().contains_key(&owner)
    }

    /// Whether the owner entered the protected section since acquiring.
    pub fn is_active(&self, owner: OwnerId) -> bool {
        self.state
            .lock()
            .get(&owner)
            .is_some_and(|holder| holder.entered)
    }

    pub fn is_locked(&self) -> bool {
        !self.state.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lock_with_timeout(millis: u64) -> TimeoutLock {
        TimeoutLock::new(Duration::from_millis(millis))
    }

    #[test]
    fn test_reentrant_same_owner() {
        let lock = lock_with_timeout(50);
        let owner = OwnerId(1);
        lock.acquire(owner, LockMode::Exclusive).unwrap();
        lock.acquire(owner, LockMode::Exclusive).unwrap();
        lock.acquire(owner, LockMode::Shared).unwrap();
        assert!(!lock.is_active(owner));
        lock.enter(owner);
        assert!(lock.is_active(owner));
        lock.release(owner);
        lock.release(owner);
        assert!(lock.has_lock(owner));
        lock.release(owner);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_readers_share() {
        let lock = lock_with_timeout(50);
        lock.acquire(OwnerId(1), LockMode::Shared).unwrap();
        lock.acquire(OwnerId(2), LockMode::Shared).unwrap();
        assert!(lock.has_lock(OwnerId(1)));
        assert!(lock.has_lock(OwnerId(2)));
    }

    #[test]
    fn test_writer_excludes_reader() {
        let lock = lock_with_timeout(20);
        lock.acquire(OwnerId(1), LockMode::Exclusive).unwrap();
        assert!(matches!(
            lock.acquire(OwnerId(2), LockMode::Shared),
            Err(StoreError::LockTimeout)
        ));
    }

    #[test]
    fn test_reader_excludes_writer() {
        let lock = lock_with_timeout(20);
        lock.acquire(OwnerId(1), LockMode::Shared).unwrap();
        assert!(matches!(
            lock.acquire(OwnerId(2), LockMode::Exclusive),
            Err(StoreError::LockTimeout)
        ));
    }

    #[test]
    fn test_upgrade_as_sole_holder() {
        let lock = lock_with_timeout(50);
        let owner = OwnerId(1);
        lock.acquire(owner, LockMode::Shared).unwrap();
        lock.acquire(owner, LockMode::Exclusive).unwrap();
        // another reader must now wait
        assert!(matches!(
            lock.acquire(OwnerId(2), LockMode::Shared),
            Err(StoreError::LockTimeout)
        ));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let lock = Arc::new(lock_with_timeout(5_000));
        lock.acquire(OwnerId(1), LockMode::Exclusive).unwrap();

        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.acquire(OwnerId(2), LockMode::Exclusive).unwrap();
                lock.release(OwnerId(2));
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        lock.release(OwnerId(1));
        waiter.join().unwrap();
        assert!(!lock.is_locked());
    }
}
