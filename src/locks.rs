//! # Identity Locks
//!
//! Serializes consolidation for requests that could observe each other.
//!
//! A request first takes the identity keys of its observation (`email:<e>`,
//! `phone:<p>`), then the cluster keys of every primary its candidates point
//! at. Each set is taken all-or-nothing, and a request holding cluster keys
//! never waits for anything else, so the two phases cannot deadlock.

use crate::model::{ContactId, Observation};
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Email(String),
    Phone(String),
    Cluster(ContactId),
}

impl LockKey {
    /// Keys shared by any two observations that could match each other.
    pub fn identity(observation: &Observation) -> Vec<LockKey> {
        let mut keys = Vec::with_capacity(2);
        if let Some(email) = observation.email() {
            keys.push(LockKey::Email(email.to_string()));
        }
        if let Some(phone_number) = observation.phone_number() {
            keys.push(LockKey::Phone(phone_number.to_string()));
        }
        keys
    }

    pub fn clusters(roots: &BTreeSet<ContactId>) -> Vec<LockKey> {
        roots.iter().copied().map(LockKey::Cluster).collect()
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Email(email) => write!(f, "email:{email}"),
            LockKey::Phone(phone_number) => write!(f, "phone:{phone_number}"),
            LockKey::Cluster(id) => write!(f, "cluster:{}", id.0),
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every key in `keys` at once, waiting until `deadline` at most.
    pub fn acquire(&self, keys: Vec<LockKey>, deadline: Instant) -> Option<KeyLockGuard<'_>> {
        let mut held = self.held.lock();
        loop {
            if keys.iter().all(|key| !held.contains(key)) {
                held.extend(keys.iter().cloned());
                return Some(KeyLockGuard { locks: self, keys });
            }
            if Instant::now() >= deadline {
                return None;
            }
            self.released.wait_until(&mut held, deadline);
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release(&self, keys: &[LockKey]) {
        let mut held = self.held.lock();
        for key in keys {
            held.remove(key);
        }
        drop(held);
        self.released.notify_all();
    }
}

#[must_use]
pub struct KeyLockGuard<'a> {
    locks: &'a KeyLocks,
    keys: Vec<LockKey>,
}

impl KeyLockGuard<'_> {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn email(value: &str) -> LockKey {
        LockKey::Email(value.to_string())
    }

    #[test]
    fn test_identity_keys() {
        let observation =
            Observation::new(Some("a@x.com".to_string()), Some("123".to_string())).unwrap();
        let keys = LockKey::identity(&observation);
        assert_eq!(
            keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["email:a@x.com", "phone:123"]
        );
    }

    #[test]
    fn test_overlapping_sets_exclude_each_other() {
        let locks = KeyLocks::new();
        let soon = Instant::now() + Duration::from_millis(20);
        let guard = locks
            .acquire(vec![email("a"), email("b")], soon)
            .expect("first acquire");
        assert!(locks.acquire(vec![email("b"), email("c")], soon).is_none());
        assert!(locks.acquire(vec![email("c")], soon).is_some());
        drop(guard);
        assert_eq!(locks.held_count(), 0);
        assert!(locks.acquire(vec![email("b"), email("c")], soon).is_some());
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks
            .acquire(vec![email("a")], Instant::now() + Duration::from_secs(1))
            .expect("first acquire");

        let waiter = {
            let locks = Arc::clone(&locks);
            std::thread::spawn(move || {
                locks
                    .acquire(vec![email("a")], Instant::now() + Duration::from_secs(5))
                    .is_some()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().unwrap());
    }
}
