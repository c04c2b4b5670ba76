//! Duplicate suppression for blocking work.
//!
//! The first caller for a key becomes the leader and runs the work; callers
//! arriving while it runs wait and receive a clone of its result. A leader
//! that fails (or panics) hands the key over: one waiting caller is promoted and
//! runs its own work. Failures are never shared, so one caller's canceled
//! context cannot fail the others.

use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use ahash::AHashMap;

use crate::core::Result;

enum Slot<T> {
    Running,
    Done(T),
    Abandoned,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    settled: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Marks the slot abandoned unless the leader stored a result.
struct LeaderGuard<'a, T> {
    shared: &'a Shared<T>,
    armed: bool,
}

impl<T> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *self.shared.lock() = Slot::Abandoned;
            self.shared.settled.notify_all();
        }
    }
}

pub struct Flight<K, T> {
    // weak entries: the slot lives as long as someone is leading or waiting
    calls: Mutex<AHashMap<K, Weak<Shared<T>>>>,
}

impl<K, T> Default for Flight<K, T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(AHashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(Arc<Shared<T>>),
    Follower(Arc<Shared<T>>),
}

impl<K, T> Flight<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` for `key` unless an identical call is already in flight, in
    /// which case its successful result is returned instead.
    pub fn work<F>(&self, key: &K, mut work: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        loop {
            match self.join(key) {
                Role::Leader(shared) => return self.lead(key, &shared, &mut work),
                Role::Follower(shared) => {
                    let mut slot = shared.lock();
                    while matches!(*slot, Slot::Running) {
                        slot = shared
                            .settled
                            .wait(slot)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    if let Slot::Done(value) = &*slot {
                        return Ok(value.clone());
                    }
                    // abandoned: compete for leadership again
                }
            }
        }
    }

    fn lock_calls(&self) -> MutexGuard<'_, AHashMap<K, Weak<Shared<T>>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, key: &K) -> Role<T> {
        let mut calls = self.lock_calls();
        if let Some(shared) = calls.get(key).and_then(Weak::upgrade)
            && matches!(*shared.lock(), Slot::Running)
        {
            return Role::Follower(shared);
        }
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Running),
            settled: Condvar::new(),
        });
        calls.insert(key.clone(), Arc::downgrade(&shared));
        Role::Leader(shared)
    }

    fn lead<F>(&self, key: &K, shared: &Arc<Shared<T>>, work: &mut F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut guard = LeaderGuard {
            shared: shared.as_ref(),
            armed: true,
        };
        let result = work();
        {
            let mut calls = self.lock_calls();
            if calls
                .get(key)
                .is_some_and(|call| Weak::ptr_eq(call, &Arc::downgrade(shared)))
            {
                calls.remove(key);
            }
        }
        if let Ok(value) = &result {
            *shared.lock() = Slot::Done(value.clone());
            shared.settled.notify_all();
            guard.armed = false;
        }
        result
    }
}
