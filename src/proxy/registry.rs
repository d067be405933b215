//! Lock-guarded set of live entries with a drain barrier
//!
//! Used for the tunneling service's relay table and for each proxy's list of
//! sessions: entries are added while the owner runs, `begin_drain` refuses
//! further additions and `drained` resolves once the last entry is gone.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::{Error, Result};

pub type EntryId = u64;

#[derive(Debug)]
struct RegistryState<T> {
    entries: HashMap<EntryId, T>,
    next_id: EntryId,
    stopping: bool,
}

#[derive(Debug)]
pub struct Registry<T> {
    state: Mutex<RegistryState<T>>,
    drained: Notify,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                entries: HashMap::new(),
                next_id: 1,
                stopping: false,
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState<T>> {
        // Entries stay consistent even if a holder panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an entry, failing with `ShuttingDown` once draining began
    pub fn insert(&self, entry: T) -> Result<EntryId> {
        let mut state = self.lock();
        if state.stopping {
            return Err(Error::ShuttingDown);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(id, entry);
        Ok(id)
    }

    /// Deregister an entry; a second removal of the same id returns `None`
    pub fn remove(&self, id: EntryId) -> Option<T> {
        let (removed, empty) = {
            let mut state = self.lock();
            let removed = state.entries.remove(&id);
            (removed, state.entries.is_empty())
        };
        if removed.is_some() && empty {
            self.drained.notify_waiters();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    /// Refuse new entries from now on
    pub fn begin_drain(&self) {
        self.lock().stopping = true;
    }

    /// Resolve once no entries remain
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Registry<T> {
    /// Copy of the live entries, for work that must happen outside the lock
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().entries.values().cloned().collect()
    }
}
