use crate::error::AspectDbError;
use crate::store::state::PairKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Write locks at pair granularity. A transaction scope locks every pair it
/// mutates at first touch and holds the lock until commit or rollback, which
/// serializes writers per pair without serializing unrelated pairs.
#[derive(Debug, Default)]
pub struct PairLockTable {
    held: Mutex<HashMap<PairKey, u64>>,
    released: Condvar,
}

impl PairLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the pair lock for `owner`, waiting up to `timeout`.
    ///
    /// Returns `Ok(true)` when the lock was newly taken and `Ok(false)` when
    /// `owner` already holds it (reentrant within one transaction scope).
    pub fn acquire(
        &self,
        owner: u64,
        pair: &PairKey,
        timeout: Duration,
    ) -> Result<bool, AspectDbError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        loop {
            match held.get(pair) {
                None => {
                    held.insert(pair.clone(), owner);
                    return Ok(true);
                }
                Some(&holder) if holder == owner => return Ok(false),
                Some(_) => {
                    if self.released.wait_until(&mut held, deadline).timed_out() {
                        return Err(AspectDbError::LockTimeout {
                            entity_id: pair.urn.to_string(),
                            aspect_name: pair.aspect_name.clone(),
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                }
            }
        }
    }

    /// Releases every lock `owner` holds over `pairs` and wakes waiters.
    pub fn release_all(&self, owner: u64, pairs: &[PairKey]) {
        if pairs.is_empty() {
            return;
        }
        let mut held = self.held.lock();
        for pair in pairs {
            if held.get(pair) == Some(&owner) {
                held.remove(pair);
            }
        }
        drop(held);
        self.released.notify_all();
    }

    #[cfg(test)]
    fn holder_of(&self, pair: &PairKey) -> Option<u64> {
        self.held.lock().get(pair).copied()
    }
}
