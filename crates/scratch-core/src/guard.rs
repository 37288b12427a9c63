use crate::error::{Result, ScratchError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-flight operation registry keyed by identity.
///
/// `acquire` checks and inserts under a single lock; a second operation on
/// the same identity gets `Busy` while the first ticket is alive. Dropping
/// the ticket releases the identity, including on early return or panic.
#[derive(Debug, Clone, Default)]
pub struct OpGuard {
    inflight: Arc<Mutex<BTreeMap<String, String>>>,
}

#[derive(Debug)]
pub struct OpTicket {
    inflight: Arc<Mutex<BTreeMap<String, String>>>,
    identity: String,
    operation: String,
}

fn lock(m: &Mutex<BTreeMap<String, String>>) -> MutexGuard<'_, BTreeMap<String, String>> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OpGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, identity: &str, operation: &str) -> Result<OpTicket> {
        let mut map = lock(&self.inflight);
        if let Some(current) = map.get(identity) {
            tracing::warn!(identity, operation, current = %current, "operation rejected: busy");
            return Err(ScratchError::Busy {
                identity: identity.to_string(),
                operation: current.clone(),
            });
        }
        map.insert(identity.to_string(), operation.to_string());
        Ok(OpTicket {
            inflight: Arc::clone(&self.inflight),
            identity: identity.to_string(),
            operation: operation.to_string(),
        })
    }

    /// Run `read` with the registry locked, passing the operation in flight
    /// for `identity`. No ticket is issued or released while `read` runs, so
    /// what it reads is consistent with the reported operation. `read` must
    /// not call back into the guard.
    pub fn observe<R>(&self, identity: &str, read: impl FnOnce(Option<&str>) -> R) -> R {
        let map = lock(&self.inflight);
        read(map.get(identity).map(String::as_str))
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        lock(&self.inflight).clone()
    }
}

impl OpTicket {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }
}

impl Drop for OpTicket {
    fn drop(&mut self) {
        lock(&self.inflight).remove(&self.identity);
    }
}
