use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::protocol::{CallId, Outcome};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The table maps call ids to one-shot senders and has no invariants spanning
/// several entries; the worst outcome of a poisoned lock is an unmatched
/// reply.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Table {
    // ---
    last_id: u64,
    calls: HashMap<CallId, oneshot::Sender<Outcome>>,
}

/// Tracks calls waiting for their replies.
///
/// Allocates call identifiers and maps each outstanding identifier to the
/// one-shot channel its caller is waiting on. Identifier allocation and
/// registration happen under the same lock, so an identifier is never
/// observable without its entry.
pub struct CorrelationRegistry {
    // ---
    table: Mutex<Table>,
}

/// One outstanding call, held by the caller while it waits.
pub struct PendingCall {
    // ---
    id: CallId,
    signal: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    // ---

    /// Identifier of this call.
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Wait for the call to be resolved.
    ///
    /// Returns `None` if the entry was dropped without an outcome (registry
    /// closed or entry evicted).
    pub async fn wait(self) -> Option<Outcome> {
        // ---
        self.signal.await.ok()
    }
}

impl CorrelationRegistry {
    // ---

    /// Create an empty registry whose first identifier is 1.
    pub fn new() -> Self {
        // ---
        Self {
            table: Mutex::new(Table {
                last_id: 0,
                calls: HashMap::new(),
            }),
        }
    }

    /// Allocate the next identifier and register a pending call under it.
    pub fn next(&self) -> PendingCall {
        // ---
        let (tx, rx) = oneshot::channel();

        let mut table = lock_ignore_poison(&self.table);
        table.last_id += 1;
        let id = CallId::new(table.last_id);
        table.calls.insert(id, tx);

        PendingCall { id, signal: rx }
    }

    /// Deliver `outcome` to the call registered under `id`.
    ///
    /// Returns true if the id was pending. Unknown, already resolved and
    /// evicted ids are ignored and return false.
    pub fn resolve(&self, id: CallId, outcome: Outcome) -> bool {
        // ---
        let tx = lock_ignore_poison(&self.table).calls.remove(&id);

        match tx {
            // A caller that stopped waiting has dropped its receiver; the
            // entry is still consumed.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a pending call without delivering an outcome.
    ///
    /// Used when the caller gives up. Returns true if the entry was present.
    pub fn evict(&self, id: CallId) -> bool {
        // ---
        lock_ignore_poison(&self.table).calls.remove(&id).is_some()
    }

    /// Drop every pending call; waiting callers observe `None`.
    ///
    /// Returns the number of calls abandoned. Identifiers keep increasing
    /// afterwards.
    pub fn clear(&self) -> usize {
        // ---
        let mut table = lock_ignore_poison(&self.table);
        let count = table.calls.len();
        table.calls.clear();
        count
    }

    /// Number of calls still waiting for a reply.
    pub fn len(&self) -> usize {
        // ---
        lock_ignore_poison(&self.table).calls.len()
    }

    /// True if no call is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_next_and_resolve() {
        // ---
        let registry = CorrelationRegistry::new();

        let call = registry.next();
        assert_eq!(call.id(), CallId::new(1));
        assert_eq!(registry.len(), 1);

        let payload = Bytes::from("test response");
        assert!(registry.resolve(call.id(), Outcome::Success(payload.clone())));

        // Should be removed after resolution
        assert!(registry.is_empty());

        assert_eq!(call.wait().await, Some(Outcome::Success(payload)));
    }

    #[test]
    fn test_resolve_unknown_id() {
        // ---
        let registry = CorrelationRegistry::new();
        assert!(!registry.resolve(CallId::new(99), Outcome::Failure("late".into())));
    }

    #[test]
    fn test_duplicate_resolve_is_ignored() {
        // ---
        let registry = CorrelationRegistry::new();
        let call = registry.next();

        assert!(registry.resolve(call.id(), Outcome::Success(Bytes::new())));
        assert!(!registry.resolve(call.id(), Outcome::Success(Bytes::new())));
    }

    #[test]
    fn test_resolve_after_caller_gave_up() {
        // ---
        let registry = CorrelationRegistry::new();
        let call = registry.next();
        let id = call.id();
        drop(call);

        // Entry is consumed even though nobody observes the outcome.
        assert!(registry.resolve(id, Outcome::Success(Bytes::new())));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_evict() {
        // ---
        let registry = CorrelationRegistry::new();
        let call = registry.next();
        let id = call.id();

        assert!(registry.evict(id));
        assert!(!registry.evict(id));
        assert!(!registry.resolve(id, Outcome::Success(Bytes::new())));
        assert_eq!(call.wait().await, None);
    }

    #[tokio::test]
    async fn test_clear_abandons_waiters_and_keeps_counting() {
        // ---
        let registry = CorrelationRegistry::new();
        let a = registry.next();
        let b = registry.next();

        assert_eq!(registry.clear(), 2);
        assert_eq!(a.wait().await, None);
        assert_eq!(b.wait().await, None);

        assert_eq!(registry.next().id(), CallId::new(3));
    }

    #[test]
    fn test_ids_strictly_increase() {
        // ---
        let registry = CorrelationRegistry::new();
        let ids: Vec<CallId> = (0..100).map(|_| registry.next().id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_concurrent_next_yields_distinct_ids() {
        // ---
        let registry = Arc::new(CorrelationRegistry::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let ids: Vec<CallId> = (0..250).map(|_| registry.next().id()).collect();
                    // Each thread observes its own allocations in increasing order.
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for t in threads {
            for id in t.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }

        assert_eq!(seen.len(), 2000);
        assert_eq!(registry.len(), 2000);
    }
}
