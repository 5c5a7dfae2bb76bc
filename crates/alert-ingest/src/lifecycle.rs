use crate::{Alert, AlertId};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// Transition of an alert identity, reported by a LifecycleStore in the
/// order its lock decided them. For any one identity, reported transitions
/// are therefore ordered as that identity's observations and expiry were.
#[derive(Debug, PartialEq)]
pub enum Transition {
    /// An occurrence of `alert` which is to be emitted as active.
    Active { id: AlertId, alert: Alert },
    /// The TTL of `id` elapsed without a refreshing observation.
    /// `alert` is the alert as it was when `id` became active.
    Inactive { id: AlertId, alert: Alert },
}

/// LifecycleStore tracks the set of currently-active alert identities.
///
/// Every identity is created by its first `observe()` and, if the store has a
/// TTL, removed again once the TTL elapses without a further `observe()` of
/// the same identity. Without a TTL, identities stay active for the lifetime
/// of the store.
///
/// Transitions are reported through the channel returned by
/// `LifecycleStore::new()`. They're sent while holding the store's lock,
/// which is otherwise never held across I/O: the channel is unbounded and
/// sending never blocks.
#[derive(Clone)]
pub struct LifecycleStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    ttl: Option<Duration>,
    first_only: bool,
    transitions_tx: mpsc::UnboundedSender<Transition>,
}

#[derive(Default)]
struct State {
    entries: HashMap<AlertId, Entry>,
    // Monotonic counter which distinguishes successive entries of one identity.
    generation: u64,
}

struct Entry {
    generation: u64,
    // Instant at which the entry expires. None if the store has no TTL.
    deadline: Option<Instant>,
}

impl Inner {
    fn report(&self, transition: Transition) {
        if self.transitions_tx.send(transition).is_err() {
            tracing::debug!("receiver of alert transitions has been dropped");
        }
    }
}

impl LifecycleStore {
    /// Build a LifecycleStore with the given `ttl`, which disables expiry if
    /// None or zero. If `first_only`, an Active transition is reported only
    /// for the occurrence which activates an identity, and otherwise for
    /// every occurrence. Also returns the receiver of transitions.
    pub fn new(
        ttl: Option<Duration>,
        first_only: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Transition>) {
        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();

        let inner = Inner {
            state: Mutex::new(State::default()),
            ttl: ttl.filter(|ttl| !ttl.is_zero()),
            first_only,
            transitions_tx,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            transitions_rx,
        )
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.inner.ttl
    }

    /// Observe an occurrence of `alert` having identity `id`, returning true
    /// if `id` was already active.
    ///
    /// A first occurrence creates a new entry and, given a TTL, starts its
    /// expiry countdown, capturing `alert` to be replayed upon expiry.
    /// Repeat occurrences restart the countdown.
    ///
    /// Must be called within a tokio runtime.
    pub async fn observe(&self, id: AlertId, alert: Alert) -> bool {
        let mut state = self.inner.state.lock().await;

        if let Some(entry) = state.entries.get_mut(&id) {
            if let (Some(deadline), Some(ttl)) = (entry.deadline.as_mut(), self.inner.ttl) {
                *deadline = Instant::now() + ttl;
            }
            tracing::debug!(%id, "refreshed active alert");

            if !self.inner.first_only {
                self.inner.report(Transition::Active { id, alert });
            }
            return true;
        }

        state.generation += 1;
        let generation = state.generation;
        let deadline = self.inner.ttl.map(|ttl| Instant::now() + ttl);

        if let Some(deadline) = deadline {
            tokio::spawn(expire(
                Arc::downgrade(&self.inner),
                id.clone(),
                generation,
                deadline,
                alert.clone(),
            ));
        }
        tracing::debug!(%id, generation, "alert became active");

        state.entries.insert(
            id.clone(),
            Entry {
                generation,
                deadline,
            },
        );
        metrics::gauge!("active_alerts").set(state.entries.len() as f64);

        self.inner.report(Transition::Active { id, alert });
        false
    }

    /// Number of currently-active identities.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// Wait out the deadline of the `generation` entry of `id`, then remove it
// and report its expiry. Refreshes may push the deadline back while we sleep,
// in which case we sleep again.
async fn expire(
    inner: Weak<Inner>,
    id: AlertId,
    generation: u64,
    mut deadline: Instant,
    alert: Alert,
) {
    loop {
        tokio::time::sleep_until(deadline).await;

        // The store was dropped while we slept.
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;

        match state.entries.get(&id) {
            Some(Entry {
                generation: current,
                deadline: Some(next),
            }) if *current == generation => {
                if *next > Instant::now() {
                    deadline = *next;
                    continue;
                }
            }
            // Only this task removes the entry of its generation, and an
            // identity can't be re-created until it's removed.
            _ => {
                tracing::debug!(%id, generation, "expiry of an entry which is no longer current");
                return;
            }
        }

        state.entries.remove(&id);
        metrics::gauge!("active_alerts").set(state.entries.len() as f64);

        tracing::info!(%id, generation, "alert became inactive");
        inner.report(Transition::Inactive { id, alert });
        return;
    }
}
