use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};
use uuid::Uuid;

use crate::models::rating::AggregateRecord;

/// Invoked with every aggregate delivered to a subscriber.
///
/// Runs outside every feed lock, so it may subscribe or unsubscribe. Callbacks
/// for one target run one at a time and in version order.
pub type Callback = Arc<dyn Fn(&AggregateRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub target_id: Uuid,
    id: u64,
}

struct Subscriber {
    callback: Callback,
    last_seen: Option<u64>,
    initial: Option<AggregateRecord>,
}

#[derive(Default)]
struct TargetState {
    subscribers: HashMap<u64, Subscriber>,
    high_water: Option<u64>,
    // Committed versions above `high_water + 1`, held until the gap closes.
    pending: BTreeMap<u64, AggregateRecord>,
    outbox: VecDeque<AggregateRecord>,
    in_flight: usize,
    draining: bool,
}

impl TargetState {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.in_flight == 0
    }

    fn needs_resync(&self) -> bool {
        self.in_flight == 0 && !self.pending.is_empty()
    }

    fn push(&mut self, record: AggregateRecord) {
        self.high_water = Some(record.version);
        self.outbox.push_back(record);
    }

    fn advance(&mut self) {
        while let Some(hw) = self.high_water {
            match self.pending.remove(&(hw + 1)) {
                Some(record) => self.push(record),
                None => break,
            }
        }
    }

    fn accept(&mut self, target_id: Uuid, record: &AggregateRecord) {
        match self.high_water {
            None => self.push(record.clone()),
            Some(hw) if record.version <= hw => {
                tracing::debug!(
                    "Dropping stale aggregate v{} for target {} (seen v{})",
                    record.version,
                    target_id,
                    hw
                );
            }
            Some(_) => {
                self.pending.insert(record.version, record.clone());
                self.advance();
            }
        }
    }

    /// Gives up on the missing versions below `current`: buffered changes go
    /// out in order, then `current` if it is newer than all of them.
    fn release_through(&mut self, current: &AggregateRecord) {
        let held = std::mem::take(&mut self.pending);
        let mut newer = BTreeMap::new();
        for (version, record) in held {
            if version < current.version {
                self.push(record);
            } else if version > current.version {
                newer.insert(version, record);
            }
        }
        if self.high_water.is_none_or(|hw| current.version > hw) {
            self.push(current.clone());
        }
        self.pending = newer;
        self.advance();
    }

    fn next_delivery(&mut self) -> Option<(Callback, AggregateRecord)> {
        for subscriber in self.subscribers.values_mut() {
            if let Some(record) = subscriber.initial.take() {
                if subscriber.last_seen.is_none_or(|seen| seen < record.version) {
                    subscriber.last_seen = Some(record.version);
                    return Some((subscriber.callback.clone(), record));
                }
            }
        }

        while let Some(record) = self.outbox.front() {
            for subscriber in self.subscribers.values_mut() {
                if subscriber.last_seen.is_none_or(|seen| seen < record.version) {
                    subscriber.last_seen = Some(record.version);
                    return Some((subscriber.callback.clone(), record.clone()));
                }
            }
            self.outbox.pop_front();
        }
        None
    }
}

#[derive(Default)]
struct TargetFeed {
    state: Mutex<TargetState>,
}

impl TargetFeed {
    fn lock(&self) -> MutexGuard<'_, TargetState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs queued callbacks until the outbox is empty. A caller that finds
    /// another thread already draining leaves its work to that thread.
    fn flush(&self) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }

        let _guard = DrainGuard(self);
        loop {
            let next = {
                let mut state = self.lock();
                match state.next_delivery() {
                    Some(next) => next,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            let (callback, record) = next;
            callback(&record);
        }
    }
}

struct DrainGuard<'a>(&'a TargetFeed);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        // A panicking callback must not leave the target stuck.
        if std::thread::panicking() {
            self.0.lock().draining = false;
        }
    }
}

/// Per-target registry of aggregate observers.
///
/// A subscriber never receives a version older than or equal to one it has
/// already seen. Targets never share a lock beyond the registry lookup.
#[derive(Default)]
pub struct ChangeFeed {
    next_id: AtomicU64,
    targets: Mutex<HashMap<Uuid, Arc<TargetFeed>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<TargetFeed>>> {
        self.targets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn target(&self, target_id: Uuid) -> Option<Arc<TargetFeed>> {
        self.registry().get(&target_id).cloned()
    }

    fn prune(&self, target_id: Uuid) {
        let mut targets = self.registry();
        let idle = targets
            .get(&target_id)
            .is_some_and(|feed| feed.lock().is_idle());
        if idle {
            targets.remove(&target_id);
        }
    }

    pub fn register(&self, target_id: Uuid, callback: Callback) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut targets = self.registry();
        targets.entry(target_id).or_default().lock().subscribers.insert(
            id,
            Subscriber {
                callback,
                last_seen: None,
                initial: None,
            },
        );

        SubscriptionHandle { target_id, id }
    }

    /// Hands a subscriber the aggregate it read at subscribe time, unless a
    /// newer change already reached it. A snapshot newer than anything
    /// published goes to every subscriber of the target.
    pub fn deliver_initial(&self, handle: &SubscriptionHandle, snapshot: &AggregateRecord) {
        let Some(feed) = self.target(handle.target_id) else {
            return;
        };

        {
            let mut state = feed.lock();
            if !state.subscribers.contains_key(&handle.id) {
                return;
            }
            if state.high_water.is_none_or(|hw| snapshot.version > hw) {
                state.release_through(snapshot);
            } else if let Some(subscriber) = state.subscribers.get_mut(&handle.id) {
                subscriber.initial = Some(snapshot.clone());
            }
        }
        feed.flush();
    }

    /// Marks a commit on the target as started. Every call is paired with
    /// [`ChangeFeed::publish`] or [`ChangeFeed::abandon`].
    pub fn begin(&self, target_id: Uuid) {
        self.registry()
            .entry(target_id)
            .or_default()
            .lock()
            .in_flight += 1;
    }

    /// Delivers a committed aggregate. Returns `true` when a version below it
    /// is missing and no commit that could fill the gap is still running; the
    /// caller should then re-read the target and pass it to
    /// [`ChangeFeed::resync`].
    pub fn publish(&self, target_id: Uuid, record: &AggregateRecord) -> bool {
        self.settle(target_id, Some(record))
    }

    /// Marks a started commit as failed.
    pub fn abandon(&self, target_id: Uuid) -> bool {
        self.settle(target_id, None)
    }

    fn settle(&self, target_id: Uuid, record: Option<&AggregateRecord>) -> bool {
        let Some(feed) = self.target(target_id) else {
            return false;
        };

        let needs_resync = {
            let mut state = feed.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(record) = record {
                state.accept(target_id, record);
            }
            state.needs_resync()
        };
        feed.flush();
        self.prune(target_id);
        needs_resync
    }

    /// Closes a gap with the aggregate as the store holds it now.
    pub fn resync(&self, target_id: Uuid, current: &AggregateRecord) {
        let Some(feed) = self.target(target_id) else {
            return;
        };

        {
            let mut state = feed.lock();
            if state.pending.is_empty() {
                return;
            }
            tracing::warn!(
                "Feed for target {} missed a version, resyncing at v{}",
                target_id,
                current.version
            );
            state.release_through(current);
        }
        feed.flush();
    }

    /// Removes the subscription. No callback for it starts once this returns.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut targets = self.registry();
        let Some(feed) = targets.get(&handle.target_id) else {
            return false;
        };

        let (removed, idle) = {
            let mut state = feed.lock();
            let removed = state.subscribers.remove(&handle.id).is_some();
            (removed, state.is_idle())
        };
        if idle {
            targets.remove(&handle.target_id);
        }
        removed
    }

    pub fn subscriber_count(&self, target_id: Uuid) -> usize {
        self.target(target_id)
            .map_or(0, |feed| feed.lock().subscribers.len())
    }
}
