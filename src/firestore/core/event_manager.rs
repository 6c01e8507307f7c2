//! Fans view snapshots out to query listeners.
//!
//! The event manager never calls observers directly. Every method pushes
//! the callbacks it wants to run into a [`RaisedEvents`] list that the sync
//! engine delivers once its own state lock is released, so observers may
//! freely call back into the client.

use std::collections::HashMap;
use std::sync::Arc;

use crate::firestore::core::online_state::OnlineState;
use crate::firestore::core::query::Query;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;
pub type SnapshotsInSyncObserver = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots when only metadata (`from_cache`,
    /// `has_pending_writes`) changed.
    pub include_metadata_changes: bool,
    /// Hold back the first cached snapshot until the server answered, unless
    /// the client is offline.
    pub wait_for_sync_when_online: bool,
}

/// Callbacks collected while state is locked, delivered afterwards.
#[derive(Default)]
pub struct RaisedEvents {
    events: Vec<RaisedEvent>,
}

enum RaisedEvent {
    Snapshot(SnapshotObserver, ViewSnapshot),
    Error(SnapshotObserver, FirestoreError),
    InSync(SnapshotsInSyncObserver),
}

impl RaisedEvents {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn extend(&mut self, other: RaisedEvents) {
        self.events.extend(other.events);
    }

    pub fn deliver(self) {
        for event in self.events {
            match event {
                RaisedEvent::Snapshot(observer, snapshot) => observer(Ok(snapshot)),
                RaisedEvent::Error(observer, error) => observer(Err(error)),
                RaisedEvent::InSync(observer) => observer(),
            }
        }
    }
}

/// One registered listener and what it has seen so far.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(id: u64, query: Query, options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            id,
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn on_view_snapshot(&mut self, mut snapshot: ViewSnapshot, events: &mut RaisedEvents) -> bool {
        if !self.options.include_metadata_changes {
            snapshot
                .document_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.exclude_metadata_changes = true;
        }
        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot, events);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            events
                .events
                .push(RaisedEvent::Snapshot(Arc::clone(&self.observer), snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    fn on_error(&self, error: FirestoreError, events: &mut RaisedEvents) {
        events
            .events
            .push(RaisedEvent::Error(Arc::clone(&self.observer), error));
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState, events: &mut RaisedEvents) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot, events);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.documents.is_empty()
            || snapshot.has_cached_results
            || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot, events: &mut RaisedEvents) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        events
            .events
            .push(RaisedEvent::Snapshot(Arc::clone(&self.observer), initial));
    }
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

/// Listener registry keyed by query canonical id.
#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync: Vec<(u64, SnapshotsInSyncObserver)>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no listener for `query` is registered yet, i.e. the sync
    /// engine must start listening before calling [`add_listener`](Self::add_listener).
    pub fn is_first_listen(&self, query: &Query) -> bool {
        !self.queries.contains_key(&query.canonical_id())
    }

    /// Registers `listener`. `initial` is the snapshot produced by a first
    /// listen; later listeners reuse the latest snapshot.
    pub fn add_listener(
        &mut self,
        mut listener: QueryListener,
        initial: Option<ViewSnapshot>,
        events: &mut RaisedEvents,
    ) {
        let online_state = self.online_state;
        let info = self
            .queries
            .entry(listener.query.canonical_id())
            .or_insert_with(|| QueryListenersInfo {
                view_snapshot: None,
                listeners: Vec::new(),
            });
        if initial.is_some() {
            info.view_snapshot = initial;
        }
        listener.apply_online_state_change(online_state, events);
        let raised = match &info.view_snapshot {
            Some(snapshot) => listener.on_view_snapshot(snapshot.clone(), events),
            None => false,
        };
        info.listeners.push(listener);
        if raised {
            self.raise_snapshots_in_sync(events);
        }
    }

    /// Delivers a listen failure to a listener that was never registered.
    pub fn reject_listener(listener: &QueryListener, error: FirestoreError, events: &mut RaisedEvents) {
        listener.on_error(error, events);
    }

    /// Removes a listener. Returns true when it was the last one for its
    /// query and the target should be released.
    pub fn remove_listener(&mut self, query: &Query, listener_id: u64) -> bool {
        let canonical_id = query.canonical_id();
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return false;
        };
        info.listeners.retain(|listener| listener.id != listener_id);
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            return true;
        }
        false
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>, events: &mut RaisedEvents) {
        let mut raised = false;
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                if listener.on_view_snapshot(snapshot.clone(), events) {
                    raised = true;
                }
            }
            info.view_snapshot = Some(snapshot);
        }
        if raised {
            self.raise_snapshots_in_sync(events);
        }
    }

    /// Fails every listener of `query` and forgets the query.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError, events: &mut RaisedEvents) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for listener in &info.listeners {
                listener.on_error(error.clone(), events);
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState, events: &mut RaisedEvents) {
        self.online_state = online_state;
        let mut raised = false;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                if listener.apply_online_state_change(online_state, events) {
                    raised = true;
                }
            }
        }
        if raised {
            self.raise_snapshots_in_sync(events);
        }
    }

    pub fn add_snapshots_in_sync_listener(
        &mut self,
        id: u64,
        observer: SnapshotsInSyncObserver,
        events: &mut RaisedEvents,
    ) {
        events.events.push(RaisedEvent::InSync(Arc::clone(&observer)));
        self.snapshots_in_sync.push((id, observer));
    }

    pub fn remove_snapshots_in_sync_listener(&mut self, id: u64) {
        self.snapshots_in_sync.retain(|(existing, _)| *existing != id);
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Queries with at least one listener.
    pub fn queries(&self) -> Vec<Query> {
        self.queries
            .values()
            .filter_map(|info| info.listeners.first().map(|listener| listener.query.clone()))
            .collect()
    }

    fn raise_snapshots_in_sync(&self, events: &mut RaisedEvents) {
        for (_, observer) in &self.snapshots_in_sync {
            events.events.push(RaisedEvent::InSync(Arc::clone(observer)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    fn recording_observer() -> (SnapshotObserver, Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: SnapshotObserver = Arc::new(move |result| sink.lock().unwrap().push(result));
        (observer, seen)
    }

    fn snapshot(query: &Query, paths: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut documents = DocumentSet::for_query(query);
        for path in paths {
            documents.insert(Document::new_found(
                DocumentKey::from_string(path).unwrap(),
                SnapshotVersion::from_timestamp(Timestamp::new(1, 0)),
                MapValue::empty(),
            ));
        }
        ViewSnapshot::from_initial_documents(query.clone(), documents, BTreeSet::new(), from_cache, false)
    }

    #[test]
    fn empty_cached_snapshot_waits_for_online_state() {
        let query = Query::collection("c").unwrap();
        let (observer, seen) = recording_observer();
        let mut manager = EventManager::new();
        let mut events = RaisedEvents::default();
        assert!(manager.is_first_listen(&query));
        manager.add_listener(
            QueryListener::new(1, query.clone(), ListenOptions::default(), observer),
            Some(snapshot(&query, &[], true)),
            &mut events,
        );
        events.deliver();
        assert!(seen.lock().unwrap().is_empty());

        let mut events = RaisedEvents::default();
        manager.on_online_state_change(OnlineState::Offline, &mut events);
        events.deliver();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn second_listener_receives_latest_snapshot() {
        let query = Query::collection("c").unwrap();
        let (first, _) = recording_observer();
        let (second, seen) = recording_observer();
        let mut manager = EventManager::new();
        let mut events = RaisedEvents::default();
        manager.add_listener(
            QueryListener::new(1, query.clone(), ListenOptions::default(), first),
            Some(snapshot(&query, &["c/a"], false)),
            &mut events,
        );
        assert!(!manager.is_first_listen(&query));
        manager.add_listener(
            QueryListener::new(2, query.clone(), ListenOptions::default(), second),
            None,
            &mut events,
        );
        events.deliver();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].as_ref().unwrap().documents.len(), 1);

        assert!(!manager.remove_listener(&query, 1));
        assert!(manager.remove_listener(&query, 2));
    }

    #[test]
    fn watch_errors_reach_every_listener() {
        let query = Query::collection("c").unwrap();
        let (observer, seen) = recording_observer();
        let mut manager = EventManager::new();
        let mut events = RaisedEvents::default();
        manager.add_listener(
            QueryListener::new(1, query.clone(), ListenOptions::default(), observer),
            Some(snapshot(&query, &["c/a"], false)),
            &mut events,
        );
        manager.on_watch_error(
            &query,
            crate::firestore::error::permission_denied("denied"),
            &mut events,
        );
        events.deliver();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].is_err());
        assert!(manager.is_first_listen(&query));
    }
}
