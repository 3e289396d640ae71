//! Handle Registry
//!
//! Thread-safe bookkeeping of every live native resource, using DashMap for
//! concurrent access. Each handle records its kind and its parent at creation,
//! which is what release-order checks are made against.
//!
//! Session and channel lifecycle events are broadcast to subscribers in the
//! order they happen. Socket event handles are counted but not announced;
//! they come and go with every wait.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Registry-wide handle identifier
pub type HandleId = u64;

const EVENT_CAPACITY: usize = 1024;

/// Kind of native resource behind a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Session,
    Channel,
    SocketEvent,
}

/// Lifecycle event emitted by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleEvent {
    Created {
        id: HandleId,
        kind: HandleKind,
        parent: Option<HandleId>,
    },
    Released {
        id: HandleId,
        kind: HandleKind,
    },
    OrderingViolation {
        id: HandleId,
        parent: HandleId,
    },
}

/// What to do when a handle is released out of order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingPolicy {
    /// Panic (debug builds)
    Panic,
    /// Log, count and skip the native release (release builds)
    Report,
}

impl Default for OrderingPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            OrderingPolicy::Panic
        } else {
            OrderingPolicy::Report
        }
    }
}

/// Snapshot of a live handle
#[derive(Debug, Clone)]
pub struct HandleEntry {
    pub id: HandleId,
    pub kind: HandleKind,
    pub parent: Option<HandleId>,
    pub label: String,
    pub created_at: Instant,
}

/// Registry of live native handles
#[derive(Debug)]
pub struct HandleRegistry {
    handles: DashMap<HandleId, HandleEntry>,
    next_id: AtomicU64,
    violations: AtomicUsize,
    policy: OrderingPolicy,
    events_tx: broadcast::Sender<HandleEvent>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<HandleRegistry>> = OnceLock::new();

impl HandleRegistry {
    pub fn new() -> Self {
        Self::with_policy(OrderingPolicy::default())
    }

    pub fn with_policy(policy: OrderingPolicy) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            violations: AtomicUsize::new(0),
            policy,
            events_tx,
        }
    }

    /// Process-wide registry used when no other one is supplied
    pub fn global() -> Arc<HandleRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(HandleRegistry::new()))
            .clone()
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.policy
    }

    /// Subscribe to session/channel lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events_tx.subscribe()
    }

    pub(crate) fn register(
        &self,
        kind: HandleKind,
        parent: Option<HandleId>,
        label: impl Into<String>,
    ) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = HandleEntry {
            id,
            kind,
            parent,
            label: label.into(),
            created_at: Instant::now(),
        };
        if kind != HandleKind::SocketEvent {
            debug!("Registered {:?} handle {} ({})", kind, id, entry.label);
        }
        self.handles.insert(id, entry);
        self.emit(kind, HandleEvent::Created { id, kind, parent });
        id
    }

    /// Remove a handle; returns false if it was not live.
    pub(crate) fn release(&self, id: HandleId) -> bool {
        match self.handles.remove(&id) {
            Some((_, entry)) => {
                if entry.kind != HandleKind::SocketEvent {
                    debug!("Released {:?} handle {} ({})", entry.kind, id, entry.label);
                }
                self.emit(entry.kind, HandleEvent::Released { id, kind: entry.kind });
                true
            }
            None => false,
        }
    }

    /// Record that `parent` is being released while `id` still depends on it.
    ///
    /// Panics under [`OrderingPolicy::Panic`] unless the thread is already
    /// unwinding.
    pub(crate) fn report_violation(&self, id: HandleId, parent: HandleId) {
        self.violations.fetch_add(1, Ordering::SeqCst);
        let _ = self.events_tx.send(HandleEvent::OrderingViolation { id, parent });
        error!(
            "Resource ordering violation: handle {} outlives its parent {}",
            id, parent
        );
        if self.policy == OrderingPolicy::Panic && !std::thread::panicking() {
            panic!(
                "handle {} would be released after its session {}",
                id, parent
            );
        }
    }

    fn emit(&self, kind: HandleKind, event: HandleEvent) {
        if kind != HandleKind::SocketEvent {
            // No subscribers is fine
            let _ = self.events_tx.send(event);
        }
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    /// Total number of live handles of every kind
    pub fn live_count(&self) -> usize {
        self.handles.len()
    }

    pub fn live_count_of(&self, kind: HandleKind) -> usize {
        self.handles.iter().filter(|e| e.kind == kind).count()
    }

    /// Live handles created with `parent` as their parent
    pub fn children_of(&self, parent: HandleId) -> Vec<HandleId> {
        let mut children: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|e| e.parent == Some(parent))
            .map(|e| e.id)
            .collect();
        children.sort_unstable();
        children
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Live handles ordered by creation
    pub fn snapshot(&self) -> Vec<HandleEntry> {
        let mut entries: Vec<HandleEntry> = self.handles.iter().map(|e| e.clone()).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}
