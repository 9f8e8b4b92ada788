//! Read-only sync status and event stream for the UI layer

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use crate::models::{ConflictId, EntityKey, OperationId};
use crate::resolver::ResolutionStrategy;

const EVENT_CAPACITY: usize = 64;

/// Coarse state of the last or current cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
}

impl SyncState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Derived state shown by badges and banners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    /// Operations waiting to be sent or in flight
    pub pending_operations_count: usize,
    /// Operations in terminal failure
    pub error_operations_count: usize,
    /// Conflicts awaiting a manual decision
    pub conflict_count: usize,
    pub is_syncing: bool,
    /// End of the last successful cycle (unix ms)
    pub last_sync_time: Option<i64>,
    pub sync_status: SyncState,
    pub is_online: bool,
}

/// Counts gathered at the end of one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Operations confirmed by the server
    pub synced: usize,
    /// Conflicts resolved automatically
    pub conflicts: usize,
    /// Conflicts waiting for a manual decision
    pub deferred: usize,
    /// Operations that reached terminal failure
    pub failed: usize,
    /// Transient failures scheduled for retry
    pub retried: usize,
    /// Whether the cycle stopped because connectivity dropped
    pub aborted: bool,
}

/// Notifications for toasts and dialogs
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted(SyncReport),
    SyncFailed(String),
    ConflictDetected {
        conflict_id: ConflictId,
        entity: EntityKey,
        strategy: ResolutionStrategy,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        entity: EntityKey,
        resolution: String,
    },
    OperationFailed {
        operation_id: OperationId,
        entity: EntityKey,
        error: String,
    },
}

/// Owner side of the status surface.
#[derive(Debug)]
pub struct StatusSurface {
    snapshot: watch::Sender<SyncStatusSnapshot>,
    events: broadcast::Sender<SyncEvent>,
}

impl Default for StatusSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSurface {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(SyncStatusSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshot, events }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> SyncStatusSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.snapshot.subscribe()
    }

    /// Event stream; slow receivers miss old events rather than block sync.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Edit the snapshot, notifying watchers only on an actual change.
    pub fn update(&self, change: impl FnOnce(&mut SyncStatusSnapshot)) {
        self.snapshot.send_if_modified(|snapshot| {
            let before = snapshot.clone();
            change(snapshot);
            *snapshot != before
        });
    }

    pub fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
