use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::session::SessionKind;
use crate::store::{UserId, VmId};

/// Snapshot of one active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: Uuid,
    pub user_id: UserId,
    pub vm_id: VmId,
    pub kind: SessionKind,
    pub opened_at: DateTime<Utc>,
}

struct Entry {
    info: SessionInfo,
    cancel: CancellationToken,
}

/// Active tunnel sessions, keyed by session id.
///
/// Removing an entry and cancelling its token happen together under the
/// lock, so a session is deregistered exactly once whether it ends on its
/// own or is force-closed.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session. The returned token fires on forced teardown.
    pub fn insert(&self, id: Uuid, user_id: UserId, vm_id: VmId, kind: SessionKind) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.lock().insert(
            id,
            Entry {
                info: SessionInfo {
                    id,
                    user_id,
                    vm_id,
                    kind,
                    opened_at: Utc::now(),
                },
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    /// Deregister a session that ended on its own. Returns whether it was
    /// still registered.
    pub fn remove(&self, id: Uuid) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Deregister and cancel every session matching `pred`.
    fn force_close_where(&self, pred: impl Fn(&SessionInfo) -> bool) -> Vec<SessionInfo> {
        let mut sessions = self.lock();
        let ids: Vec<Uuid> = sessions
            .values()
            .filter(|e| pred(&e.info))
            .map(|e| e.info.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|entry| {
                entry.cancel.cancel();
                entry.info
            })
            .collect()
    }

    pub fn force_close(&self, id: Uuid) -> bool {
        !self.force_close_where(|s| s.id == id).is_empty()
    }

    /// Close every session on a VM. Used on suspension, expiry and deletion.
    pub fn force_close_by_vm(&self, vm_id: VmId) -> usize {
        let closed = self.force_close_where(|s| s.vm_id == vm_id);
        if !closed.is_empty() {
            info!(vm_id, count = closed.len(), "force-closed sessions for vm");
        }
        closed.len()
    }

    /// Close every session opened by a user. Used on account removal.
    pub fn force_close_by_user(&self, user_id: UserId) -> usize {
        let closed = self.force_close_where(|s| s.user_id == user_id);
        if !closed.is_empty() {
            info!(user_id, count = closed.len(), "force-closed sessions for user");
        }
        closed.len()
    }

    pub fn close_all(&self) -> usize {
        self.force_close_where(|_| true).len()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn count_kind(&self, kind: SessionKind) -> usize {
        self.lock().values().filter(|e| e.info.kind == kind).count()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut all: Vec<SessionInfo> = self.lock().values().map(|e| e.info.clone()).collect();
        all.sort_by_key(|s| s.opened_at);
        all
    }
}
