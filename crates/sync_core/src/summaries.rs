use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ApprovalId, ApprovalStatus, EntityKind, ScopeId, UserId},
    protocol::{
        ApprovalDecision, ApprovalRequest, ChannelFilter, EventClass, MarkReadRequest,
        NotificationEvent, RowChange, ScopeSummary,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    error::SyncError,
    revalidate::{Registration, Revalidate},
    subscriptions::{SubscriptionHandle, SubscriptionManager},
    transport::BackendApi,
    Session, SyncEvent,
};

/// Pure fold from raw rows to per-scope counters. Only unread rows addressed
/// to the viewer and pending approvals awaiting the viewer count; rows are
/// deduplicated by id so at-least-once delivery cannot double-count; scopes
/// where both counters are zero are omitted entirely.
pub fn fold_summaries(
    viewer_id: UserId,
    notifications: &[NotificationEvent],
    approvals: &[ApprovalRequest],
) -> HashMap<ScopeId, ScopeSummary> {
    let mut summaries: HashMap<ScopeId, ScopeSummary> = HashMap::new();
    let mut counted_notifications = HashSet::new();
    let mut counted_approvals = HashSet::new();

    for notification in notifications {
        if notification.recipient_id != viewer_id || notification.read_at.is_some() {
            continue;
        }
        if !counted_notifications.insert(notification.notification_id) {
            continue;
        }
        summaries
            .entry(notification.scope_id)
            .or_insert_with(|| empty_summary(notification.scope_id))
            .unread_updates += 1;
    }

    for approval in approvals {
        if approval.approver_id != viewer_id || approval.status != ApprovalStatus::Pending {
            continue;
        }
        if !counted_approvals.insert(approval.approval_id) {
            continue;
        }
        summaries
            .entry(approval.scope_id)
            .or_insert_with(|| empty_summary(approval.scope_id))
            .pending_approvals += 1;
    }

    summaries
}

fn empty_summary(scope_id: ScopeId) -> ScopeSummary {
    ScopeSummary {
        scope_id,
        unread_updates: 0,
        pending_approvals: 0,
    }
}

struct BoardState {
    tracked: Vec<ScopeId>,
    summaries: HashMap<ScopeId, ScopeSummary>,
    handles: HashMap<ScopeId, Vec<SubscriptionHandle>>,
    recompute_in_flight: bool,
    recompute_dirty: bool,
    closed: bool,
}

/// Owns the derived summary map for every scope a list view renders. The map
/// is always replaced wholesale by a fresh fold; optimistic decrements after
/// mark-read/approval actions are provisional and the next pass overrides
/// any drift.
pub struct SummaryBoard {
    session: Session,
    backend: Arc<dyn BackendApi>,
    subscriptions: Arc<SubscriptionManager>,
    events: broadcast::Sender<SyncEvent>,
    delivery_tx: mpsc::UnboundedSender<RowChange>,
    inner: Mutex<BoardState>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<Registration>>,
}

impl SummaryBoard {
    pub(crate) async fn open(
        scope_ids: Vec<ScopeId>,
        session: Session,
        backend: Arc<dyn BackendApi>,
        subscriptions: Arc<SubscriptionManager>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Result<Arc<Self>> {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let board = Arc::new(Self {
            session,
            backend,
            subscriptions,
            events,
            delivery_tx,
            inner: Mutex::new(BoardState {
                tracked: Vec::new(),
                summaries: HashMap::new(),
                handles: HashMap::new(),
                recompute_in_flight: false,
                recompute_dirty: false,
                closed: false,
            }),
            pump_task: Mutex::new(None),
            registration: Mutex::new(None),
        });
        *board.pump_task.lock().await = Some(board.spawn_recompute_pump(delivery_rx));
        // A half-opened board must not leave subscriptions behind.
        if let Err(err) = board.set_tracked_scopes(scope_ids).await {
            board.close().await;
            return Err(err);
        }
        Ok(board)
    }

    pub async fn summaries(&self) -> HashMap<ScopeId, ScopeSummary> {
        self.inner.lock().await.summaries.clone()
    }

    pub async fn summary(&self, scope_id: ScopeId) -> Option<ScopeSummary> {
        self.inner.lock().await.summaries.get(&scope_id).copied()
    }

    /// Re-points the board at a new scope set: stale subscriptions close,
    /// new ones open, and the summary map is rebuilt.
    pub async fn set_tracked_scopes(&self, scope_ids: Vec<ScopeId>) -> Result<()> {
        let (to_close, to_open) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(SyncError::Closed.into());
            }
            let removed: Vec<ScopeId> = inner
                .tracked
                .iter()
                .filter(|scope_id| !scope_ids.contains(scope_id))
                .copied()
                .collect();
            let added: Vec<ScopeId> = scope_ids
                .iter()
                .filter(|scope_id| !inner.tracked.contains(scope_id))
                .copied()
                .collect();
            inner.tracked = scope_ids;
            let mut to_close = Vec::new();
            for scope_id in removed {
                to_close.extend(inner.handles.remove(&scope_id).unwrap_or_default());
            }
            (to_close, added)
        };

        for handle in to_close {
            self.subscriptions.close(handle).await;
        }
        for scope_id in to_open {
            for entity in [EntityKind::Notification, EntityKind::Approval] {
                let handle = self
                    .subscriptions
                    .open(
                        ChannelFilter {
                            entity,
                            scope_id,
                            class: EventClass::Any,
                        },
                        self.delivery_tx.clone(),
                    )
                    .await?;
                self.inner
                    .lock()
                    .await
                    .handles
                    .entry(scope_id)
                    .or_default()
                    .push(handle);
            }
        }

        self.recompute().await;
        Ok(())
    }

    /// Full recompute across every tracked scope. Concurrent requests
    /// coalesce: at most one pass runs at a time, with one follow-up pass if
    /// more triggers arrived meanwhile.
    pub async fn recompute(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            if inner.recompute_in_flight {
                inner.recompute_dirty = true;
                return;
            }
            inner.recompute_in_flight = true;
        }

        loop {
            if let Err(err) = self.recompute_once().await {
                // Secondary read: badge staleness is tolerable, interrupting
                // the user is not.
                warn!(error = %err, "summary recompute failed");
                let _ = self
                    .events
                    .send(SyncEvent::Error(format!("summary recompute failed: {err}")));
            }
            let mut inner = self.inner.lock().await;
            if inner.recompute_dirty && !inner.closed {
                inner.recompute_dirty = false;
                continue;
            }
            inner.recompute_in_flight = false;
            break;
        }
    }

    async fn recompute_once(&self) -> Result<(), SyncError> {
        let tracked = {
            let inner = self.inner.lock().await;
            inner.tracked.clone()
        };
        if tracked.is_empty() {
            let mut inner = self.inner.lock().await;
            inner.summaries.clear();
            return Ok(());
        }

        let notifications = self.backend.fetch_notifications(&tracked).await?;
        let approvals = self.backend.fetch_approvals(&tracked).await?;
        let summaries = fold_summaries(self.session.viewer_id, &notifications, &approvals);
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Ok(());
            }
            inner.summaries = summaries;
        }
        let _ = self.events.send(SyncEvent::SummariesChanged);
        Ok(())
    }

    /// Marks one notification (or a whole scope) read, decrements the local
    /// counter for immediate feedback, then lets the next recompute pass
    /// reconcile with server state.
    pub async fn mark_read(&self, request: MarkReadRequest) -> Result<(), SyncError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(SyncError::Closed);
            }
            let scope_id = request.scope_id();
            if let Some(summary) = inner.summaries.get_mut(&scope_id) {
                match request {
                    MarkReadRequest::Notification { .. } => {
                        summary.unread_updates = summary.unread_updates.saturating_sub(1);
                    }
                    MarkReadRequest::Scope { .. } => {
                        summary.unread_updates = 0;
                    }
                }
                if summary.unread_updates == 0 && summary.pending_approvals == 0 {
                    inner.summaries.remove(&scope_id);
                }
            }
        }
        let _ = self.events.send(SyncEvent::SummariesChanged);

        let result = self.backend.mark_read(request).await;
        self.recompute().await;
        result.map_err(SyncError::Network)
    }

    /// Pending approvals awaiting the viewer's decision in one scope.
    pub async fn pending_approvals(
        &self,
        scope_id: ScopeId,
    ) -> Result<Vec<ApprovalRequest>, SyncError> {
        let approvals = self.backend.fetch_approvals(&[scope_id]).await?;
        Ok(approvals
            .into_iter()
            .filter(|approval| {
                approval.scope_id == scope_id
                    && approval.status == ApprovalStatus::Pending
                    && approval.approver_id == self.session.viewer_id
            })
            .collect())
    }

    /// Approves or rejects one request. The transition is terminal server
    /// side; locally the pending counter drops optimistically and the next
    /// recompute pass reconciles.
    pub async fn resolve_approval(
        &self,
        approval_id: ApprovalId,
        scope_id: ScopeId,
        decision: ApprovalDecision,
    ) -> Result<ApprovalRequest, SyncError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(SyncError::Closed);
            }
            if let Some(summary) = inner.summaries.get_mut(&scope_id) {
                summary.pending_approvals = summary.pending_approvals.saturating_sub(1);
                if summary.unread_updates == 0 && summary.pending_approvals == 0 {
                    inner.summaries.remove(&scope_id);
                }
            }
        }
        let _ = self.events.send(SyncEvent::SummariesChanged);

        let result = self.backend.resolve_approval(approval_id, decision).await;
        self.recompute().await;
        result.map_err(SyncError::Network)
    }

    pub async fn close(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.handles.drain().flat_map(|(_, handles)| handles).collect()
        };
        for handle in handles {
            self.subscriptions.close(handle).await;
        }
        if let Some(task) = self.pump_task.lock().await.take() {
            task.abort();
        }
        if let Some(registration) = self.registration.lock().await.take() {
            registration.release().await;
        }
        info!("summary board closed");
    }

    pub(crate) async fn attach_registration(&self, registration: Registration) {
        *self.registration.lock().await = Some(registration);
    }

    fn spawn_recompute_pump(
        self: &Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<RowChange>,
    ) -> JoinHandle<()> {
        let board = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(_change) = deliveries.recv().await {
                // Coalesce a burst of deliveries into one recompute pass;
                // the pass is a full fold, so collapsing is lossless.
                while deliveries.try_recv().is_ok() {}
                board.recompute().await;
            }
        })
    }
}

#[async_trait]
impl Revalidate for SummaryBoard {
    async fn revalidate(&self) -> Result<()> {
        self.recompute().await;
        Ok(())
    }
}
