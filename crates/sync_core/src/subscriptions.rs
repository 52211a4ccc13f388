use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use shared::{
    domain::{EntityKind, ScopeId},
    protocol::{ChannelFilter, ChannelStatus, RowChange},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::channel::{ChannelFactory, ChannelSubscription};

const HEALTH_BUFFER: usize = 64;

/// A status transition on one live subscription, republished for the
/// fallback revalidator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHealth {
    pub entity: EntityKind,
    pub scope_id: ScopeId,
    pub status: ChannelStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    key: (EntityKind, ScopeId),
}

struct ActiveSubscription {
    id: u64,
    subscription: Arc<dyn ChannelSubscription>,
    pump_task: JoinHandle<()>,
}

/// Owns the lifecycle of live subscriptions: exactly one open subscription
/// per (entity, scope) pair, every delivery forwarded to exactly one handler,
/// and release guaranteed on every exit path.
pub struct SubscriptionManager {
    factory: Arc<dyn ChannelFactory>,
    health: broadcast::Sender<ChannelHealth>,
    next_handle_id: AtomicU64,
    open_subscriptions: Mutex<HashMap<(EntityKind, ScopeId), ActiveSubscription>>,
}

impl SubscriptionManager {
    pub fn new(factory: Arc<dyn ChannelFactory>) -> Self {
        let (health, _) = broadcast::channel(HEALTH_BUFFER);
        Self {
            factory,
            health,
            next_handle_id: AtomicU64::new(1),
            open_subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn health_events(&self) -> broadcast::Receiver<ChannelHealth> {
        self.health.subscribe()
    }

    pub async fn open(
        &self,
        filter: ChannelFilter,
        handler: mpsc::UnboundedSender<RowChange>,
    ) -> Result<SubscriptionHandle> {
        let key = (filter.entity, filter.scope_id);
        if let Some(previous) = self.open_subscriptions.lock().await.remove(&key) {
            info!(
                entity = ?filter.entity,
                scope_id = filter.scope_id.0,
                "closing prior subscription before reopening"
            );
            Self::release(previous).await;
        }

        let subscription = self.factory.open(filter).await?;
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let pump_task = self.spawn_pump(filter, Arc::clone(&subscription), handler);
        let replaced = self.open_subscriptions.lock().await.insert(
            key,
            ActiveSubscription {
                id,
                subscription,
                pump_task,
            },
        );
        if let Some(replaced) = replaced {
            Self::release(replaced).await;
        }
        Ok(SubscriptionHandle { id, key })
    }

    /// Idempotent: a stale handle (superseded by a newer open for the same
    /// pair) is a no-op.
    pub async fn close(&self, handle: SubscriptionHandle) {
        let removed = {
            let mut open = self.open_subscriptions.lock().await;
            match open.get(&handle.key) {
                Some(active) if active.id == handle.id => open.remove(&handle.key),
                _ => None,
            }
        };
        if let Some(active) = removed {
            Self::release(active).await;
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<ActiveSubscription> = {
            let mut open = self.open_subscriptions.lock().await;
            open.drain().map(|(_, active)| active).collect()
        };
        for active in drained {
            Self::release(active).await;
        }
    }

    pub async fn open_count(&self) -> usize {
        self.open_subscriptions.lock().await.len()
    }

    async fn release(active: ActiveSubscription) {
        // Abort the pump first so a deliberate close never reads as a health
        // transition.
        active.pump_task.abort();
        if let Err(err) = active.subscription.close().await {
            warn!(error = %err, "channel subscription close failed");
        }
    }

    fn spawn_pump(
        &self,
        filter: ChannelFilter,
        subscription: Arc<dyn ChannelSubscription>,
        handler: mpsc::UnboundedSender<RowChange>,
    ) -> JoinHandle<()> {
        let mut deliveries = subscription.deliveries();
        let mut status = subscription.status();
        let health = self.health.clone();
        tokio::spawn(async move {
            let mut last_status = *status.borrow();
            loop {
                tokio::select! {
                    delivered = deliveries.recv() => match delivered {
                        Ok(change) => {
                            if handler.send(change).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Dropped deliveries are unrecoverable from the
                            // stream itself; report degradation so the
                            // revalidator refetches.
                            warn!(
                                entity = ?filter.entity,
                                scope_id = filter.scope_id.0,
                                skipped,
                                "delivery backlog overflowed"
                            );
                            let _ = health.send(ChannelHealth {
                                entity: filter.entity,
                                scope_id: filter.scope_id,
                                status: ChannelStatus::ChannelError,
                            });
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow();
                        if current != last_status {
                            last_status = current;
                            let _ = health.send(ChannelHealth {
                                entity: filter.entity,
                                scope_id: filter.scope_id,
                                status: current,
                            });
                        }
                    }
                }
            }
        })
    }
}
