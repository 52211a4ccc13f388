use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{EntityKind, ScopeId};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::{info, warn};

use crate::subscriptions::ChannelHealth;

/// A view that can correct its own drift with a full refetch.
#[async_trait]
pub trait Revalidate: Send + Sync {
    async fn revalidate(&self) -> Result<()>;
}

/// Which channel degradations concern a registered target.
#[derive(Debug, Clone)]
pub struct Interest {
    pub entities: Vec<EntityKind>,
    pub scope_id: Option<ScopeId>,
}

impl Interest {
    pub fn conversation(scope_id: ScopeId) -> Self {
        Self {
            entities: vec![EntityKind::Message],
            scope_id: Some(scope_id),
        }
    }

    pub fn summaries() -> Self {
        Self {
            entities: vec![EntityKind::Notification, EntityKind::Approval],
            scope_id: None,
        }
    }

    fn matches(&self, health: &ChannelHealth) -> bool {
        self.entities.contains(&health.entity)
            && self.scope_id.is_none_or(|scope_id| scope_id == health.scope_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u64);

pub struct Registration {
    revalidator: Arc<Revalidator>,
    id: TargetId,
}

impl Registration {
    pub async fn release(self) {
        self.revalidator.unregister(self.id).await;
    }
}

struct RegisteredTarget {
    id: TargetId,
    interest: Interest,
    target: Arc<dyn Revalidate>,
}

struct RevalidatorState {
    targets: Vec<RegisteredTarget>,
    next_id: u64,
}

/// Liveness backstop for missed push events: one revalidation pass per
/// trigger (foreground transition or channel degradation), never a retry
/// loop.
pub struct Revalidator {
    inner: Mutex<RevalidatorState>,
    visibility: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Revalidator {
    pub fn spawn(health: broadcast::Receiver<ChannelHealth>) -> Arc<Self> {
        // Hosts start in the foreground; the first trigger is the first
        // background-to-foreground edge after that.
        let (visibility, visibility_rx) = watch::channel(true);
        let revalidator = Arc::new(Self {
            inner: Mutex::new(RevalidatorState {
                targets: Vec::new(),
                next_id: 1,
            }),
            visibility,
            tasks: StdMutex::new(Vec::new()),
        });

        let health_task = tokio::spawn(Arc::clone(&revalidator).watch_channel_health(health));
        let visibility_task = tokio::spawn(Arc::clone(&revalidator).watch_visibility(visibility_rx));
        if let Ok(mut tasks) = revalidator.tasks.lock() {
            tasks.extend([health_task, visibility_task]);
        }
        revalidator
    }

    pub async fn register(&self, interest: Interest, target: Arc<dyn Revalidate>) -> TargetId {
        let mut inner = self.inner.lock().await;
        let id = TargetId(inner.next_id);
        inner.next_id += 1;
        inner.targets.push(RegisteredTarget {
            id,
            interest,
            target,
        });
        id
    }

    pub async fn unregister(&self, id: TargetId) {
        let mut inner = self.inner.lock().await;
        inner.targets.retain(|registered| registered.id != id);
    }

    pub fn registration(self: &Arc<Self>, id: TargetId) -> Registration {
        Registration {
            revalidator: Arc::clone(self),
            id,
        }
    }

    pub fn set_visibility(&self, visible: bool) {
        let _ = self.visibility.send(visible);
    }

    pub fn shutdown(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    async fn watch_channel_health(
        self: Arc<Self>,
        health: broadcast::Receiver<ChannelHealth>,
    ) {
        let mut transitions = BroadcastStream::new(health);
        while let Some(event) = transitions.next().await {
            match event {
                Ok(health) if health.status.is_degraded() => {
                    info!(
                        entity = ?health.entity,
                        scope_id = health.scope_id.0,
                        status = ?health.status,
                        "channel degraded; revalidating dependents"
                    );
                    self.trigger(Some(health)).await;
                }
                Ok(_) => {}
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed channel health transitions; revalidating everything");
                    self.trigger(None).await;
                }
            }
        }
    }

    async fn watch_visibility(self: Arc<Self>, mut visibility: watch::Receiver<bool>) {
        let mut was_visible = *visibility.borrow();
        while visibility.changed().await.is_ok() {
            let visible = *visibility.borrow();
            if visible && !was_visible {
                info!("host view returned to foreground; revalidating");
                self.trigger(None).await;
            }
            was_visible = visible;
        }
    }

    /// One revalidation per matching target per trigger. Failures are logged
    /// and left for the next trigger; this path never retries.
    async fn trigger(&self, cause: Option<ChannelHealth>) {
        let targets: Vec<(TargetId, Arc<dyn Revalidate>)> = {
            let inner = self.inner.lock().await;
            inner
                .targets
                .iter()
                .filter(|registered| {
                    cause
                        .as_ref()
                        .is_none_or(|health| registered.interest.matches(health))
                })
                .map(|registered| (registered.id, Arc::clone(&registered.target)))
                .collect()
        };
        for (id, target) in targets {
            if let Err(err) = target.revalidate().await {
                warn!(target_id = id.0, error = %err, "revalidation failed");
            }
        }
    }
}
