use std::{sync::Arc, time::Duration};

use anyhow::Result;
use shared::domain::{ScopeId, UserId};
use tokio::sync::broadcast;
use tracing::info;

pub mod channel;
pub mod conversation;
pub mod error;
pub mod revalidate;
pub mod subscriptions;
pub mod summaries;
pub mod transport;

pub use channel::{ChannelFactory, ChannelSubscription, MissingChannelFactory, WsChannelFactory};
pub use conversation::{Conversation, MessageEntry};
pub use error::{ApiFailure, SyncError};
pub use revalidate::{Interest, Revalidate, Revalidator};
pub use subscriptions::{ChannelHealth, SubscriptionManager};
pub use summaries::{fold_summaries, SummaryBoard};
pub use transport::{BackendApi, HttpBackend, MissingBackend, IDENTITY_TOKEN_HEADER};

const EVENT_BUFFER: usize = 1024;

/// Externally-owned authenticated session context. Injected into every
/// component; never re-instantiated or held as a module global.
#[derive(Debug, Clone)]
pub struct Session {
    pub viewer_id: UserId,
    pub identity_token: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Bounded wait on the create request; expiry takes the same rollback
    /// path as an explicit failure.
    pub send_timeout: Duration,
    /// How far apart an optimistic entry and its channel echo may be and
    /// still count as the same message.
    pub echo_match_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            echo_match_window: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    MessageListChanged {
        scope_id: ScopeId,
    },
    MessageSendFailed {
        scope_id: ScopeId,
        restored_draft: String,
    },
    SummariesChanged,
    Error(String),
}

/// Root of the synchronization engine: owns the subscription manager, the
/// fallback revalidator, and the event bus, and opens the per-view
/// components against injected backend and channel collaborators.
pub struct SyncClient {
    session: Session,
    config: SyncConfig,
    backend: Arc<dyn BackendApi>,
    subscriptions: Arc<SubscriptionManager>,
    revalidator: Arc<Revalidator>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn connect(server_url: &str, session: Session) -> Arc<Self> {
        let backend = Arc::new(HttpBackend::new(server_url, session.identity_token.clone()));
        let channels = Arc::new(WsChannelFactory::new(
            server_url,
            session.identity_token.clone(),
        ));
        Self::new_with_dependencies(session, SyncConfig::default(), backend, channels)
    }

    pub fn new_with_dependencies(
        session: Session,
        config: SyncConfig,
        backend: Arc<dyn BackendApi>,
        channels: Arc<dyn ChannelFactory>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let subscriptions = Arc::new(SubscriptionManager::new(channels));
        let revalidator = Revalidator::spawn(subscriptions.health_events());
        Arc::new(Self {
            session,
            config,
            backend,
            subscriptions,
            revalidator,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn viewer_id(&self) -> UserId {
        self.session.viewer_id
    }

    /// Opens the single active conversation view for one scope.
    pub async fn open_conversation(&self, scope_id: ScopeId) -> Result<Arc<Conversation>> {
        let conversation = Conversation::open(
            scope_id,
            self.session.clone(),
            self.config,
            Arc::clone(&self.backend),
            Arc::clone(&self.subscriptions),
            self.events.clone(),
        )
        .await?;
        let id = self
            .revalidator
            .register(
                Interest::conversation(scope_id),
                Arc::clone(&conversation) as Arc<dyn Revalidate>,
            )
            .await;
        conversation
            .attach_registration(self.revalidator.registration(id))
            .await;
        Ok(conversation)
    }

    /// Opens the derived summary board over a set of rendered scopes.
    pub async fn open_summary_board(&self, scope_ids: Vec<ScopeId>) -> Result<Arc<SummaryBoard>> {
        let board = SummaryBoard::open(
            scope_ids,
            self.session.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.subscriptions),
            self.events.clone(),
        )
        .await?;
        let id = self
            .revalidator
            .register(
                Interest::summaries(),
                Arc::clone(&board) as Arc<dyn Revalidate>,
            )
            .await;
        board
            .attach_registration(self.revalidator.registration(id))
            .await;
        Ok(board)
    }

    /// Host visibility feed for the fallback revalidator; a transition back
    /// to the foreground triggers one revalidation pass.
    pub fn set_visibility(&self, visible: bool) {
        self.revalidator.set_visibility(visible);
    }

    pub async fn open_subscription_count(&self) -> usize {
        self.subscriptions.open_count().await
    }

    pub async fn shutdown(&self) {
        self.subscriptions.close_all().await;
        self.revalidator.shutdown();
        info!("sync client shut down");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
