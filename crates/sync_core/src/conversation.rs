use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{EntityKind, MessageId, MessageStatus, ScopeId, UserId},
    protocol::{ChannelFilter, ChannelRow, CreateMessageRequest, EventClass, Message, RowChange},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{ApiFailure, SyncError},
    revalidate::{Registration, Revalidate},
    subscriptions::{SubscriptionHandle, SubscriptionManager},
    transport::BackendApi,
    Session, SyncConfig, SyncEvent,
};

/// One rendered line of the conversation: either a server-confirmed message
/// or a local optimistic entry awaiting its confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub local_id: Uuid,
    pub message_id: Option<MessageId>,
    pub scope_id: ScopeId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub status: MessageStatus,
}

impl MessageEntry {
    fn confirmed(message: Message) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            message_id: Some(message.message_id),
            scope_id: message.scope_id,
            sender_id: message.sender_id,
            content: message.content,
            sent_at: message.sent_at,
            status: MessageStatus::Confirmed,
        }
    }

    fn pending(scope_id: ScopeId, sender_id: UserId, content: String) -> Self {
        Self {
            local_id: Uuid::new_v4(),
            message_id: None,
            scope_id,
            sender_id,
            content,
            sent_at: Utc::now(),
            status: MessageStatus::Pending,
        }
    }
}

struct ConversationState {
    entries: Vec<MessageEntry>,
    draft: String,
    send_in_flight: bool,
    subscription: Option<SubscriptionHandle>,
    closed: bool,
}

/// Exclusive owner of one scope's message list. Injects optimistic entries on
/// send and reconciles them against whichever confirmation arrives first: the
/// create response or the channel echo.
pub struct Conversation {
    scope_id: ScopeId,
    session: Session,
    config: SyncConfig,
    backend: Arc<dyn BackendApi>,
    subscriptions: Arc<SubscriptionManager>,
    events: broadcast::Sender<SyncEvent>,
    inner: Mutex<ConversationState>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<Registration>>,
}

impl Conversation {
    pub(crate) async fn open(
        scope_id: ScopeId,
        session: Session,
        config: SyncConfig,
        backend: Arc<dyn BackendApi>,
        subscriptions: Arc<SubscriptionManager>,
        events: broadcast::Sender<SyncEvent>,
    ) -> Result<Arc<Self>> {
        let conversation = Arc::new(Self {
            scope_id,
            session,
            config,
            backend,
            subscriptions: Arc::clone(&subscriptions),
            events,
            inner: Mutex::new(ConversationState {
                entries: Vec::new(),
                draft: String::new(),
                send_in_flight: false,
                subscription: None,
                closed: false,
            }),
            pump_task: Mutex::new(None),
            registration: Mutex::new(None),
        });

        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let handle = subscriptions
            .open(
                ChannelFilter {
                    entity: EntityKind::Message,
                    scope_id,
                    class: EventClass::Any,
                },
                delivery_tx,
            )
            .await?;
        conversation.inner.lock().await.subscription = Some(handle);
        *conversation.pump_task.lock().await =
            Some(conversation.spawn_delivery_pump(delivery_rx));

        // The initial load is the primary read; its failure is the caller's
        // to surface and retry, and must not leak the subscription.
        if let Err(err) = conversation.refetch().await {
            conversation.close().await;
            return Err(err.into());
        }

        info!(scope_id = scope_id.0, "conversation opened");
        Ok(conversation)
    }

    pub fn scope_id(&self) -> ScopeId {
        self.scope_id
    }

    pub async fn messages(&self) -> Vec<MessageEntry> {
        self.inner.lock().await.entries.clone()
    }

    pub async fn draft(&self) -> String {
        self.inner.lock().await.draft.clone()
    }

    pub async fn set_draft(&self, text: impl Into<String>) {
        self.inner.lock().await.draft = text.into();
    }

    /// Indices of entries that open a new calendar day, for date-boundary
    /// markers in the rendered list.
    pub async fn day_boundaries(&self) -> Vec<usize> {
        let inner = self.inner.lock().await;
        let mut boundaries = Vec::new();
        for (index, entry) in inner.entries.iter().enumerate() {
            let previous = index.checked_sub(1).and_then(|prev| inner.entries.get(prev));
            if starts_new_day(previous, entry) {
                boundaries.push(index);
            }
        }
        boundaries
    }

    /// Sends the current draft. Empty-after-trim drafts and sends issued
    /// while another is in flight are silent no-ops.
    pub async fn send(&self) -> Result<(), SyncError> {
        let (content, local_id) = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(SyncError::Closed);
            }
            if inner.send_in_flight {
                return Ok(());
            }
            let content = inner.draft.trim().to_string();
            if content.is_empty() {
                return Ok(());
            }
            inner.send_in_flight = true;
            inner.draft.clear();
            let entry = MessageEntry::pending(self.scope_id, self.session.viewer_id, content.clone());
            let local_id = entry.local_id;
            inner.entries.push(entry);
            (content, local_id)
        };
        let _ = self.events.send(SyncEvent::MessageListChanged {
            scope_id: self.scope_id,
        });

        let request = CreateMessageRequest {
            scope_id: self.scope_id,
            content: content.clone(),
        };
        let outcome =
            match tokio::time::timeout(self.config.send_timeout, self.backend.create_message(request))
                .await
            {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(failure)) => Err(SyncError::Network(failure)),
                Err(_elapsed) => Err(SyncError::Network(ApiFailure::Transport(format!(
                    "send timed out after {:?}",
                    self.config.send_timeout
                )))),
            };

        match outcome {
            Ok(message) => {
                self.confirm_send(local_id, message).await;
                Ok(())
            }
            Err(err) => {
                self.rollback_send(local_id, content).await;
                warn!(scope_id = self.scope_id.0, error = %err, "message send failed; rolled back");
                Err(err)
            }
        }
    }

    /// Full refetch of the confirmed list; optimistic entries that are not
    /// covered by the fetched rows survive at the tail.
    pub async fn refetch(&self) -> Result<(), SyncError> {
        let fetched = self.backend.fetch_messages(self.scope_id).await?;
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                // View torn down while the fetch was in flight.
                return Ok(());
            }
            let pending: Vec<MessageEntry> = inner
                .entries
                .iter()
                .filter(|entry| entry.status == MessageStatus::Pending)
                .filter(|entry| {
                    !fetched
                        .iter()
                        .any(|message| echo_matches(entry, message, self.config.echo_match_window))
                })
                .cloned()
                .collect();
            inner.entries = fetched
                .into_iter()
                .filter(|message| message.scope_id == self.scope_id)
                .map(MessageEntry::confirmed)
                .collect();
            inner.entries.extend(pending);
        }
        let _ = self.events.send(SyncEvent::MessageListChanged {
            scope_id: self.scope_id,
        });
        Ok(())
    }

    /// Closes the channel subscription before the hosting view unmounts.
    /// Idempotent; always leaves zero open subscriptions behind.
    pub async fn close(&self) {
        let handle = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.subscription.take()
        };
        if let Some(handle) = handle {
            self.subscriptions.close(handle).await;
        }
        if let Some(task) = self.pump_task.lock().await.take() {
            task.abort();
        }
        if let Some(registration) = self.registration.lock().await.take() {
            registration.release().await;
        }
        info!(scope_id = self.scope_id.0, "conversation closed");
    }

    pub(crate) async fn attach_registration(&self, registration: Registration) {
        *self.registration.lock().await = Some(registration);
    }

    fn spawn_delivery_pump(
        self: &Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<RowChange>,
    ) -> JoinHandle<()> {
        let conversation = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(change) = deliveries.recv().await {
                conversation.apply_change(change).await;
            }
        })
    }

    async fn apply_change(&self, change: RowChange) {
        let ChannelRow::Messages(message) = change.row else {
            warn!(
                scope_id = self.scope_id.0,
                entity = ?change.row.entity(),
                "conversation received non-message row"
            );
            return;
        };
        if message.scope_id != self.scope_id {
            // Stale delivery for a scope this view no longer owns.
            return;
        }

        let changed = match change.class {
            EventClass::Insert | EventClass::Any => self.merge_confirmed(message).await,
            EventClass::Update => self.update_confirmed(message).await,
            EventClass::Delete => self.remove_confirmed(message.message_id).await,
        };
        if changed {
            let _ = self.events.send(SyncEvent::MessageListChanged {
                scope_id: self.scope_id,
            });
        }
    }

    /// Dual-race merge: a confirmed row either replaces its optimistic echo
    /// in place, or appends as a new message if no pending entry matches.
    /// Duplicate deliveries of an already-known id are dropped.
    async fn merge_confirmed(&self, message: Message) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        if inner
            .entries
            .iter()
            .any(|entry| entry.message_id == Some(message.message_id))
        {
            return false;
        }
        if message.sender_id == self.session.viewer_id {
            if let Some(position) = inner
                .entries
                .iter()
                .position(|entry| echo_matches(entry, &message, self.config.echo_match_window))
            {
                inner.entries[position] = MessageEntry::confirmed(message);
                return true;
            }
        }
        inner.entries.push(MessageEntry::confirmed(message));
        true
    }

    async fn update_confirmed(&self, message: Message) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        match inner
            .entries
            .iter()
            .position(|entry| entry.message_id == Some(message.message_id))
        {
            Some(position) => {
                inner.entries[position] = MessageEntry::confirmed(message);
                true
            }
            None => false,
        }
    }

    async fn remove_confirmed(&self, message_id: MessageId) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return false;
        }
        let before = inner.entries.len();
        inner
            .entries
            .retain(|entry| entry.message_id != Some(message_id));
        inner.entries.len() != before
    }

    async fn confirm_send(&self, local_id: Uuid, message: Message) {
        {
            let mut inner = self.inner.lock().await;
            inner.send_in_flight = false;
            if inner.closed {
                return;
            }
            let pending_position = inner
                .entries
                .iter()
                .position(|entry| entry.local_id == local_id && entry.status == MessageStatus::Pending);
            let already_known = inner
                .entries
                .iter()
                .any(|entry| entry.message_id == Some(message.message_id));
            match pending_position {
                Some(position) if already_known => {
                    // The channel echo landed first under another entry;
                    // only the leftover optimistic line remains to clean up.
                    inner.entries.remove(position);
                }
                Some(position) => {
                    inner.entries[position] = MessageEntry::confirmed(message);
                }
                None if already_known => {}
                None => {
                    inner.entries.push(MessageEntry::confirmed(message));
                }
            }
        }
        let _ = self.events.send(SyncEvent::MessageListChanged {
            scope_id: self.scope_id,
        });
    }

    /// Local rollback only: the optimistic entry disappears and the attempted
    /// content returns to the draft so the user can retry.
    async fn rollback_send(&self, local_id: Uuid, content: String) {
        {
            let mut inner = self.inner.lock().await;
            inner.send_in_flight = false;
            if inner.closed {
                return;
            }
            inner.entries.retain(|entry| entry.local_id != local_id);
            inner.draft = content.clone();
        }
        let _ = self.events.send(SyncEvent::MessageListChanged {
            scope_id: self.scope_id,
        });
        let _ = self.events.send(SyncEvent::MessageSendFailed {
            scope_id: self.scope_id,
            restored_draft: content,
        });
    }
}

#[async_trait]
impl Revalidate for Conversation {
    async fn revalidate(&self) -> Result<()> {
        self.refetch().await?;
        Ok(())
    }
}

/// The channel payload carries no local id, so an echo is recognized by
/// sender and content equality, and only within the configured window of the
/// optimistic timestamp. A repeated identical message sent much later must
/// not be misattributed as the confirmation.
fn echo_matches(entry: &MessageEntry, message: &Message, window: Duration) -> bool {
    entry.status == MessageStatus::Pending
        && entry.sender_id == message.sender_id
        && entry.content == message.content.trim()
        && within_window(entry.sent_at, message.sent_at, window)
}

fn within_window(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (b - a).num_milliseconds().unsigned_abs() as u128 <= window.as_millis()
}

fn starts_new_day(previous: Option<&MessageEntry>, entry: &MessageEntry) -> bool {
    match previous {
        None => true,
        Some(previous) => previous.sent_at.date_naive() != entry.sent_at.date_naive(),
    }
}
