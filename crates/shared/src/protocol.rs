use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ApprovalId, ApprovalStatus, EntityKind, MessageId, NotificationId, NotificationKind, ScopeId,
    UserId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub scope_id: ScopeId,
    pub sender_id: UserId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub notification_id: NotificationId,
    pub scope_id: ScopeId,
    pub recipient_id: UserId,
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: ApprovalId,
    pub scope_id: ScopeId,
    pub approver_id: UserId,
    pub proposer_id: UserId,
    pub entity_type: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
}

/// Derived per-scope counters. Never persisted; always the result of a fresh
/// fold over the underlying notification and approval rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub scope_id: ScopeId,
    pub unread_updates: u32,
    pub pending_approvals: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    Insert,
    Update,
    Delete,
    Any,
}

/// Subscribe-by-filter key: one live subscription per (entity, scope) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub entity: EntityKind,
    pub scope_id: ScopeId,
    pub class: EventClass,
}

/// Row payload delivered by the channel, decoded into its entity variant at
/// the subscription boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum ChannelRow {
    Messages(Message),
    Notifications(NotificationEvent),
    Approvals(ApprovalRequest),
}

impl ChannelRow {
    pub fn entity(&self) -> EntityKind {
        match self {
            ChannelRow::Messages(_) => EntityKind::Message,
            ChannelRow::Notifications(_) => EntityKind::Notification,
            ChannelRow::Approvals(_) => EntityKind::Approval,
        }
    }

    pub fn scope_id(&self) -> ScopeId {
        match self {
            ChannelRow::Messages(message) => message.scope_id,
            ChannelRow::Notifications(notification) => notification.scope_id,
            ChannelRow::Approvals(approval) => approval.scope_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub class: EventClass,
    pub row: ChannelRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    /// Anything other than `Subscribed` means pushed events can no longer be
    /// trusted and a fallback revalidation is due.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        subscription_id: u64,
        filter: ChannelFilter,
    },
    Unsubscribe {
        subscription_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Delivery {
        subscription_id: u64,
        change: RowChange,
    },
    SubscriptionStatus {
        subscription_id: u64,
        status: ChannelStatus,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    pub scope_id: ScopeId,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum MarkReadRequest {
    Notification {
        notification_id: NotificationId,
        scope_id: ScopeId,
    },
    Scope {
        scope_id: ScopeId,
    },
}

impl MarkReadRequest {
    pub fn scope_id(&self) -> ScopeId {
        match self {
            MarkReadRequest::Notification { scope_id, .. } => *scope_id,
            MarkReadRequest::Scope { scope_id } => *scope_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResolveApprovalRequest {
    pub decision: ApprovalDecision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageId, NotificationId};

    #[test]
    fn channel_row_decodes_by_table_tag() {
        let raw = r#"{
            "table": "messages",
            "row": {
                "message_id": 41,
                "scope_id": 9,
                "sender_id": 3,
                "content": "hi",
                "sent_at": "2026-02-01T10:00:00Z"
            }
        }"#;
        let row: ChannelRow = serde_json::from_str(raw).expect("decode");
        assert_eq!(row.entity(), EntityKind::Message);
        assert_eq!(row.scope_id(), ScopeId(9));
        match row {
            ChannelRow::Messages(message) => assert_eq!(message.message_id, MessageId(41)),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn notification_row_defaults_read_at_to_unread() {
        let raw = r#"{
            "table": "notifications",
            "row": {
                "notification_id": 5,
                "scope_id": 2,
                "recipient_id": 7,
                "kind": "approval_completed",
                "created_at": "2026-02-01T10:00:00Z"
            }
        }"#;
        let row: ChannelRow = serde_json::from_str(raw).expect("decode");
        match row {
            ChannelRow::Notifications(notification) => {
                assert_eq!(notification.notification_id, NotificationId(5));
                assert!(notification.read_at.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn server_frame_round_trips_delivery() {
        let frame = ServerFrame::Delivery {
            subscription_id: 12,
            change: RowChange {
                class: EventClass::Insert,
                row: ChannelRow::Approvals(ApprovalRequest {
                    approval_id: ApprovalId(1),
                    scope_id: ScopeId(4),
                    approver_id: UserId(2),
                    proposer_id: UserId(8),
                    entity_type: "session_plan".to_string(),
                    status: ApprovalStatus::Pending,
                    created_at: "2026-02-01T10:00:00Z".parse().expect("timestamp"),
                }),
            },
        };
        let encoded = serde_json::to_string(&frame).expect("encode");
        let decoded: ServerFrame = serde_json::from_str(&encoded).expect("decode");
        match decoded {
            ServerFrame::Delivery {
                subscription_id,
                change,
            } => {
                assert_eq!(subscription_id, 12);
                assert_eq!(change.row.entity(), EntityKind::Approval);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
