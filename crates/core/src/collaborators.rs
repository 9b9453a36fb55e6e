//! Contracts for the systems the delivery engine calls but does not own:
//! content storage, mail transport, engagement tracking and contacts.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DripResult;
use crate::types::{
    ContentRef, EngagementEvent, EngagementKind, OutboundEmail, Recipient, RenderedContent,
};

/// Resolves a step's content reference into a renderable body.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Returns `DripError::ContentNotFound` when the template or catalog
    /// items do not exist.
    async fn resolve(&self, content: &ContentRef, recipient: &Recipient) -> DripResult<RenderedContent>;

    /// Cheap existence check used when a step is planned.
    async fn exists(&self, content: &ContentRef) -> DripResult<bool>;
}

/// Sends one message and returns the transport's message id.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> DripResult<String>;
}

/// Records and answers questions about engagement with delivered messages.
#[async_trait]
pub trait EngagementTracker: Send + Sync {
    async fn record_sent(&self, message_id: Uuid) -> DripResult<()>;

    async fn record(&self, event: EngagementEvent) -> DripResult<()>;

    async fn has_event(&self, message_id: Uuid, kind: EngagementKind) -> DripResult<bool>;

    /// Remembers the transport's id for a delivered message so webhook
    /// events that carry only that id can still be correlated.
    async fn link_transport_id(&self, _transport_id: &str, _message_id: Uuid) -> DripResult<()> {
        Ok(())
    }

    async fn message_for_transport_id(&self, _transport_id: &str) -> DripResult<Option<Uuid>> {
        Ok(None)
    }
}

/// Read-only access to recipients and recipient lists.
#[async_trait]
pub trait RecipientStore: Send + Sync {
    async fn resolve(&self, recipient_id: &str) -> DripResult<Recipient>;

    async fn list_members(&self, list_id: &str) -> DripResult<Vec<String>>;
}
