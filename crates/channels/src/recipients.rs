use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use drip_core::collaborators::RecipientStore;
use drip_core::types::Recipient;
use drip_core::{DripError, DripResult};

/// In-memory recipients and recipient lists.
#[derive(Clone, Default)]
pub struct RecipientDirectory {
    recipients: Arc<DashMap<String, Recipient>>,
    lists: Arc<DashMap<String, Vec<String>>>,
}

impl RecipientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, recipient: Recipient) {
        self.recipients.insert(recipient.id.clone(), recipient);
    }

    pub fn remove(&self, recipient_id: &str) -> Option<Recipient> {
        self.recipients.remove(recipient_id).map(|(_, r)| r)
    }

    pub fn set_list(&self, list_id: impl Into<String>, members: Vec<String>) {
        self.lists.insert(list_id.into(), members);
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

#[async_trait]
impl RecipientStore for RecipientDirectory {
    async fn resolve(&self, recipient_id: &str) -> DripResult<Recipient> {
        self.recipients
            .get(recipient_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| DripError::RecipientNotFound(recipient_id.to_string()))
    }

    async fn list_members(&self, list_id: &str) -> DripResult<Vec<String>> {
        self.lists
            .get(list_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| DripError::RecipientNotFound(format!("list {list_id}")))
    }
}
