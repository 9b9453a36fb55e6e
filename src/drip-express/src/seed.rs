//! JSON seed fixtures for local runs: templates, catalog items, recipients,
//! recipient lists and campaigns loaded into the in-process collaborators.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use drip_channels::{CatalogItem, ContentLibrary, EmailTemplate, RecipientDirectory};
use drip_core::types::{
    Campaign, CampaignStats, CampaignStatus, ContentRef, Recipient, RecipientSet, SendType,
    SenderConfig, SequenceDefinition,
};
use drip_store::DripStore;

#[derive(Debug, Default, Deserialize)]
pub struct SeedFixture {
    #[serde(default)]
    pub templates: Vec<EmailTemplate>,
    #[serde(default)]
    pub catalog: Vec<CatalogItem>,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub lists: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub campaigns: Vec<SeedCampaign>,
}

/// Campaign as written in a fixture. Bookkeeping fields are filled in on load.
#[derive(Debug, Deserialize)]
pub struct SeedCampaign {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default = "default_owner")]
    pub owner_id: String,
    pub name: String,
    pub recipients: RecipientSet,
    pub send_type: SendType,
    #[serde(default)]
    pub content: Option<ContentRef>,
    #[serde(default)]
    pub sequence: Option<SequenceDefinition>,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_owner() -> String {
    "seed".to_string()
}

impl SeedCampaign {
    pub fn into_campaign(self, now: DateTime<Utc>) -> Campaign {
        Campaign {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            owner_id: self.owner_id,
            name: self.name,
            recipients: self.recipients,
            send_type: self.send_type,
            content: self.content,
            sequence: self.sequence,
            sender: self.sender,
            status: CampaignStatus::Scheduled,
            scheduled_at: self.scheduled_at,
            claimed_by: None,
            claim_expires_at: None,
            stats: CampaignStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SeedFixture {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed fixture {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing seed fixture {}", path.display()))
    }

    /// Registers content and recipients, then stores each campaign as
    /// `scheduled` so the initial-sends poller picks it up.
    pub async fn apply(
        self,
        library: &ContentLibrary,
        directory: &RecipientDirectory,
        store: &dyn DripStore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Uuid>> {
        let templates = self.templates.len();
        for template in self.templates {
            library.add_template(template);
        }
        for item in self.catalog {
            library.add_catalog_item(item);
        }
        let recipients = self.recipients.len();
        for recipient in self.recipients {
            directory.upsert(recipient);
        }
        for (list_id, members) in self.lists {
            directory.set_list(list_id, members);
        }

        let mut ids = Vec::with_capacity(self.campaigns.len());
        for seed in self.campaigns {
            let campaign = seed.into_campaign(now);
            ids.push(campaign.id);
            store.put_campaign(campaign).await?;
        }

        info!(templates, recipients, campaigns = ids.len(), "Seed fixture applied");
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drip_store::MemoryStore;

    const FIXTURE: &str = r#"{
        "templates": [
            {"id": "welcome", "name": "Welcome", "subject": "Hi {{recipient.first_name}}", "html": "<p>Welcome</p>"}
        ],
        "recipients": [
            {"id": "r-1", "email": "ada@example.com", "profile": {"first_name": "Ada"}}
        ],
        "lists": {"early-access": ["r-1"]},
        "campaigns": [
            {
                "name": "Onboarding",
                "recipients": {"list_ids": ["early-access"]},
                "send_type": "sequence",
                "sequence": {
                    "steps": [{"content": {"kind": "template", "template_id": "welcome"}, "delay_hours": 0}],
                    "repeat_days": 0
                }
            }
        ]
    }"#;

    #[tokio::test]
    async fn test_fixture_populates_collaborators_and_store() {
        let fixture: SeedFixture = serde_json::from_str(FIXTURE).unwrap();
        let library = ContentLibrary::new();
        let directory = RecipientDirectory::new();
        let store = MemoryStore::new();

        let ids = fixture
            .apply(&library, &directory, &store, Utc::now())
            .await
            .unwrap();

        assert_eq!(ids.len(), 1);
        assert_eq!(library.template_count(), 1);
        assert_eq!(directory.len(), 1);
        let campaign = store.get_campaign(ids[0]).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Scheduled);
        assert_eq!(campaign.owner_id, "seed");
    }
}
