#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use drip_channels::{CaptureAdapter, ContentLibrary, EmailTemplate, EngagementLog, RecipientDirectory};
use drip_core::config::WorkerConfig;
use drip_core::event_bus::{capture_sink, CaptureSink};
use drip_core::types::{
    Campaign, CampaignStats, CampaignStatus, ContentRef, GatingConditions, Recipient, RecipientSet,
    SendType, SenderConfig, SequenceDefinition, StepSpec,
};
use drip_sequence::{Collaborators, Scheduler};
use drip_store::MemoryStore;

pub struct World {
    pub store: Arc<MemoryStore>,
    pub library: ContentLibrary,
    pub directory: RecipientDirectory,
    pub adapter: Arc<CaptureAdapter>,
    pub engagement: EngagementLog,
    pub events: Arc<CaptureSink>,
}

impl World {
    pub fn new(templates: &[&str], recipients: &[&str]) -> Self {
        let library = ContentLibrary::new();
        for id in templates {
            library.add_template(EmailTemplate {
                id: id.to_string(),
                name: id.to_string(),
                subject: format!("{id} subject"),
                html: format!("<p>Hi {{{{recipient.first_name}}}}, {id}</p>"),
                text: String::new(),
                attachments: vec![],
            });
        }
        let directory = RecipientDirectory::new();
        for id in recipients {
            directory.upsert(Recipient {
                id: id.to_string(),
                email: format!("{id}@example.com"),
                profile: HashMap::from([("first_name".to_string(), id.to_string())]),
            });
        }
        Self {
            store: Arc::new(MemoryStore::new()),
            library,
            directory,
            adapter: Arc::new(CaptureAdapter::new()),
            engagement: EngagementLog::new(),
            events: capture_sink(),
        }
    }

    pub fn scheduler(&self, worker_id: &str) -> Arc<Scheduler> {
        let collaborators = Collaborators {
            content: Arc::new(self.library.clone()),
            delivery: self.adapter.clone(),
            engagement: Arc::new(self.engagement.clone()),
            recipients: Arc::new(self.directory.clone()),
        };
        Arc::new(Scheduler::new(
            self.store.clone(),
            worker_id,
            WorkerConfig::default(),
            collaborators,
            self.events.clone(),
        ))
    }
}

pub fn step(template_id: &str, delay_hours: u32, conditions: GatingConditions) -> StepSpec {
    StepSpec {
        content: ContentRef::Template {
            template_id: template_id.to_string(),
        },
        delay_hours,
        conditions,
    }
}

pub fn require_open() -> GatingConditions {
    GatingConditions {
        require_open: true,
        ..Default::default()
    }
}

pub fn campaign(steps: Vec<StepSpec>, repeat_days: u32, recipients: &[&str]) -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        owner_id: "owner-1".into(),
        name: "Spring drip".into(),
        recipients: RecipientSet {
            recipient_ids: recipients.iter().map(|r| r.to_string()).collect(),
            list_ids: vec![],
        },
        send_type: SendType::Sequence,
        content: None,
        sequence: Some(SequenceDefinition {
            steps,
            repeat_days,
            max_cycles: None,
        }),
        sender: SenderConfig {
            from_email: "hello@shop.example.com".into(),
            from_name: "Shop".into(),
            reply_to: None,
        },
        status: CampaignStatus::Scheduled,
        scheduled_at: None,
        claimed_by: None,
        claim_expires_at: None,
        stats: CampaignStats::default(),
        created_at: now,
        updated_at: now,
    }
}
