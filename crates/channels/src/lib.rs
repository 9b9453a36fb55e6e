//! Collaborators of the delivery engine: content library, SendGrid delivery,
//! engagement tracking and the recipient directory.

pub mod email;
pub mod engagement;
pub mod recipients;
pub mod templates;

pub use email::{CaptureAdapter, SendGridAdapter};
pub use engagement::{
    ingest_reply, ingest_webhook, EmailEventType, EmailWebhookEvent, EngagementLog, EngagementSummary,
    InboundReply, IngestReport,
};
pub use recipients::RecipientDirectory;
pub use templates::{CatalogItem, ContentLibrary, EmailTemplate};
