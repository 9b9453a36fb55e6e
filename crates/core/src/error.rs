use thiserror::Error;
use uuid::Uuid;

pub type DripResult<T> = Result<T, DripError>;

#[derive(Error, Debug)]
pub enum DripError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Invalid content: {0}")]
    InvalidContent(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),

    #[error("Step record not found: {0}")]
    StepNotFound(Uuid),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Engagement tracker error: {0}")]
    Engagement(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Lease on {0} is no longer held by this worker")]
    LeaseLost(Uuid),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DripError {
    /// Errors that belong to a single step's content or recipient and must
    /// not affect sibling steps.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            DripError::ContentNotFound(_)
                | DripError::InvalidContent(_)
                | DripError::RecipientNotFound(_)
        )
    }
}
