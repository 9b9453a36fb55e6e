//! Engagement ingestion endpoint: SendGrid event webhooks and detected
//! replies are written to the same tracker the workers gate on.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use drip_channels::{ingest_reply, ingest_webhook, EmailWebhookEvent, InboundReply, IngestReport};
use drip_core::collaborators::EngagementTracker;
use drip_core::config::WebhookConfig;

#[derive(Clone)]
pub struct WebhookState {
    pub tracker: Arc<dyn EngagementTracker>,
}

#[derive(Debug, Serialize)]
pub struct WebhookError {
    pub error: String,
    pub message: String,
}

type Rejection = (StatusCode, Json<WebhookError>);

// 503 makes SendGrid redeliver the batch later.
fn unavailable(e: drip_core::DripError) -> Rejection {
    error!(error = %e, "Engagement ingestion failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(WebhookError {
            error: "tracker_unavailable".to_string(),
            message: e.to_string(),
        }),
    )
}

/// POST /webhooks/sendgrid
pub async fn handle_sendgrid(
    State(state): State<WebhookState>,
    Json(events): Json<Vec<EmailWebhookEvent>>,
) -> Result<Json<IngestReport>, Rejection> {
    let report = ingest_webhook(state.tracker.as_ref(), &events)
        .await
        .map_err(unavailable)?;
    info!(
        received = report.received,
        recorded = report.recorded,
        ignored = report.ignored,
        "SendGrid webhook batch ingested"
    );
    Ok(Json(report))
}

/// POST /webhooks/replies
pub async fn handle_reply(
    State(state): State<WebhookState>,
    Json(reply): Json<InboundReply>,
) -> Result<StatusCode, Rejection> {
    ingest_reply(state.tracker.as_ref(), &reply)
        .await
        .map_err(unavailable)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn health() -> &'static str {
    "ok"
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/sendgrid", post(handle_sendgrid))
        .route("/webhooks/replies", post(handle_reply))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the ingestion endpoint until `shutdown` flips to `true`.
pub async fn serve(
    config: WebhookConfig,
    state: WebhookState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.host.parse()?, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Webhook endpoint listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drip_channels::{EmailEventType, EngagementLog};
    use drip_core::types::EngagementKind;
    use uuid::Uuid;

    fn state(log: &EngagementLog) -> WebhookState {
        WebhookState {
            tracker: Arc::new(log.clone()),
        }
    }

    fn open_event(message_id: Uuid) -> EmailWebhookEvent {
        EmailWebhookEvent {
            email: "ada@example.com".into(),
            event: EmailEventType::Open,
            sg_message_id: None,
            drip_message_id: Some(message_id.to_string()),
            url: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sendgrid_batch_reaches_tracker() {
        let log = EngagementLog::new();
        let message_id = Uuid::new_v4();

        let Json(report) = handle_sendgrid(State(state(&log)), Json(vec![open_event(message_id)]))
            .await
            .unwrap();

        assert_eq!(report.recorded, 1);
        assert!(log.has_event(message_id, EngagementKind::Opened).await.unwrap());
    }

    #[tokio::test]
    async fn test_reply_reaches_tracker() {
        let log = EngagementLog::new();
        let message_id = Uuid::new_v4();
        let reply = InboundReply {
            message_id,
            received_at: Utc::now(),
        };

        let status = handle_reply(State(state(&log)), Json(reply)).await.unwrap();

        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(log.has_event(message_id, EngagementKind::Replied).await.unwrap());
    }

    #[tokio::test]
    async fn test_tracker_outage_asks_for_redelivery() {
        let log = EngagementLog::new();
        log.set_available(false);

        let Err((status, _)) = handle_sendgrid(State(state(&log)), Json(vec![open_event(Uuid::new_v4())])).await
        else {
            panic!("expected rejection");
        };
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
