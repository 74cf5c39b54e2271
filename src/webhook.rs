use crate::types::PendingEvent;
use crate::verification;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

pub const WEBHOOK_ROUTE: &str = "/hooks/{instance_id}/webhook";
const FALLBACK_EVENT_TYPE: &str = "eventsub.notification";

/// Trigger instances the server accepts deliveries for. Shared between the
/// host operations, which add and remove ids, and the HTTP handler.
pub type ActiveInstances = Arc<RwLock<HashSet<String>>>;

/// An inbound POST body, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Ownership check sent after a subscription is created.
    Challenge(String),
    Notification(Value),
}

#[derive(Deserialize)]
struct ChallengeBody {
    challenge: String,
}

impl InboundMessage {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_slice(body)?;
        match ChallengeBody::deserialize(&value) {
            Ok(ChallengeBody { challenge }) if !challenge.is_empty() => Ok(Self::Challenge(challenge)),
            _ => Ok(Self::Notification(value)),
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    event_tx: mpsc::UnboundedSender<PendingEvent>,
    instances: ActiveInstances,
    /// Set only when delivery signatures are checked.
    signing_secret: Option<String>,
}

impl ServerState {
    pub fn new(
        event_tx: mpsc::UnboundedSender<PendingEvent>,
        instances: ActiveInstances,
        signing_secret: Option<String>,
    ) -> Self {
        Self {
            event_tx,
            instances,
            signing_secret,
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(WEBHOOK_ROUTE, post(handle_webhook))
        .with_state(state)
}

/// Bind the Axum server and return the bound address and a channel receiver
/// for incoming event deliveries.
pub async fn start(
    bind_addr: &str,
    instances: ActiveInstances,
    signing_secret: Option<String>,
) -> Result<(SocketAddr, mpsc::UnboundedReceiver<PendingEvent>), std::io::Error> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let app = router(ServerState::new(event_tx, instances, signing_secret));

    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "webhook server bound");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "webhook server stopped");
        }
    });

    Ok((addr, event_rx))
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

async fn handle_webhook(
    Path(instance_id): Path<String>,
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.instances.read().await.contains(&instance_id) {
        debug!(%instance_id, "delivery for unknown trigger instance");
        return StatusCode::NOT_FOUND.into_response();
    }

    if let Some(secret) = state.signing_secret.as_deref() {
        let verified = verification::verify_eventsub_signature(
            secret,
            header_str(&headers, verification::HEADER_MESSAGE_ID),
            header_str(&headers, verification::HEADER_TIMESTAMP),
            &body,
            header_str(&headers, verification::HEADER_SIGNATURE),
        );
        if !verified {
            warn!(%instance_id, "signature verification failed");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let message = match InboundMessage::parse(&body) {
        Ok(m) => m,
        Err(e) => {
            warn!(%instance_id, error = %e, "rejected non-JSON delivery");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match message {
        InboundMessage::Challenge(challenge) => {
            info!(%instance_id, "answering verification challenge");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                challenge,
            )
                .into_response()
        }
        InboundMessage::Notification(data) => {
            let event_type = data
                .pointer("/subscription/type")
                .and_then(Value::as_str)
                .unwrap_or(FALLBACK_EVENT_TYPE)
                .to_string();
            let event = PendingEvent {
                delivery_id: uuid::Uuid::new_v4().to_string(),
                received_at: Utc::now(),
                instance_id,
                event_type,
                data,
            };
            debug!(delivery_id = %event.delivery_id, event_type = %event.event_type, "queued delivery");

            if state.event_tx.send(event).is_err() {
                error!("event channel closed, delivery dropped");
            }
            StatusCode::OK.into_response()
        }
    }
}
