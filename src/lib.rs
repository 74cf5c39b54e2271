//! Twitch EventSub webhook trigger.
//!
//! Keeps one EventSub subscription registered per trigger instance and
//! answers the deliveries Twitch sends to its callback: verification
//! challenges are echoed back, everything else is queued for the host.

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod host;
pub mod reconciler;
pub mod store;
pub mod types;
pub mod verification;
pub mod webhook;

pub use api::{EventSubApi, HelixClient};
pub use error::{ApiError, StoreError};
pub use reconciler::{ActivationOutcome, CreateOutcome, DeleteOutcome, Reconciler};
pub use store::{LinkStore, WebhookLinks};
pub use types::{EventType, SubscriptionDescriptor};
pub use webhook::InboundMessage;
