//! Host-facing operations behind the `execute` JSON-RPC method.
//!
//! Every operation runs with exclusive access to [`AppState`], which keeps
//! activation and deactivation of the same trigger instance serialized.

use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::api::{EventSubApi, HelixClient};
use crate::config::{callback_url, Config};
use crate::credentials::{self, CheckStatus, CredentialCheck};
use crate::reconciler::{DeleteOutcome, Reconciler};
use crate::store::{LinkStore, WebhookLinks};
use crate::types::{PendingEvent, SubscriptionDescriptor};
use crate::webhook::ActiveInstances;

const NO_CREDENTIALS: &str = "Twitch credentials are not configured";

pub struct AppState {
    pub config: Config,
    pub links: LinkStore,
    pub api: Option<Arc<dyn EventSubApi>>,
    /// Shared with the HTTP server; deliveries for other ids get a 404.
    pub instances: ActiveInstances,
    http: reqwest::Client,
    pub port: Option<u16>,
    pub base_url: String,
    pub public_url: String,
    /// Deliveries received by the HTTP server, not yet published to host.
    pub pending_rx: Option<mpsc::UnboundedReceiver<PendingEvent>>,
}

impl AppState {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            config: Config::default(),
            links: LinkStore::new(data_dir),
            api: None,
            instances: ActiveInstances::default(),
            http: reqwest::Client::new(),
            port: None,
            base_url: String::new(),
            public_url: String::new(),
            pending_rx: None,
        }
    }

    /// Apply configuration and build the Helix client when credentials are
    /// present. Missing credentials only disable activation.
    pub fn configure(&mut self, config: Config) {
        self.api = if config.has_credentials() {
            match HelixClient::new(&config) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!(error = %e, "Helix client unavailable");
                    None
                }
            }
        } else {
            warn!("no Twitch credentials configured; activation disabled");
            None
        };
        if let Ok(http) = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
        {
            self.http = http;
        }
        self.config = config;
    }

    fn api(&self) -> Result<Arc<dyn EventSubApi>, String> {
        self.api
            .clone()
            .ok_or_else(|| NO_CREDENTIALS.to_string())
    }

    fn persist_links(&self) -> Result<(), String> {
        self.links.save().map_err(|e| {
            warn!(error = %e, "failed to persist webhook links");
            format!("failed to persist webhook links: {e}")
        })
    }

    pub fn callback_url(&self, instance_id: &str) -> String {
        callback_url(&self.public_url, instance_id)
    }
}

#[derive(Deserialize)]
struct ActivateInput {
    instance_id: String,
    #[serde(flatten)]
    descriptor: SubscriptionDescriptor,
}

#[derive(Deserialize)]
struct InstanceInput {
    instance_id: String,
}

#[derive(Deserialize, Default)]
struct CredentialsInput {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: &Value) -> Result<T, String> {
    serde_json::from_value(input.clone()).map_err(|e| format!("invalid input: {e}"))
}

pub async fn execute(operation: &str, input: &Value, state: &mut AppState) -> Result<Value, String> {
    match operation {
        "activate_trigger" => op_activate_trigger(input, state).await,
        "deactivate_trigger" => op_deactivate_trigger(input, state).await,
        "trigger_status" => op_trigger_status(input, state),
        "test_credentials" => op_test_credentials(input, state).await,
        "get_server_info" => op_get_server_info(state),
        _ => Err(format!("Unknown operation: {operation}")),
    }
}

async fn op_activate_trigger(input: &Value, state: &mut AppState) -> Result<Value, String> {
    let ActivateInput {
        instance_id,
        descriptor,
    } = parse_input(input)?;
    let api = state.api()?;
    let callback = state.callback_url(&instance_id);
    let secret = state.config.subscription_secret.clone();

    // Accept the handshake that creation triggers.
    state.instances.write().await.insert(instance_id.clone());

    let result = Reconciler::new(&*api, &mut state.links, &instance_id, &secret)
        .activate(&descriptor, &callback)
        .await;
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if state.links.webhook_id(&instance_id).is_none() {
                state.instances.write().await.remove(&instance_id);
            }
            // A retired subscription must not reappear after a restart.
            let _ = state.persist_links();
            return Err(format!("activation failed: {e}"));
        }
    };
    state.persist_links()?;

    info!(%instance_id, webhook_id = outcome.webhook_id(), "trigger activated");
    let mut data = serde_json::to_value(&outcome).map_err(|e| e.to_string())?;
    data["callback_url"] = Value::String(callback);
    Ok(data)
}

async fn op_deactivate_trigger(input: &Value, state: &mut AppState) -> Result<Value, String> {
    let InstanceInput { instance_id } = parse_input(input)?;
    let secret = state.config.subscription_secret.clone();

    let outcome = match (state.links.webhook_id(&instance_id), state.api.clone()) {
        (None, _) => DeleteOutcome::NothingTracked,
        (Some(webhook_id), None) => {
            warn!(%instance_id, %webhook_id, "cannot delete subscription without credentials");
            DeleteOutcome::Failed {
                webhook_id,
                reason: NO_CREDENTIALS.to_string(),
            }
        }
        (Some(_), Some(api)) => {
            Reconciler::new(&*api, &mut state.links, &instance_id, &secret)
                .delete()
                .await
        }
    };
    if outcome.succeeded() {
        state.instances.write().await.remove(&instance_id);
    }

    let mut data = serde_json::to_value(&outcome).map_err(|e| e.to_string())?;
    data["deleted"] = Value::Bool(outcome.succeeded());
    if let Err(e) = state.persist_links() {
        data["persist_error"] = Value::String(e);
    }
    Ok(data)
}

fn op_trigger_status(input: &Value, state: &AppState) -> Result<Value, String> {
    let InstanceInput { instance_id } = parse_input(input)?;
    Ok(json!({
        "instance_id": instance_id,
        "webhook_id": state.links.webhook_id(&instance_id),
        "callback_url": state.callback_url(&instance_id),
    }))
}

async fn op_test_credentials(input: &Value, state: &AppState) -> Result<Value, String> {
    let given: CredentialsInput = if input.is_null() {
        CredentialsInput::default()
    } else {
        parse_input(input)?
    };
    let client_id = given.client_id.or_else(|| state.config.client_id.clone());
    let client_secret = given
        .client_secret
        .or_else(|| state.config.client_secret.clone());

    let check = match (client_id, client_secret) {
        (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
            credentials::test_credentials(&state.http, &state.config.auth_url, &id, &secret).await
        }
        _ => CredentialCheck {
            status: CheckStatus::Error,
            message: "Client ID and client secret are required".into(),
        },
    };
    serde_json::to_value(check).map_err(|e| e.to_string())
}

fn op_get_server_info(state: &AppState) -> Result<Value, String> {
    let port = state.port.ok_or("server not initialized")?;
    Ok(json!({
        "port": port,
        "base_url": state.base_url,
        "public_url": state.public_url,
        "tracked_count": state.links.len(),
    }))
}
