use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SUBSCRIPTION_SECRET: &str = "nexuscreatedSecret";

/// Extension configuration, passed by the host in `initialize` params under
/// `config`. Environment variables override the host-provided values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Externally reachable base URL. Falls back to the bound local address.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_subscription_secret")]
    pub subscription_secret: String,
    #[serde(default)]
    pub verify_signatures: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.twitch.tv/helix".into()
}
fn default_auth_url() -> String {
    "https://id.twitch.tv/oauth2/token".into()
}
fn default_bind_addr() -> String {
    "127.0.0.1:0".into()
}
fn default_subscription_secret() -> String {
    DEFAULT_SUBSCRIPTION_SECRET.into()
}
fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            api_base_url: default_api_base_url(),
            auth_url: default_auth_url(),
            bind_addr: default_bind_addr(),
            public_url: None,
            subscription_secret: default_subscription_secret(),
            verify_signatures: false,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Config {
    /// Parse the host-provided value (null means defaults) and apply
    /// environment overrides.
    pub fn from_host(value: Option<&serde_json::Value>) -> Result<Self, serde_json::Error> {
        let mut config = match value {
            Some(v) if !v.is_null() => serde_json::from_value(v.clone())?,
            _ => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(v) = non_empty("TWITCH_CLIENT_ID") {
            self.client_id = Some(v);
        }
        if let Some(v) = non_empty("TWITCH_CLIENT_SECRET") {
            self.client_secret = Some(v);
        }
        if let Some(v) = non_empty("TWITCH_TRIGGER_PUBLIC_URL") {
            self.public_url = Some(v);
        }
        if let Some(v) = non_empty("TWITCH_TRIGGER_BIND") {
            self.bind_addr = v;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn has_credentials(&self) -> bool {
        self.client_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.client_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Callback URL for a trigger instance under the given public base URL.
pub fn callback_url(public_url: &str, instance_id: &str) -> String {
    format!("{}/hooks/{instance_id}/webhook", public_url.trim_end_matches('/'))
}
