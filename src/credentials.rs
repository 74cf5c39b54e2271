use serde::Serialize;
use tracing::info;

use crate::api::request_app_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

/// Outcome of a "test my credentials" action. Never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialCheck {
    pub status: CheckStatus,
    pub message: String,
}

impl CredentialCheck {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            message: message.into(),
        }
    }
}

pub async fn test_credentials(
    http: &reqwest::Client,
    auth_url: &str,
    client_id: &str,
    client_secret: &str,
) -> CredentialCheck {
    match request_app_token(http, auth_url, client_id, client_secret).await {
        Ok(resp) if resp.access_token.as_deref().is_some_and(|t| !t.is_empty()) => {
            info!("credential check succeeded");
            CredentialCheck {
                status: CheckStatus::Ok,
                message: "Authentication successful!".into(),
            }
        }
        Ok(_) => CredentialCheck::error("AccessToken not received"),
        Err(e) => CredentialCheck::error(format!("Error getting access token; {e}")),
    }
}
