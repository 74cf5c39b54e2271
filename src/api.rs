//! Twitch Helix client for the EventSub subscription registry.
//!
//! [`EventSubApi`] is the seam the reconciler talks through. [`HelixClient`]
//! implements it over reqwest with an app access token obtained through the
//! client-credentials grant and refreshed once when a call comes back 401.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ApiError, Result};
use crate::types::{
    CreateSubscriptionRequest, DataEnvelope, SubscriptionPage, SubscriptionRecord, User,
};

const SUBSCRIPTIONS_PATH: &str = "/eventsub/subscriptions";
const USERS_PATH: &str = "/users";

#[async_trait]
pub trait EventSubApi: Send + Sync {
    /// One page of registered subscriptions, starting after `cursor`.
    async fn list_subscriptions(&self, cursor: Option<&str>) -> Result<SubscriptionPage>;
    /// First user whose login matches, if any.
    async fn find_user(&self, login: &str) -> Result<Option<User>>;
    /// Returns the first record the service echoes back.
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionRecord>;
    async fn delete_subscription(&self, id: &str) -> Result<()>;
    fn client_id(&self) -> &str;
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Exchange client credentials for an app access token.
pub async fn request_app_token(
    http: &reqwest::Client,
    auth_url: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenResponse> {
    let resp = http
        .post(auth_url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .query(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "client_credentials"),
        ])
        .send()
        .await
        .map_err(|e| ApiError::transport(auth_url, e))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            endpoint: auth_url.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    resp.json().await.map_err(|e| ApiError::decode(auth_url, e))
}

pub struct HelixClient {
    http: reqwest::Client,
    base_url: String,
    auth_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<String>>,
}

impl HelixClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::MissingCredentials("client_id"))?;
        let client_secret = config
            .client_secret
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(ApiError::MissingCredentials("client_secret"))?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ApiError::transport("client builder", e))?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.clone(),
            client_id,
            client_secret,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self, refresh: bool) -> Result<String> {
        if !refresh {
            if let Some(token) = self.token.read().await.as_ref() {
                return Ok(token.clone());
            }
        }

        let mut slot = self.token.write().await;
        if !refresh {
            // Another caller may have filled the slot while we waited.
            if let Some(token) = slot.as_ref() {
                return Ok(token.clone());
            }
        }
        let resp =
            request_app_token(&self.http, &self.auth_url, &self.client_id, &self.client_secret)
                .await?;
        let token = resp
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::EmptyResponse {
                endpoint: self.auth_url.clone(),
            })?;
        debug!(expires_in = ?resp.expires_in, "acquired app access token");
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Send an authenticated request, retrying once with a fresh token on 401.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{path}", self.base_url);
        let mut refresh = false;

        loop {
            let token = self.access_token(refresh).await?;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .header("Client-Id", &self.client_id)
                .bearer_auth(&token)
                .query(query);
            if let Some(body) = body {
                req = req.json(body);
            }

            let resp = req.send().await.map_err(|e| ApiError::transport(path, e))?;
            let status = resp.status();

            if status == StatusCode::UNAUTHORIZED && !refresh {
                warn!(%method, path, "access token rejected, refreshing");
                refresh = true;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(ApiError::Status {
                    endpoint: path.to_string(),
                    status: status.as_u16(),
                    body,
                });
            }
            return Ok(resp);
        }
    }
}

#[async_trait]
impl EventSubApi for HelixClient {
    async fn list_subscriptions(&self, cursor: Option<&str>) -> Result<SubscriptionPage> {
        let query: Vec<(&str, &str)> = cursor.map(|c| ("after", c)).into_iter().collect();
        let resp = self
            .send(Method::GET, SUBSCRIPTIONS_PATH, &query, None)
            .await?;
        resp.json()
            .await
            .map_err(|e| ApiError::decode(SUBSCRIPTIONS_PATH, e))
    }

    async fn find_user(&self, login: &str) -> Result<Option<User>> {
        let resp = self
            .send(Method::GET, USERS_PATH, &[("login", login)], None)
            .await?;
        let envelope: DataEnvelope<User> = resp
            .json()
            .await
            .map_err(|e| ApiError::decode(USERS_PATH, e))?;
        Ok(envelope.data.into_iter().next())
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionRecord> {
        let body =
            serde_json::to_value(request).map_err(|e| ApiError::decode(SUBSCRIPTIONS_PATH, e))?;
        let resp = self
            .send(Method::POST, SUBSCRIPTIONS_PATH, &[], Some(&body))
            .await?;
        let envelope: DataEnvelope<SubscriptionRecord> = resp
            .json()
            .await
            .map_err(|e| ApiError::decode(SUBSCRIPTIONS_PATH, e))?;
        envelope
            .data
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::EmptyResponse {
                endpoint: SUBSCRIPTIONS_PATH.to_string(),
            })
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        self.send(Method::DELETE, SUBSCRIPTIONS_PATH, &[("id", id)], None)
            .await?;
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}
