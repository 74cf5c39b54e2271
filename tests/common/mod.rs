//! Shared helpers for integration tests against a mocked Twitch API.

#![allow(dead_code)]

use serde_json::{json, Value};
use twitch_trigger::config::Config;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CLIENT_ID: &str = "test-client-id";
pub const CLIENT_SECRET: &str = "test-client-secret";

/// Config pointing both the Helix API and the OAuth endpoint at the mock.
pub fn helix_config(server: &MockServer) -> Config {
    Config {
        client_id: Some(CLIENT_ID.into()),
        client_secret: Some(CLIENT_SECRET.into()),
        api_base_url: server.uri(),
        auth_url: format!("{}/oauth2/token", server.uri()),
        ..Default::default()
    }
}

pub async fn mount_token(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(query_param("grant_type", "client_credentials"))
        .and(query_param("client_id", CLIENT_ID))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "expires_in": 5011271,
            "token_type": "bearer"
        })))
        .mount(server)
        .await;
}

pub fn subscription(id: &str, event_type: &str, callback: &str) -> Value {
    json!({
        "id": id,
        "status": "enabled",
        "type": event_type,
        "version": "1",
        "condition": { "broadcaster_user_id": "1234" },
        "created_at": "2024-01-01T00:00:00Z",
        "transport": { "method": "webhook", "callback": callback },
        "cost": 1
    })
}

pub fn page(items: Vec<Value>, cursor: Option<&str>) -> Value {
    let mut body = json!({
        "data": items,
        "total": 0,
        "total_cost": 0,
        "max_total_cost": 10000,
        "pagination": {}
    });
    if let Some(c) = cursor {
        body["pagination"] = json!({ "cursor": c });
    }
    body
}

pub fn users(items: Vec<(&str, &str)>) -> Value {
    let data: Vec<Value> = items
        .into_iter()
        .map(|(id, login)| json!({ "id": id, "login": login, "display_name": login }))
        .collect();
    json!({ "data": data })
}
