use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const HEADER_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const HEADER_SIGNATURE: &str = "twitch-eventsub-message-signature";

/// Verify an EventSub delivery signature.
/// Expects header value like "sha256=<hex>" over `message_id + timestamp + body`.
pub fn verify_eventsub_signature(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    signature_header: &str,
) -> bool {
    let Some(expected_hex) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the header value the service would send for this delivery.
pub fn sign_eventsub(
    secret: &str,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
