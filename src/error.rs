//! Error types for calls against the Twitch Helix and OAuth endpoints and
//! for the persisted link store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    /// The service answered with a non-2xx status.
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    /// A 2xx response carried no usable record.
    #[error("{endpoint} returned no data")]
    EmptyResponse { endpoint: String },

    /// A subscription tracked from an earlier activation could not be
    /// removed before replacing it.
    #[error("could not delete previous subscription {webhook_id}: {reason}")]
    StaleSubscription { webhook_id: String, reason: String },

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),
}

impl ApiError {
    pub fn transport(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: err.to_string(),
        }
    }

    pub fn decode(endpoint: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            endpoint: endpoint.into(),
            message: err.to_string(),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize links: {0}")]
    Serialize(#[from] serde_json::Error),
}
