//! How a client reaches the coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::coordinator::Coordinator;
use crate::error::FlError;
use crate::protocol::{ConfigResponse, ProtocolError, UpdateAck, UpdateRequest};

/// Failures seen by a transport. Only some are worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failure or timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Coordinator asked the client to slow down
    #[error("Rate limited by coordinator")]
    RateLimited,

    /// Coordinator refused the request
    #[error("Rejected ({status}): {message}")]
    Rejected {
        /// Status code
        status: u16,
        /// Coordinator's message
        message: String,
    },

    /// Response body could not be decoded
    #[error(transparent)]
    Invalid(#[from] ProtocolError),
}

impl TransportError {
    /// Network failures and rate limiting are retried; everything else is terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::RateLimited)
    }

    /// Classify a coordinator status code.
    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 {
            TransportError::RateLimited
        } else {
            TransportError::Rejected { status, message }
        }
    }
}

impl From<TransportError> for FlError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Invalid(p) => FlError::Protocol(p),
            TransportError::Rejected { status, message } => FlError::Rejected { status, message },
            TransportError::RateLimited => FlError::Rejected {
                status: 429,
                message: "rate limited".into(),
            },
            TransportError::Network(message) => FlError::RetriesExhausted {
                attempts: 1,
                last_error: message,
            },
        }
    }
}

/// Request/response channel to a coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the current round announcement.
    async fn fetch_config(&self) -> Result<ConfigResponse, TransportError>;

    /// Register the client's signing key.
    async fn register_client(&self, client_id: &str, public_key_pem: &str) -> Result<(), TransportError>;

    /// Submit one update.
    async fn submit_update(&self, request: &UpdateRequest) -> Result<UpdateAck, TransportError>;
}

/// In-process transport backed by a shared [`Coordinator`].
///
/// Decryption and decompression run on the blocking pool.
#[derive(Clone, Debug)]
pub struct LocalTransport {
    coordinator: Arc<Coordinator>,
}

impl LocalTransport {
    /// Wrap a coordinator.
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

fn rejected(e: FlError) -> TransportError {
    TransportError::from_status(e.status_code(), e.to_string())
}

#[async_trait]
impl Transport for LocalTransport {
    async fn fetch_config(&self) -> Result<ConfigResponse, TransportError> {
        Ok(self.coordinator.config_response())
    }

    async fn register_client(&self, client_id: &str, public_key_pem: &str) -> Result<(), TransportError> {
        self.coordinator
            .register_client(client_id, public_key_pem)
            .map(|_| ())
            .map_err(rejected)
    }

    async fn submit_update(&self, request: &UpdateRequest) -> Result<UpdateAck, TransportError> {
        let coordinator = Arc::clone(&self.coordinator);
        let request = request.clone();
        tokio::task::spawn_blocking(move || coordinator.submit(&request))
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?
            .map(|outcome| outcome.to_ack())
            .map_err(rejected)
    }
}

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{Client, Response, StatusCode};
    use serde::Deserialize;

    use super::{Transport, TransportError};
    use crate::protocol::{
        ConfigResponse, ProtocolError, RegisterRequest, SchemaVersion, UpdateAck, UpdateRequest,
    };

    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }

    /// JSON-over-HTTP transport.
    #[derive(Clone, Debug)]
    pub struct HttpTransport {
        client: Client,
        base_url: String,
    }

    impl HttpTransport {
        /// Transport for the coordinator at `base_url`; every request is bounded by `timeout`.
        pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| TransportError::Network(e.to_string()))?;
            Ok(Self {
                client,
                base_url: base_url.into().trim_end_matches('/').to_string(),
            })
        }

        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base_url, path)
        }

        async fn checked(response: Response) -> Result<Vec<u8>, TransportError> {
            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;
            if status.is_success() {
                return Ok(body.to_vec());
            }
            if status == StatusCode::TOO_MANY_REQUESTS {
                return Err(TransportError::RateLimited);
            }
            let message = serde_json::from_slice::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
            Err(TransportError::from_status(status.as_u16(), message))
        }
    }

    fn network(e: reqwest::Error) -> TransportError {
        TransportError::Network(e.to_string())
    }

    #[async_trait]
    impl Transport for HttpTransport {
        async fn fetch_config(&self) -> Result<ConfigResponse, TransportError> {
            let response = self
                .client
                .get(self.url("/config"))
                .send()
                .await
                .map_err(network)?;
            let body = Self::checked(response).await?;
            Ok(ConfigResponse::from_json(&body)?)
        }

        async fn register_client(&self, client_id: &str, public_key_pem: &str) -> Result<(), TransportError> {
            let request = RegisterRequest {
                client_id: client_id.to_string(),
                public_key: public_key_pem.to_string(),
                schema_version: SchemaVersion::CURRENT,
            };
            let response = self
                .client
                .post(self.url("/clients"))
                .json(&request)
                .send()
                .await
                .map_err(network)?;
            Self::checked(response).await.map(|_| ())
        }

        async fn submit_update(&self, request: &UpdateRequest) -> Result<UpdateAck, TransportError> {
            let response = self
                .client
                .post(self.url("/updates"))
                .json(request)
                .send()
                .await
                .map_err(network)?;
            let body = Self::checked(response).await?;
            serde_json::from_slice(&body)
                .map_err(|e| TransportError::Invalid(ProtocolError::Malformed(e.to_string())))
        }
    }
}
