//! Client round orchestrator.
//!
//! One round is: fetch the coordinator's announcement, obtain gradients from
//! the local [`GradientSource`], compress, encrypt for the coordinator's key,
//! sign the canonical payload and submit. Network failures and rate limiting
//! are retried with exponential backoff; any other rejection ends the round.
//! Every wait is bounded and observes a [`CancelToken`].

pub mod cancel;
pub mod transport;

pub use cancel::CancelToken;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{LocalTransport, Transport, TransportError};

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{self, GradientSet, Tensor, QUANT_BITS};
use crate::crypto::{self, KeyPair, RsaPublicKey};
use crate::error::FlError;
use crate::protocol::messages::validate_client_id;
use crate::protocol::{SchemaVersion, UpdateRequest};

/// Produces the gradients a client contributes to a round.
pub trait GradientSource {
    /// Gradients for `round`, in the model's parameter order.
    fn compute_gradients(&mut self, round: u64) -> Result<GradientSet, FlError>;
}

impl<F> GradientSource for F
where
    F: FnMut(u64) -> Result<GradientSet, FlError>,
{
    fn compute_gradients(&mut self, round: u64) -> Result<GradientSet, FlError> {
        self(round)
    }
}

/// Client settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Identifier the coordinator knows this client by
    pub client_id: String,
    /// Fraction of gradient entries kept by top-k sparsification
    #[serde(default = "default_ratio")]
    pub compression_ratio: f64,
    /// Quantization width
    #[serde(default = "default_bits")]
    pub bits: u8,
    /// Attempts per request, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on a single request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_ratio() -> f64 {
    0.15
}

fn default_bits() -> u8 {
    QUANT_BITS
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl ClientConfig {
    /// Defaults for `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            compression_ratio: default_ratio(),
            bits: default_bits(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    /// Delay before the first retry.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Bound on a single request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<(), FlError> {
        validate_client_id(&self.client_id)?;
        if self.max_attempts == 0 {
            return Err(FlError::Config("max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(FlError::Config("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Summary of a completed round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundReport {
    /// Round the update was submitted to
    pub round: u64,
    /// Coordinator already had this client's update for the round
    pub duplicate: bool,
    /// Submission attempts used
    pub attempts: u32,
}

/// Drives federated rounds for one client.
#[derive(Debug)]
pub struct FederatedClient<T> {
    config: ClientConfig,
    signing: KeyPair,
    transport: T,
}

impl<T: Transport> FederatedClient<T> {
    /// Create a client that signs with `signing`.
    pub fn new(config: ClientConfig, signing: KeyPair, transport: T) -> Result<Self, FlError> {
        config.validate()?;
        Ok(Self {
            config,
            signing,
            transport,
        })
    }

    /// Client identifier.
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Register this client's signing key with the coordinator.
    pub async fn register(&self, cancel: &CancelToken) -> Result<(), FlError> {
        let pem = self.signing.public_pem()?;
        self.with_retry("register", cancel, || {
            self.transport.register_client(&self.config.client_id, &pem)
        })
        .await?;
        Ok(())
    }

    /// Compress, encrypt and sign `gradients` for `round`.
    pub fn build_update(
        &self,
        gradients: &[Tensor],
        round: u64,
        server_key: &RsaPublicKey,
    ) -> Result<UpdateRequest, FlError> {
        let (update, meta) = codec::compress(gradients, self.config.compression_ratio, self.config.bits)?;
        let payload = crypto::encrypt(&update.to_bytes(), server_key)?;

        let mut request = UpdateRequest {
            client_id: self.config.client_id.clone(),
            round,
            encrypted_payload: STANDARD.encode(payload.to_bytes()),
            compression_meta: meta,
            signature: String::new(),
            schema_version: SchemaVersion::CURRENT,
        };
        let signed = request.signable().to_bytes()?;
        request.signature = STANDARD.encode(crypto::sign(&signed, self.signing.private_key())?);
        Ok(request)
    }

    /// Run one round end to end.
    ///
    /// `round` overrides the coordinator's current round when given.
    pub async fn run_round<G: GradientSource>(
        &self,
        source: &mut G,
        round: Option<u64>,
        cancel: &CancelToken,
    ) -> Result<RoundReport, FlError> {
        let (config, _) = self
            .with_retry("fetch_config", cancel, || self.transport.fetch_config())
            .await?;
        let round = round.unwrap_or(config.current_round);
        let server_key = config.server_key()?;

        let gradients = source.compute_gradients(round)?;
        let request = self.build_update(&gradients, round, &server_key)?;

        let (ack, attempts) = self
            .with_retry("submit_update", cancel, || self.transport.submit_update(&request))
            .await?;
        info!(
            client_id = %self.config.client_id,
            round,
            attempts,
            duplicate = ack.duplicate,
            "update submitted"
        );
        Ok(RoundReport {
            round,
            duplicate: ack.duplicate,
            attempts,
        })
    }

    async fn with_retry<R, F, Fut>(
        &self,
        op: &'static str,
        cancel: &CancelToken,
        mut call: F,
    ) -> Result<(R, u32), FlError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.base_delay())
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_interval(Duration::from_secs(3600))
            .with_max_elapsed_time(None)
            .build();
        let timeout = self.config.request_timeout();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FlError::Cancelled),
                r = tokio::time::timeout(timeout, call()) => r.unwrap_or_else(|_| {
                    Err(TransportError::Network(format!("timed out after {:?}", timeout)))
                }),
            };

            let err = match result {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !e.is_transient() => {
                    debug!(op, attempt, error = %e, "terminal failure");
                    return Err(e.into());
                }
                Err(e) => e,
            };
            if attempt >= self.config.max_attempts {
                return Err(FlError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = schedule.next_backoff().unwrap_or_else(|| self.config.base_delay());
            warn!(op, attempt, ?delay, error = %err, "transient failure, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FlError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
