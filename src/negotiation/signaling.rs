//! Client half of offer/answer signaling

use std::time::Duration;

use futures_util::future::BoxFuture;
use reqwest::Client;

use crate::config::WebRtcConfig;
use crate::error::NegotiationError;
use crate::protocol::{AnswerResponse, OfferRequest};

/// Timeout for one offer round trip
const OFFER_TIMEOUT_SECS: u64 = 30;

/// Delivers an offer and returns the remote answer
pub trait SignalingClient: Send + Sync {
    fn exchange(&self, offer: OfferRequest)
        -> BoxFuture<'static, Result<AnswerResponse, NegotiationError>>;
}

/// POSTs offers as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    client: Client,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl HttpSignaling {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, NegotiationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(OFFER_TIMEOUT_SECS))
            .build()
            .map_err(|e| NegotiationError::Signaling(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            headers: Vec::new(),
        })
    }

    /// Client for the configured `offer_url`
    pub fn from_config(config: &WebRtcConfig) -> Result<Self, NegotiationError> {
        Self::new(config.offer_url.as_str())
    }

    /// Extra header sent with every offer (e.g. authorization)
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl SignalingClient for HttpSignaling {
    fn exchange(
        &self,
        offer: OfferRequest,
    ) -> BoxFuture<'static, Result<AnswerResponse, NegotiationError>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let headers = self.headers.clone();

        Box::pin(async move {
            log::debug!(
                "Posting offer to {} (restart: {}, connection: {:?})",
                endpoint,
                offer.restart,
                offer.connection_id
            );

            let mut request = client.post(&endpoint).json(&offer);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    NegotiationError::Signaling("offer request timed out".to_string())
                } else {
                    NegotiationError::Signaling(format!("offer request failed: {}", e))
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(NegotiationError::Signaling(format!(
                    "signaling endpoint returned {}: {}",
                    status, body
                )));
            }

            response
                .json::<AnswerResponse>()
                .await
                .map_err(|e| NegotiationError::Signaling(format!("invalid answer: {}", e)))
        })
    }
}
