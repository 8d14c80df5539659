//! # Remote Delivery Endpoint
//!
//! The batch-submit call. [`CallableEndpoint`] talks to a Firebase callable
//! function over HTTPS; tests plug in their own [`DeliveryEndpoint`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use geotrack_core::{Credential, LocationSample};

use crate::config::TrackerConfig;
use crate::error::{SyncResult, TransportError};
use crate::protocol::{BatchResult, CallableRequest, CallableResponse, SampleOutcome, SubmitBatch};

/// Accepts an ordered batch and returns one verdict per sample.
///
/// Implementations must be safe to call again with the same samples: the
/// engine delivers at least once.
#[async_trait]
pub trait DeliveryEndpoint: Send + Sync {
    async fn submit(
        &self,
        samples: &[LocationSample],
        credential: &Credential,
    ) -> Result<Vec<SampleOutcome>, TransportError>;
}

/// [`DeliveryEndpoint`] for a Firebase callable function.
#[derive(Debug, Clone)]
pub struct CallableEndpoint {
    client: Client,
    url: Url,
    collection: String,
    device_id: String,
    device_label: String,
    timeout: Duration,
}

impl CallableEndpoint {
    pub fn new(config: &TrackerConfig) -> SyncResult<Self> {
        let timeout = config.sync.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .user_agent(concat!("geotrack/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(CallableEndpoint {
            client,
            url: config.backend.endpoint_url()?,
            collection: config.backend.collection.clone(),
            device_id: config.device_id().to_string(),
            device_label: config.device_label().to_string(),
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn map_send_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::from(err)
        }
    }
}

#[async_trait]
impl DeliveryEndpoint for CallableEndpoint {
    async fn submit(
        &self,
        samples: &[LocationSample],
        credential: &Credential,
    ) -> Result<Vec<SampleOutcome>, TransportError> {
        let request = CallableRequest {
            data: SubmitBatch::new(&self.collection, &self.device_id, &self.device_label, samples),
        };
        debug!(
            batch_id = %request.data.batch_id,
            count = samples.len(),
            url = %self.url,
            "Submitting batch"
        );

        let response = self
            .client
            .post(self.url.clone())
            .header(header::AUTHORIZATION, credential.bearer())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.map_send_error(e))?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(TransportError::Unauthorized(format!("{status}")));
        }

        let parsed = serde_json::from_str::<CallableResponse<BatchResult>>(&body);

        if !status.is_success() {
            let message = match parsed {
                Ok(CallableResponse { error: Some(error), .. }) => {
                    if error.is_unauthenticated() {
                        return Err(TransportError::Unauthorized(error.message));
                    }
                    format!("{}: {}", error.status, error.message)
                }
                _ => body.chars().take(200).collect(),
            };
            warn!(status = status.as_u16(), %message, "Callable returned an error status");
            return Err(TransportError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let parsed = parsed.map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        match (parsed.result, parsed.error) {
            (_, Some(error)) if error.is_unauthenticated() => {
                Err(TransportError::Unauthorized(error.message))
            }
            (_, Some(error)) => Err(TransportError::Server {
                status: status.as_u16(),
                message: format!("{}: {}", error.status, error.message),
            }),
            (Some(result), None) => Ok(result.results),
            (None, None) => Err(TransportError::InvalidResponse(
                "callable response has neither result nor error".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_from_config() {
        let mut config = TrackerConfig::default();
        config.backend.functions_url = "https://europe-west1-demo.cloudfunctions.net".into();
        let endpoint = CallableEndpoint::new(&config).unwrap();
        assert_eq!(
            endpoint.url().as_str(),
            "https://europe-west1-demo.cloudfunctions.net/onCallCreateOne"
        );
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let mut config = TrackerConfig::default();
        config.backend.functions_url = "not a url".into();
        assert!(CallableEndpoint::new(&config).is_err());
    }
}
