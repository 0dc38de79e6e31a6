//! Push-based delivery for the Receiver and Relay modes.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use unibox_shared::protocol::PushEnvelope;
use unibox_shared::CoreError;

/// Hands envelopes to a push provider.
///
/// Delivery is at most "accepted by the provider"; the remote side may see
/// the same envelope more than once.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn push(&self, envelope: &PushEnvelope, target_token: &str) -> Result<(), CoreError>;
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    token: &'a str,
    #[serde(flatten)]
    envelope: &'a PushEnvelope,
}

/// Posts envelopes as JSON to a push gateway endpoint.
pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPushTransport {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::TransportPushFailure(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RelayTransport for HttpPushTransport {
    async fn push(&self, envelope: &PushEnvelope, target_token: &str) -> Result<(), CoreError> {
        let body = GatewayRequest {
            token: target_token,
            envelope,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(to = %envelope.to, error = %e, "Push request failed");
                CoreError::TransportPushFailure(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(to = %envelope.to, %status, "Push gateway rejected envelope");
            return Err(CoreError::TransportPushFailure(format!(
                "gateway responded {status}"
            )));
        }

        debug!(to = %envelope.to, msg_id = %envelope.message_id, "Push accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_body_carries_token_and_envelope() {
        let envelope = PushEnvelope::new("tok", "push.example", "12").with_data("session_id", "s");
        let body = serde_json::to_value(GatewayRequest {
            token: "target",
            envelope: &envelope,
        })
        .unwrap();

        assert_eq!(body["token"], "target");
        assert_eq!(body["to"], "tok@push.example");
        assert_eq!(body["message_id"], "12");
        assert_eq!(body["data"]["session_id"], "s");
    }

    #[tokio::test]
    async fn unreachable_gateway_is_push_failure() {
        let transport =
            HttpPushTransport::new("http://127.0.0.1:9/push", Duration::from_secs(2)).unwrap();
        let envelope = PushEnvelope::new("tok", "push.example", "1");

        let err = transport.push(&envelope, "target").await.unwrap_err();
        assert!(matches!(err, CoreError::TransportPushFailure(_)));
    }
}
