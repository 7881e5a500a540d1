use super::{wire, PixelError, PixelNetwork};
use async_trait::async_trait;
use bf_core::{ConversionEvent, Network};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Relays pixel calls to a collector endpoint that replays them against the
/// network's browser library or events API.
#[derive(Clone)]
pub struct HttpPixel {
    pub network: Network,
    pub pixel_id: String,
    pub endpoint: String,
    access_token: Option<String>,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct PixelCallRequest<'a> {
    pixel_id: &'a str,
    network: Network,
    args: Vec<Value>,
    sent_at: String,
}

impl HttpPixel {
    pub fn new(
        network: Network,
        pixel_id: String,
        endpoint: String,
        access_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            network,
            pixel_id,
            endpoint,
            access_token,
            http_client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl PixelNetwork for HttpPixel {
    fn network(&self) -> Network {
        self.network
    }

    fn is_available(&self) -> bool {
        !self.pixel_id.trim().is_empty() && !self.endpoint.trim().is_empty()
    }

    async fn dispatch(&self, event: &ConversionEvent) -> Result<(), PixelError> {
        let payload = PixelCallRequest {
            pixel_id: &self.pixel_id,
            network: self.network,
            args: wire::pixel_call(self.network, event),
            sent_at: Utc::now().to_rfc3339(),
        };

        let mut req = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&payload);
        if let Some(token) = &self.access_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PixelError::Rejected {
                network: self.network,
                message: format!("{} - {}", status, body),
            });
        }

        tracing::info!(
            network = %self.network,
            pixel_id = %self.pixel_id,
            event = %event.kind.wire_name(self.network),
            "Pixel event relayed"
        );
        Ok(())
    }
}
