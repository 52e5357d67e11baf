//! Broker transport seam.
//!
//! The broker wire protocol is not modelled here; the transport only has
//! to deliver typed [`BrokerEvent`]s and accept typed [`BrokerCall`]s.
//! The HTTP implementation speaks JSON lines over a streaming response,
//! which is what our broker gateway exposes. Test harnesses implement
//! the trait over plain channels.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BrokerCall, BrokerError, BrokerEvent, FrameworkInfo};

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establishes a framework session and returns the event stream.
    ///
    /// The first event on a healthy stream is `SUBSCRIBED`.
    async fn subscribe(
        &self,
        framework: &FrameworkInfo,
    ) -> Result<mpsc::UnboundedReceiver<BrokerEvent>, BrokerError>;

    /// Issues one call against the current session.
    async fn call(&self, call: &BrokerCall) -> Result<(), BrokerError>;
}

/// HTTP transport: `POST /api/v1/scheduler` with a `SUBSCRIBE` body opens
/// the event stream; every other call is a plain POST.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/v1/scheduler", endpoint.trim_end_matches('/')),
        }
    }
}

#[derive(serde::Serialize)]
struct SubscribeBody<'a> {
    r#type: &'static str,
    framework: &'a FrameworkInfo,
}

#[async_trait]
impl BrokerTransport for HttpTransport {
    async fn subscribe(
        &self,
        framework: &FrameworkInfo,
    ) -> Result<mpsc::UnboundedReceiver<BrokerEvent>, BrokerError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SubscribeBody {
                r#type: "SUBSCRIBE",
                framework,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BrokerError::Rejected(response.status().as_u16()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "Broker event stream read failed");
                        break;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_slice::<BrokerEvent>(line) {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable broker event");
                        }
                    }
                }
            }
            debug!("Broker event stream ended");
        });

        Ok(rx)
    }

    async fn call(&self, call: &BrokerCall) -> Result<(), BrokerError> {
        let response = self.client.post(&self.endpoint).json(call).send().await?;
        if !response.status().is_success() {
            return Err(BrokerError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}
