//! External channel backend.
//!
//! When the bus runs with an external backend, every published event is
//! serialized to JSON and sent on channel `events:{event_type}` instead of
//! being fanned out locally. The receiving process feeds payloads back in
//! with `EventBus::ingest`. Delivery is at-most-once: a failed send is logged
//! and counted as dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::actor::BusCounters;
use crate::error::TransportError;

#[async_trait]
pub trait ExternalChannel: Send + Sync + 'static {
    /// Transport name used in logs.
    fn name(&self) -> &str;

    async fn send(&self, channel: &str, payload: String) -> Result<(), TransportError>;
}

/// Relays events by POSTing the JSON payload to `{base_url}/{channel}`.
#[derive(Debug, Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChannel {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Request {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    pub fn url_for(&self, channel: &str) -> String {
        format!("{}/{}", self.base_url, channel)
    }
}

#[async_trait]
impl ExternalChannel for HttpChannel {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        let url = self.url_for(channel);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| TransportError::Request {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }
        Ok(())
    }
}

pub(crate) enum Outbound {
    Send { channel: String, payload: String },
    Flush(oneshot::Sender<()>),
}

/// Sequential sender task in front of an external channel, so sends keep
/// publish order without holding up the bus actor.
pub(crate) fn spawn_forwarder(
    channel: Arc<dyn ExternalChannel>,
    counters: Arc<BusCounters>,
) -> mpsc::UnboundedSender<Outbound> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                Outbound::Send {
                    channel: name,
                    payload,
                } => {
                    if let Err(e) = channel.send(&name, payload).await {
                        counters.record_dropped();
                        tracing::warn!(
                            transport = %channel.name(),
                            channel = %name,
                            error = %e,
                            "External channel unreachable; event dropped"
                        );
                    } else {
                        tracing::debug!(channel = %name, "Event sent on external channel");
                    }
                }
                Outbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        tracing::debug!(transport = %channel.name(), "External forwarder stopped");
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_channel_url() {
        let channel = HttpChannel::new("http://relay.local/events/", Duration::from_millis(50))
            .unwrap();
        assert_eq!(
            channel.url_for("events:agent-start"),
            "http://relay.local/events/events:agent-start"
        );
    }

    #[tokio::test]
    async fn test_unreachable_http_channel_reports_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let channel =
            HttpChannel::new("http://127.0.0.1:9/events", Duration::from_millis(200)).unwrap();
        let result = channel.send("events:agent-start", "{}".to_string()).await;
        assert!(matches!(result, Err(TransportError::Request { .. })));
    }
}
