//! Event bus tests
//!
//! These tests verify the publish/subscribe contract:
//! - Per-handler ordering for a sequential publisher
//! - Failing and panicking handlers are isolated from their siblings
//! - Publishing with no subscribers neither fails nor blocks
//! - External backends serialize onto `events:{type}` and drop on failure

use std::sync::Arc;

use async_trait::async_trait;
use observer::bus::{handler_fn, BusBackend, EventBus, EventBusConfig, ExternalChannel};
use observer::TransportError;
use serde_json::json;
use shared_types::{Event, EventType};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};

fn event(event_type: EventType, n: u64) -> Event {
    Event::new(event_type, "session-1", json!({ "n": n }))
}

async fn start_bus() -> EventBus {
    EventBus::start(EventBusConfig::default())
        .await
        .expect("bus starts")
}

/// Handler that forwards every event's `n` to a channel.
fn collector(name: &str) -> (impl observer::EventHandler, mpsc::UnboundedReceiver<u64>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(name.to_string(), move |event: Arc<Event>| {
        let tx = tx.clone();
        async move {
            let n = event.u64_field("n").unwrap_or_default();
            tx.send(n).map_err(anyhow::Error::from)
        }
    });
    (handler, rx)
}

fn drain_received(rx: &mut mpsc::UnboundedReceiver<u64>) -> Vec<u64> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn test_publish_without_subscribers_returns_immediately() {
    let bus = start_bus().await;

    let publish = async {
        for n in 0..100 {
            bus.publish(event(EventType::NodeStart, n));
        }
    };
    timeout(Duration::from_secs(1), publish)
        .await
        .expect("publish must not block");

    bus.drain().await.unwrap();
    let stats = bus.stats().await.unwrap();
    assert_eq!(stats.published, 100);
    assert_eq!(stats.delivered, 0);
    bus.close().await;
}

#[tokio::test]
async fn test_handlers_see_events_in_publish_order() {
    let bus = start_bus().await;
    let (first, mut first_rx) = collector("first");
    let (second, mut second_rx) = collector("second");
    bus.subscribe(EventType::ActionStart, first).await.unwrap();
    bus.subscribe(EventType::ActionStart, second).await.unwrap();

    for n in 0..50 {
        bus.publish(event(EventType::ActionStart, n));
    }
    bus.drain().await.unwrap();

    let expected: Vec<u64> = (0..50).collect();
    assert_eq!(drain_received(&mut first_rx), expected);
    assert_eq!(drain_received(&mut second_rx), expected);
    bus.close().await;
}

#[tokio::test]
async fn test_only_matching_type_is_delivered() {
    let bus = start_bus().await;
    let (handler, mut rx) = collector("errors-only");
    bus.subscribe(EventType::AgentError, handler).await.unwrap();

    bus.publish(event(EventType::AgentStart, 1));
    bus.publish(event(EventType::AgentError, 2));
    bus.drain().await.unwrap();

    assert_eq!(drain_received(&mut rx), vec![2]);
    bus.close().await;
}

#[tokio::test]
async fn test_failing_handler_does_not_block_siblings() {
    // Given: one handler that always errors, one that panics, one healthy
    let bus = start_bus().await;
    bus.subscribe(
        EventType::ActionComplete,
        handler_fn("always-fails", |_event| async {
            Err::<(), _>(anyhow::anyhow!("handler exploded"))
        }),
    )
    .await
    .unwrap();
    bus.subscribe(
        EventType::ActionComplete,
        handler_fn("panics", |event: Arc<Event>| async move {
            if event.u64_field("n") == Some(1) {
                panic!("handler panicked");
            }
            Ok(())
        }),
    )
    .await
    .unwrap();
    let (healthy, mut rx) = collector("healthy");
    bus.subscribe(EventType::ActionComplete, healthy).await.unwrap();

    // When: events are published
    for n in 0..3 {
        bus.publish(event(EventType::ActionComplete, n));
    }
    bus.drain().await.unwrap();

    // Then: the healthy handler saw every event and the bus is still up
    assert_eq!(drain_received(&mut rx), vec![0, 1, 2]);
    let stats = bus.stats().await.unwrap();
    assert_eq!(stats.handler_failures, 4);
    assert_eq!(stats.delivered, 5);
    assert_eq!(stats.subscribers_for(EventType::ActionComplete), 3);

    // The panicking worker keeps serving later events.
    bus.publish(event(EventType::ActionComplete, 3));
    bus.drain().await.unwrap();
    assert_eq!(drain_received(&mut rx), vec![3]);
    assert_eq!(bus.stats().await.unwrap().delivered, 7);
    bus.close().await;
}

#[tokio::test]
async fn test_subscribe_many_keeps_cross_type_order() {
    let bus = start_bus().await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    bus.subscribe_many(
        [EventType::ActionStart, EventType::ActionComplete],
        handler_fn("ordered", move |event: Arc<Event>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().await.push(event.event_type);
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    for n in 0..20 {
        bus.publish(event(EventType::ActionStart, n));
        bus.publish(event(EventType::ActionComplete, n));
    }
    bus.drain().await.unwrap();

    let received = received.lock().await;
    assert_eq!(received.len(), 40);
    for pair in received.chunks(2) {
        assert_eq!(pair, [EventType::ActionStart, EventType::ActionComplete]);
    }
    bus.close().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = start_bus().await;
    let (handler, mut rx) = collector("short-lived");
    let id = bus
        .subscribe_many([EventType::NodeStart, EventType::NodeComplete], handler)
        .await
        .unwrap();

    bus.publish(event(EventType::NodeStart, 1));
    bus.drain().await.unwrap();
    assert_eq!(drain_received(&mut rx), vec![1]);

    assert!(bus.unsubscribe(EventType::NodeStart, id).await.unwrap());
    assert!(!bus.unsubscribe(EventType::NodeStart, id).await.unwrap());

    bus.publish(event(EventType::NodeStart, 2));
    bus.publish(event(EventType::NodeComplete, 3));
    bus.drain().await.unwrap();
    assert_eq!(drain_received(&mut rx), vec![3]);

    assert!(bus.unsubscribe(EventType::NodeComplete, id).await.unwrap());
    let stats = bus.stats().await.unwrap();
    assert_eq!(stats.subscribers_for(EventType::NodeComplete), 0);
    bus.close().await;
}

#[tokio::test]
async fn test_ingest_fans_out_decoded_payloads() {
    let bus = start_bus().await;
    let (handler, mut rx) = collector("ingested");
    bus.subscribe(EventType::LlmCallStart, handler).await.unwrap();

    let payload = serde_json::to_string(&event(EventType::LlmCallStart, 9)).unwrap();
    bus.ingest(payload);
    bus.ingest("not json at all");
    bus.drain().await.unwrap();

    assert_eq!(drain_received(&mut rx), vec![9]);
    assert_eq!(bus.stats().await.unwrap().dropped, 1);
    bus.close().await;
}

// ============================================================================
// External backend
// ============================================================================

#[derive(Default)]
struct RecordingChannel {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

#[async_trait]
impl ExternalChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, channel: &str, payload: String) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Request {
                url: channel.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.sent.lock().await.push((channel.to_string(), payload));
        Ok(())
    }
}

#[tokio::test]
async fn test_external_backend_serializes_to_typed_channel() {
    let channel = Arc::new(RecordingChannel::default());
    let bus = EventBus::start(EventBusConfig {
        backend: BusBackend::External(channel.clone()),
    })
    .await
    .unwrap();

    bus.publish(event(EventType::AgentStart, 1).with_correlation_id("c-1"));
    bus.publish(event(EventType::AgentComplete, 2));
    bus.drain().await.unwrap();

    let sent = channel.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "events:agent-start");
    assert_eq!(sent[1].0, "events:agent-complete");

    let decoded: Event = serde_json::from_str(&sent[0].1).unwrap();
    assert_eq!(decoded.event_type, EventType::AgentStart);
    assert_eq!(decoded.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(decoded.data["n"], 1);
    drop(sent);
    bus.close().await;
}

#[tokio::test]
async fn test_unreachable_external_backend_drops_silently() {
    let channel = Arc::new(RecordingChannel {
        fail: true,
        ..Default::default()
    });
    let bus = EventBus::start(EventBusConfig {
        backend: BusBackend::External(channel),
    })
    .await
    .unwrap();

    bus.publish(event(EventType::AgentStart, 1));
    bus.publish(event(EventType::AgentError, 2));
    bus.drain().await.unwrap();

    let stats = bus.stats().await.unwrap();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.dropped, 2);
    bus.close().await;
}
