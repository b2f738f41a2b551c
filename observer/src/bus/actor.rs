//! EventBusActor - typed pub/sub over lifecycle events
//!
//! The bus keeps an explicit subscription registry. Each subscription owns a
//! linked [`SubscriberActor`] worker; publishing casts the shared event into
//! every matching worker's mailbox and returns without waiting on handlers.
//!
//! With an external backend, published events leave the process through the
//! channel forwarder instead, and come back in through `Ingest`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, SupervisionEvent};
use serde::Serialize;
use shared_types::{Event, EventType};
use tokio::sync::mpsc;

use super::external::{spawn_forwarder, ExternalChannel, Outbound};
use super::handler::HandlerRef;
use super::subscriber::{SubscriberActor, SubscriberArguments, SubscriberMsg};
use super::SubscriptionId;
use crate::error::TransportError;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Default)]
pub enum BusBackend {
    /// Fan out to local subscribers
    #[default]
    InProcess,
    /// Serialize onto an external channel; local delivery happens via ingest
    External(Arc<dyn ExternalChannel>),
}

impl std::fmt::Debug for BusBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusBackend::InProcess => f.write_str("InProcess"),
            BusBackend::External(channel) => write!(f, "External({})", channel.name()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventBusConfig {
    pub backend: BusBackend,
}

// ============================================================================
// Counters
// ============================================================================

/// Counters shared between the bus and its workers.
#[derive(Debug, Default)]
pub struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
}

impl BusCounters {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    /// Handler invocations that returned Ok
    pub delivered: u64,
    /// Events lost to an unreachable channel, a dead worker or a bad payload
    pub dropped: u64,
    pub handler_failures: u64,
    /// Live subscriptions per event type
    pub subscribers: BTreeMap<EventType, usize>,
}

impl BusStats {
    pub fn subscribers_for(&self, event_type: EventType) -> usize {
        self.subscribers.get(&event_type).copied().unwrap_or(0)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Handles the bus needs to wait on in `drain`.
pub struct DrainTargets {
    pub(crate) workers: Vec<ActorRef<SubscriberMsg>>,
    pub(crate) forwarder: Option<mpsc::UnboundedSender<Outbound>>,
}

pub enum EventBusMsg {
    Publish {
        event: Arc<Event>,
    },
    /// Decode an externally delivered payload and fan it out locally
    Ingest {
        payload: String,
    },
    Subscribe {
        types: BTreeSet<EventType>,
        handler: HandlerRef,
        reply: RpcReplyPort<Result<SubscriptionId, String>>,
    },
    /// Remove `event_type` from a subscription; the worker stops once the
    /// subscription has no types left
    Unsubscribe {
        event_type: EventType,
        id: SubscriptionId,
        reply: RpcReplyPort<bool>,
    },
    GetStats {
        reply: RpcReplyPort<BusStats>,
    },
    GetDrainTargets {
        reply: RpcReplyPort<DrainTargets>,
    },
}

impl std::fmt::Debug for EventBusMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventBusMsg::Publish { event } => f
                .debug_struct("Publish")
                .field("event_type", &event.event_type)
                .finish(),
            EventBusMsg::Ingest { payload } => f
                .debug_struct("Ingest")
                .field("bytes", &payload.len())
                .finish(),
            EventBusMsg::Subscribe { types, handler, .. } => f
                .debug_struct("Subscribe")
                .field("types", types)
                .field("handler", handler)
                .finish(),
            EventBusMsg::Unsubscribe { event_type, id, .. } => f
                .debug_struct("Unsubscribe")
                .field("event_type", event_type)
                .field("id", id)
                .finish(),
            EventBusMsg::GetStats { .. } => f.write_str("GetStats"),
            EventBusMsg::GetDrainTargets { .. } => f.write_str("GetDrainTargets"),
        }
    }
}

// ============================================================================
// EventBusActor
// ============================================================================

pub struct EventBusArguments {
    pub config: EventBusConfig,
    pub counters: Arc<BusCounters>,
}

struct Subscription {
    id: SubscriptionId,
    types: BTreeSet<EventType>,
    handler_name: String,
    worker: ActorRef<SubscriberMsg>,
}

pub struct EventBusState {
    subscriptions: Vec<Subscription>,
    next_id: u64,
    counters: Arc<BusCounters>,
    forwarder: Option<mpsc::UnboundedSender<Outbound>>,
}

#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = EventBusMsg;
    type State = EventBusState;
    type Arguments = EventBusArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            backend = ?args.config.backend,
            "EventBusActor starting"
        );

        let forwarder = match args.config.backend {
            BusBackend::InProcess => None,
            BusBackend::External(channel) => {
                Some(spawn_forwarder(channel, Arc::clone(&args.counters)))
            }
        };

        Ok(EventBusState {
            subscriptions: Vec::new(),
            next_id: 1,
            counters: args.counters,
            forwarder,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventBusMsg::Publish { event } => self.handle_publish(event, state),
            EventBusMsg::Ingest { payload } => self.handle_ingest(&payload, state),
            EventBusMsg::Subscribe {
                types,
                handler,
                reply,
            } => {
                let result = self.handle_subscribe(&myself, types, handler, state).await;
                let _ = reply.send(result);
            }
            EventBusMsg::Unsubscribe {
                event_type,
                id,
                reply,
            } => {
                let _ = reply.send(self.handle_unsubscribe(event_type, id, state));
            }
            EventBusMsg::GetStats { reply } => {
                let _ = reply.send(stats(state));
            }
            EventBusMsg::GetDrainTargets { reply } => {
                let _ = reply.send(DrainTargets {
                    workers: state.subscriptions.iter().map(|s| s.worker.clone()).collect(),
                    forwarder: state.forwarder.clone(),
                });
            }
        }
        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        event: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let SupervisionEvent::ActorTerminated(actor_cell, _, _)
        | SupervisionEvent::ActorFailed(actor_cell, _) = &event
        {
            let actor_id = actor_cell.get_id();
            let before = state.subscriptions.len();
            state
                .subscriptions
                .retain(|sub| sub.worker.get_id() != actor_id);
            if state.subscriptions.len() < before {
                tracing::warn!(
                    bus = %myself.get_id(),
                    worker = %actor_id,
                    "Subscriber worker exited; subscription removed"
                );
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for sub in state.subscriptions.drain(..) {
            sub.worker.stop(Some("event bus stopped".to_string()));
        }
        state.forwarder = None;
        tracing::info!(actor_id = %myself.get_id(), "EventBusActor stopped");
        Ok(())
    }
}

impl EventBusActor {
    fn handle_publish(&self, event: Arc<Event>, state: &mut EventBusState) {
        state.counters.record_published();
        tracing::debug!(
            event_type = %event.event_type,
            session_id = %event.session_id,
            "Publishing event"
        );

        match &state.forwarder {
            Some(forwarder) => {
                let payload = match encode_event(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        state.counters.record_dropped();
                        tracing::warn!(
                            event_type = %event.event_type,
                            error = %e,
                            "Failed to serialize event; dropped"
                        );
                        return;
                    }
                };
                let outbound = Outbound::Send {
                    channel: event.event_type.channel(),
                    payload,
                };
                if forwarder.send(outbound).is_err() {
                    state.counters.record_dropped();
                    tracing::warn!(
                        event_type = %event.event_type,
                        "External forwarder gone; event dropped"
                    );
                }
            }
            None => fan_out(event, state),
        }
    }

    fn handle_ingest(&self, payload: &str, state: &mut EventBusState) {
        match decode_event(payload) {
            Ok(event) => fan_out(Arc::new(event), state),
            Err(e) => {
                state.counters.record_dropped();
                tracing::warn!(error = %e, "Ignoring malformed event payload");
            }
        }
    }

    async fn handle_subscribe(
        &self,
        myself: &ActorRef<EventBusMsg>,
        types: BTreeSet<EventType>,
        handler: HandlerRef,
        state: &mut EventBusState,
    ) -> Result<SubscriptionId, String> {
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        let handler_name = handler.name().to_string();

        let args = SubscriberArguments {
            id,
            handler,
            counters: Arc::clone(&state.counters),
        };
        let (worker, _) = Actor::spawn_linked(None, SubscriberActor, args, myself.get_cell())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, handler = %handler_name, "Failed to spawn subscriber");
                e.to_string()
            })?;

        tracing::info!(
            subscription = %id,
            handler = %handler_name,
            types = ?types,
            "Handler subscribed"
        );
        state.subscriptions.push(Subscription {
            id,
            types,
            handler_name,
            worker,
        });
        Ok(id)
    }

    fn handle_unsubscribe(
        &self,
        event_type: EventType,
        id: SubscriptionId,
        state: &mut EventBusState,
    ) -> bool {
        let Some(pos) = state.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        if !state.subscriptions[pos].types.remove(&event_type) {
            return false;
        }

        let sub = &state.subscriptions[pos];
        tracing::info!(
            subscription = %id,
            handler = %sub.handler_name,
            event_type = %event_type,
            "Handler unsubscribed"
        );
        if sub.types.is_empty() {
            let sub = state.subscriptions.remove(pos);
            sub.worker.stop(Some("unsubscribed".to_string()));
        }
        true
    }
}

fn fan_out(event: Arc<Event>, state: &EventBusState) {
    for sub in state
        .subscriptions
        .iter()
        .filter(|s| s.types.contains(&event.event_type))
    {
        if let Err(e) = sub.worker.cast(SubscriberMsg::Deliver(Arc::clone(&event))) {
            state.counters.record_dropped();
            tracing::warn!(
                subscription = %sub.id,
                handler = %sub.handler_name,
                error = %e,
                "Subscriber unreachable; event dropped"
            );
        }
    }
}

fn encode_event(event: &Event) -> Result<String, TransportError> {
    Ok(serde_json::to_string(event)?)
}

fn decode_event(payload: &str) -> Result<Event, TransportError> {
    Ok(serde_json::from_str(payload)?)
}

fn stats(state: &EventBusState) -> BusStats {
    let mut subscribers = BTreeMap::new();
    for sub in &state.subscriptions {
        for event_type in &sub.types {
            *subscribers.entry(*event_type).or_insert(0) += 1;
        }
    }
    let counters = &state.counters;
    BusStats {
        published: counters.published.load(Ordering::Relaxed),
        delivered: counters.delivered.load(Ordering::Relaxed),
        dropped: counters.dropped.load(Ordering::Relaxed),
        handler_failures: counters.handler_failures.load(Ordering::Relaxed),
        subscribers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_payload_decodes_to_same_event() {
        let event = Event::new(EventType::ActionStart, "s1", json!({"action": "click"}))
            .with_correlation_id("c-7");
        let payload = encode_event(&event).unwrap();
        let decoded = decode_event(&payload).unwrap();
        assert_eq!(decoded.event_type, EventType::ActionStart);
        assert_eq!(decoded.correlation_id.as_deref(), Some("c-7"));
        assert_eq!(decoded.data, event.data);
        assert!((decoded.timestamp - event.timestamp).abs() < 1e-3);
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let err = decode_event("{\"event_type\": \"not-a-type\"}").unwrap_err();
        assert!(matches!(err, TransportError::Serialization(_)));
        assert!(err.to_string().starts_with("Serialization error"));
    }
}
