//! Agent run observer - event bus, tracer, cost aggregation and a live
//! workflow graph for long-running automated tasks.
//!
//! The executor publishes lifecycle events (see [`emitter::LifecycleEmitter`])
//! onto an [`bus::EventBus`]. A [`graph::GraphEventAdapter`] turns them into a
//! renderable node/edge snapshot while an [`observability::Tracer`] records
//! nested, priced spans of the same run.

pub mod bus;
pub mod config;
pub mod emitter;
pub mod error;
pub mod graph;
pub mod observability;

pub use bus::{EventBus, EventBusConfig, EventHandler, SubscriptionId};
pub use config::ObserverConfig;
pub use emitter::LifecycleEmitter;
pub use error::{BusError, PricingError, TransportError};
pub use graph::{GraphEventAdapter, WorkflowGraphBuilder};
pub use observability::{CostAggregator, SpanKind, Trace, Tracer};
