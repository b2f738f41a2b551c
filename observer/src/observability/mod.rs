//! Trace model, tracer and cost aggregation.

pub mod cost;
pub mod trace_model;
pub mod tracer;

pub use cost::{format_cost, Cost, CostAggregator, ModelPrice, PriceMatch, PricingTable};
pub use trace_model::{Span, SpanKind, SpanStatus, Trace, TraceExport, TraceSummary};
pub use tracer::{SpanGuard, Tracer};
