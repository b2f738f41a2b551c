//! Live workflow graph: builder, event adapter and data sanitization.

pub mod adapter;
pub mod builder;
pub mod sanitize;

pub use adapter::GraphEventAdapter;
pub use builder::{WorkflowGraphBuilder, DEFAULT_MAX_DEPTH, HORIZONTAL_OFFSET, VERTICAL_SPACING};
