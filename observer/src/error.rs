//! Error types for the observer crate.
//!
//! None of these ever reach the observed task through `publish` or the graph
//! builder; they surface only from explicit bus RPCs, transports and
//! configuration loading.

use std::path::PathBuf;

/// Errors from calls into the event bus actor.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to spawn event bus actor: {0}")]
    Spawn(String),
    #[error("Event bus RPC error: {0}")]
    Rpc(String),
    #[error("A default event bus is already installed")]
    DefaultAlreadyInstalled,
}

/// Errors from an external bus channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("Channel rejected event with status {0}")]
    Status(u16),
}

/// Errors from loading a pricing table file.
#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("Failed to read pricing file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse pricing TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Pricing for model '{model}' is not a finite number")]
    InvalidPrice { model: String },
}
