//! Environment-driven settings for the observer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{BusBackend, EventBusConfig, HttpChannel};
use crate::error::TransportError;
use crate::graph::DEFAULT_MAX_DEPTH;
use crate::observability::{CostAggregator, PricingTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackendKind {
    Memory,
    Http,
}

impl BusBackendKind {
    fn from_env(value: &str) -> anyhow::Result<Self> {
        match value {
            "memory" => Ok(Self::Memory),
            "http" => Ok(Self::Http),
            other => Err(anyhow::anyhow!(
                "Invalid EVENT_BUS_BACKEND '{other}'. Expected 'memory' or 'http'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Graph depth guard
    pub max_graph_depth: usize,
    /// Pricing TOML override; the built-in table is used when unset
    pub pricing_path: Option<PathBuf>,
    pub bus_backend: BusBackendKind,
    /// Relay URL for the http backend
    pub bus_http_url: String,
    pub bus_http_timeout: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            max_graph_depth: DEFAULT_MAX_DEPTH,
            pricing_path: None,
            bus_backend: BusBackendKind::Memory,
            bus_http_url: "http://127.0.0.1:8787/events".to_string(),
            bus_http_timeout: Duration::from_millis(2000),
        }
    }
}

impl ObserverConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_graph_depth: env_parse(&lookup, "OBSERVER_MAX_GRAPH_DEPTH", defaults.max_graph_depth)?,
            pricing_path: lookup("OBSERVER_PRICING_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            bus_backend: BusBackendKind::from_env(&env_str(&lookup, "EVENT_BUS_BACKEND", "memory"))?,
            bus_http_url: env_str(&lookup, "EVENT_BUS_HTTP_URL", &defaults.bus_http_url),
            bus_http_timeout: Duration::from_millis(env_parse(
                &lookup,
                "EVENT_BUS_HTTP_TIMEOUT_MS",
                2000,
            )?),
        })
    }

    /// Pricing table from the override path, or the built-in one.
    pub fn cost_aggregator(&self) -> CostAggregator {
        CostAggregator::new(PricingTable::load_or_builtin(self.pricing_path.as_ref()))
    }

    pub fn bus_config(&self) -> Result<EventBusConfig, TransportError> {
        let backend = match self.bus_backend {
            BusBackendKind::Memory => BusBackend::InProcess,
            BusBackendKind::Http => BusBackend::External(Arc::new(HttpChannel::new(
                self.bus_http_url.clone(),
                self.bus_http_timeout,
            )?)),
        };
        Ok(EventBusConfig { backend })
    }
}

fn env_str(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(default),
    }
}
