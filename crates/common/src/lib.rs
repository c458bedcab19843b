//! Shared configuration, error types, IDs, and observability primitives for flowmesh crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`FlowError`] / [`Result`] contracts
//! - hosts the metrics registry shared by engine and cluster crates
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{FlowError, Result};
pub use ids::*;
pub use metrics::MetricsRegistry;
