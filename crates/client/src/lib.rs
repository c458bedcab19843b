//! Client-facing control surface for flowmesh workflows.
//!
//! Architecture role:
//! - owns the shared cluster, output hub, and engine configuration
//! - exposes `init`/`start`/`pause`/`resume`/`deactivate` keyed by workflow id
//! - hands the per-workflow output stream to the hosting application

pub mod engine;

pub use engine::{init_tracing, FlowEngine};
