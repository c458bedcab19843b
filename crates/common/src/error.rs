use thiserror::Error;

/// Canonical flowmesh error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FlowError::InvalidTopology`]: structural build/link preconditions violated before execution
/// - [`FlowError::InvalidConfig`]: configuration/deploy-argument contract violations
/// - [`FlowError::Cluster`]: unit activation, addressing, or control-channel failures
/// - [`FlowError::Execution`]: runtime processor/strategy evaluation failures
/// - [`FlowError::Unsupported`]: syntactically valid but intentionally unimplemented behavior
/// - [`FlowError::Io`]: raw filesystem/network IO failures from std APIs
#[derive(Debug, Error)]
pub enum FlowError {
    /// Invalid or inconsistent configuration/deploy-argument state.
    ///
    /// Examples:
    /// - zero worker count on a layer
    /// - malformed deploy-argument values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Structural topology precondition violated at build/link time.
    ///
    /// Examples:
    /// - one-to-one link over layers of different cardinality
    /// - all-to-one link into a layer with more than one worker
    /// - cyclic operator graph
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Cluster runtime failures around unit activation and addressing.
    ///
    /// Examples:
    /// - activation against a cluster with no nodes
    /// - control round-trip to a deactivated unit
    #[error("cluster error: {0}")]
    Cluster(String),

    /// Runtime execution failures after the topology was built.
    ///
    /// Examples:
    /// - processor accept/flush failures
    /// - routing-key extraction against a missing field
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Valid request for a routing/operator shape not implemented in current version.
    ///
    /// Examples:
    /// - a named routing extractor absent from the registry
    /// - a link strategy invoked on an operator shape it does not support
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard flowmesh result alias.
pub type Result<T> = std::result::Result<T, FlowError>;
