//! Routing-key extraction for hash-shuffle links.
//!
//! Keys ship as tagged data rather than serialized code: a link carries a
//! [`RoutingKey`] value, and custom extractors are registered by name against
//! the process-global registry.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock, RwLock};

use flowmesh_common::{FlowError, Result};
use serde::{Deserialize, Serialize};

use crate::tuple::Tuple;

/// Custom routing extractor registered by name.
pub trait RoutingExtractor: Send + Sync {
    /// Stable lowercase extractor name referenced by [`RoutingKey::Named`].
    fn name(&self) -> &str;
    /// Routing key for one tuple.
    fn key(&self, tuple: &Tuple) -> Result<u64>;
}

/// Tagged routing-key extractor shipped as data.
///
/// Hashing is deterministic within a process, which is what keyed routing
/// needs: every sender computes the same destination for the same key value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingKey {
    /// Hash of one field selected by index.
    ByField { index: usize },
    /// Hash of several fields selected by index, in order.
    Composite { indexes: Vec<usize> },
    /// Custom extractor resolved against the process-global registry.
    Named { name: String },
}

impl RoutingKey {
    pub fn by_field(index: usize) -> Self {
        Self::ByField { index }
    }

    pub fn composite(indexes: Vec<usize>) -> Self {
        Self::Composite { indexes }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named { name: name.into() }
    }

    /// Routing key for `tuple`.
    ///
    /// Referencing a missing field is an execution error; an unregistered
    /// named extractor is unsupported.
    pub fn key(&self, tuple: &Tuple) -> Result<u64> {
        match self {
            Self::ByField { index } => hash_fields(tuple, std::slice::from_ref(index)),
            Self::Composite { indexes } => hash_fields(tuple, indexes),
            Self::Named { name } => {
                let extractor = get_routing_extractor(name).ok_or_else(|| {
                    FlowError::Unsupported(format!("routing extractor '{name}' is not registered"))
                })?;
                extractor.key(tuple)
            }
        }
    }
}

fn hash_fields(tuple: &Tuple, indexes: &[usize]) -> Result<u64> {
    let mut hasher = DefaultHasher::new();
    for &index in indexes {
        let field = tuple.field(index).ok_or_else(|| {
            FlowError::Execution(format!(
                "routing key references field {index} but tuple has arity {}",
                tuple.arity()
            ))
        })?;
        field.hash(&mut hasher);
    }
    Ok(hasher.finish())
}

type ExtractorMap = HashMap<String, Arc<dyn RoutingExtractor>>;

fn registry() -> &'static RwLock<ExtractorMap> {
    static REGISTRY: OnceLock<RwLock<ExtractorMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register or replace a named routing extractor.
///
/// Returns `true` when an existing extractor with the same name was replaced.
pub fn register_routing_extractor(extractor: Arc<dyn RoutingExtractor>) -> bool {
    registry()
        .write()
        .expect("routing registry lock poisoned")
        .insert(extractor.name().to_ascii_lowercase(), extractor)
        .is_some()
}

/// Deregister a named routing extractor.
///
/// Returns `true` when an existing extractor was removed.
pub fn deregister_routing_extractor(name: &str) -> bool {
    registry()
        .write()
        .expect("routing registry lock poisoned")
        .remove(&name.to_ascii_lowercase())
        .is_some()
}

/// Lookup a named routing extractor.
pub fn get_routing_extractor(name: &str) -> Option<Arc<dyn RoutingExtractor>> {
    registry()
        .read()
        .expect("routing registry lock poisoned")
        .get(&name.to_ascii_lowercase())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_field_values_hash_equal() {
        let key = RoutingKey::by_field(0);
        let a = Tuple::from_fields(&["k1", "x"]);
        let b = Tuple::from_fields(&["k1", "y"]);
        assert_eq!(key.key(&a).expect("key"), key.key(&b).expect("key"));
    }

    #[test]
    fn composite_covers_all_indexes() {
        let key = RoutingKey::composite(vec![0, 1]);
        let a = Tuple::from_fields(&["k1", "x"]);
        let b = Tuple::from_fields(&["k1", "y"]);
        assert_ne!(key.key(&a).expect("key"), key.key(&b).expect("key"));
    }

    #[test]
    fn missing_field_is_execution_error() {
        let key = RoutingKey::by_field(5);
        let err = key
            .key(&Tuple::from_fields(&["only"]))
            .expect_err("must fail");
        assert!(matches!(err, FlowError::Execution(_)));
    }

    #[test]
    fn named_extractor_round_trips_through_registry() {
        struct FirstCharExtractor;
        impl RoutingExtractor for FirstCharExtractor {
            fn name(&self) -> &str {
                "first_char"
            }
            fn key(&self, tuple: &Tuple) -> Result<u64> {
                Ok(tuple
                    .field(0)
                    .and_then(|f| f.chars().next())
                    .map(|c| c as u64)
                    .unwrap_or(0))
            }
        }

        register_routing_extractor(Arc::new(FirstCharExtractor));
        let key = RoutingKey::named("first_char");
        assert_eq!(key.key(&Tuple::from_fields(&["abc"])).expect("key"), 'a' as u64);
        assert!(deregister_routing_extractor("first_char"));

        let err = key
            .key(&Tuple::from_fields(&["abc"]))
            .expect_err("must fail");
        assert!(matches!(err, FlowError::Unsupported(_)));
    }

    #[test]
    fn routing_key_serializes_as_tagged_data() {
        let key = RoutingKey::by_field(0);
        let json = serde_json::to_string(&key).expect("encode");
        let back: RoutingKey = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, key);
    }
}
