//! Tuple processor and producer contracts consumed by worker units.
//!
//! Concrete operator logic (sort, join, scoring, ...) lives outside the
//! engine; everything is consumed through these two traits.

use async_trait::async_trait;
use flowmesh_common::{Result, UnitId};

use crate::tuple::Tuple;

/// Per-worker transformation unit owned by every processor worker.
///
/// Contract:
/// - `accept` must not block; produced tuples are buffered internally and
///   pulled through `has_next`/`next` (single consumer, not thread-safe)
/// - `on_register_source` is called once per distinct upstream sender before
///   its first tuple; `mark_source_completed` after its last
/// - `no_more` runs once all sources are exhausted and triggers any final
///   computation (flushing aggregates etc.)
#[async_trait]
pub trait TupleProcessor: Send {
    /// Async setup before any tuple arrives.
    async fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    fn on_register_source(&mut self, _source: &UnitId) {}

    fn accept(&mut self, tuple: Tuple) -> Result<()>;

    fn mark_source_completed(&mut self, _source: &UnitId) {}

    /// All sources exhausted.
    fn no_more(&mut self) -> Result<()> {
        Ok(())
    }

    fn has_next(&self) -> bool;

    fn next(&mut self) -> Option<Tuple>;

    fn dispose(&mut self) {}
}

/// Pull-based source owned by every producer worker.
#[async_trait]
pub trait TupleProducer: Send {
    /// Async setup before the first batch is pulled.
    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Next batch of up to `max` tuples; `Ok(None)` once exhausted.
    fn next_batch(&mut self, max: usize) -> Result<Option<Vec<Tuple>>>;

    fn close(&mut self) {}
}

/// Per-worker processor factory; invoked once per worker index at layer build.
pub type ProcessorFactory = Box<dyn Fn(usize) -> Box<dyn TupleProcessor> + Send + Sync>;

/// Per-worker producer factory; invoked once per worker index at layer build.
pub type ProducerFactory = Box<dyn Fn(usize) -> Box<dyn TupleProducer> + Send + Sync>;
