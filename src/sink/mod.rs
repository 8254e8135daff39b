pub mod file;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::flow::Eviction;
use crate::protocol::Category;

pub use file::JsonFileSink;

/// Sink consumes dispatched events.
///
/// Calls run on the blocking pool, one job at a time per worker, and may
/// happen concurrently across categories. Each call owns its record.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Process one event. `eviction` is set when the job reports a flow
    /// leaving the registry.
    fn handle(
        &self,
        category: Category,
        event: Map<String, Value>,
        eviction: Option<&Eviction>,
    ) -> Result<()>;

    /// Flush buffered output. Called once after all workers have stopped.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
