//! Configuration and persistent state

mod schema;
mod store;

pub use schema::{AppConfig, PipelineConfig};
pub use store::{ConfigStore, StoredParameterSet};
