//! Database layer: schema plus the two storage legs.

pub mod event_log;
pub mod materialized;
pub mod schema;

pub use event_log::{AppendOutcome, EventRecord};
pub use schema::init_database;
