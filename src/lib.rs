pub mod canonical_schema;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod paths;
pub mod types;

pub use db::{EventFilter, SwarmDb};
pub use error::{Result, SwarmError};
pub use events::{AgentEvent, CheckpointPayload, EventPayload, EventType};
pub use types::*;
