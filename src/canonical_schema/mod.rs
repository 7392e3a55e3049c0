/// Canonical DDL for the coordination store, applied via
/// [`crate::db::SwarmDb::initialize_schema`].
pub const CANONICAL_COORDINATOR_SCHEMA: &str = include_str!("schema.sql");

pub const CANONICAL_COORDINATOR_SCHEMA_PATH: &str = "src/canonical_schema/schema.sql";
