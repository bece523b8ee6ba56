//! Configuration: typed schema, TOML file discovery, environment overrides.
//!
//! Precedence is file < environment; `INSTANCE_ID` has no default and must
//! be set (and unique) on every node of the fleet.

mod loader;
mod schema;

pub use loader::{discover_and_load, load_config};
pub use schema::{AuthConfig, BrokerBackend, BrokerConfig, LimitsConfig, ServerConfig, StreamsyncConfig};
