pub mod schema;

pub use schema::{default_config_dir, BridgeConfig, TraceConfig};
