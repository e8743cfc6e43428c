//! Configuration Module
//!
//! Environment-driven configuration for the gateway.

mod settings;

pub use settings::{
    ConfigError, FeedSettings, GatewayConfig, ServerSettings, SessionSettings, find_dotenv_from,
    load_dotenv,
};
