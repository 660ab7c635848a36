pub mod config;
pub mod error;
pub mod strategy;

pub use config::LoadBalanceConfig;
pub use error::ConfigError;
pub use strategy::{LoadBalanceStrategy, RoutingGranularity};
