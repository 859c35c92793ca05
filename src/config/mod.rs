//! Configuration Module
//!
//! Relay configuration loading and validation.

pub mod loader;
pub mod provider;
pub mod relay;

pub use loader::ConfigLoader;
pub use provider::{ModelInfo, ModelPricing, ProviderSettings, RateLimitHeaders};
pub use relay::{EngineSettings, RelayConfig, RequestOverrides, VaultSettings};
