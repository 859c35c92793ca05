//! Client Module
//!
//! Provider adapters, error classification and rate-limit header parsing.

pub mod adapter;
pub mod classifier;
pub mod http;
pub mod rate_limits;

pub use adapter::{AdapterRegistry, Completion, ProviderAdapter, ProviderFailure, TransportKind};
pub use classifier::{classify, ClassifiedError, ErrorKind};
pub use http::OpenAiCompatAdapter;
pub use rate_limits::RateLimitData;
