//! Health Module
//!
//! Per-(key, model) availability tracking, retry scheduling and background probing.

pub mod backoff;
pub mod machine;
pub mod prober;
pub mod registry;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use machine::{ModelAvailability, ModelState, Transition, TransitionEvent};
pub use prober::{ProbeOutcome, ProbeReport};
pub use registry::ModelRegistry;
