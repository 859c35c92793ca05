//! Router Module
//!
//! Target resolution, candidate ordering and the selection engine.

pub mod candidates;
pub mod engine;
pub mod strategy;

pub use candidates::{sort_candidates, AttemptFailure, Candidate, SkipReason, SkippedCandidate};
pub use engine::{Payload, RelayRequest, RelayResponse, ResponseBody, SelectionEngine};
pub use strategy::{resolve, ModelRoute, ResolvedTarget, TargetKind};
