//! Ledger Module
//!
//! Quota accounting and the append-only usage/error history.

pub mod history;
pub mod quota;

pub use history::{
    ErrorLogEntry, History, HistoryQuery, LogSource, Severity, UsageDataPoint, UsageSummary,
};
pub use quota::{KeyQuota, QuotaLedger};
