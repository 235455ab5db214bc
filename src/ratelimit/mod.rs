//! Outbound request policing: token buckets, tiered limits, compliance.

pub mod bucket;
pub mod monitor;
pub mod tiered;

pub use bucket::{PriorityQueue, TokenBucket};
pub use monitor::{ComplianceChecker, ComplianceViolation, UsageMonitor};
pub use tiered::{RequestError, TieredRateLimiter};
