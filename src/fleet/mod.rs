//! Fleet coordination: leader election, work sharding, failover.

pub mod election;
pub mod sharder;
pub mod supervisor;

pub use election::LeaderElector;
pub use sharder::{compute_assignments, shard_hash, WorkSharder};
pub use supervisor::{classify, promotion_score, FailoverSupervisor, HealthStatus};
