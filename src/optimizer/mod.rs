//! Outbound request shaping: batching, bounded fan-out, deduplication.

pub mod batcher;
pub mod dedup;
pub mod fanout;

pub use batcher::{BatchPayload, BatchTransport, RequestBatcher};
pub use dedup::RequestDeduplicator;
pub use fanout::{optimize_market_fetch, run_bounded};
