//! Market ingestion: price cache, sync clocks, push-driven propagation.

pub mod cache;
pub mod engine;

pub use cache::{CachedPrice, Observation, PriceCache};
pub use engine::IngestionEngine;
