//! Backing store for campaigns, step records and messages.
//!
//! Every cross-worker decision (claiming a campaign or a step, inserting a
//! step under its unique key, resolving a claimed step) is a single atomic
//! conditional update in the store: per-entry locking in `MemoryStore`,
//! Lua scripts in `RedisStore`. `RedisEngagementTracker` keeps engagement
//! events next to the store so every worker gates on the same data.

#![warn(clippy::unwrap_used)]

pub mod memory;
pub mod redis_engagement;
pub mod redis_store;
pub mod repository;

pub use memory::MemoryStore;
pub use redis_engagement::RedisEngagementTracker;
pub use redis_store::RedisStore;
pub use repository::{latest_per_recipient, CascadeReport, DripStore, InsertOutcome, StepClaim};
