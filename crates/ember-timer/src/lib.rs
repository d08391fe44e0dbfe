//! Hierarchical timer wheel owned by a single worker.

pub mod wheel;

pub use wheel::{FiredTimer, Repeat, TimerId, TimerWheel, NUM_WHEELS, TICK_MS, WHEEL_SIZE};
