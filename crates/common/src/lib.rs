//! Shared identifier and clock helpers used across all crier crates.

pub mod ids;
pub mod time;

pub use {
    ids::{mobile_seed, normalize_channel_id},
    time::now_ms,
};
