//! Active-set rotation: which mobiles play this window.
//!
//! The engine keeps the candidate pool (every promote mobile), the
//! available pool (candidates not reported unhealthy), and the bounded
//! active subset. On a jittered timer it resamples the active subset and
//! issues disconnect/connect deltas to the client registry.

pub mod engine;

pub use engine::{RotationEngine, RotationRecord, RotationStatus};
