//! The promotion control plane: per-session state, the global send tick,
//! post-send verification, and snapshot persistence.
//!
//! [`service::PromoterService`] is the composition root that wires these
//! to the client registry, rotation engine, and health checker.

pub mod compose;
pub mod dialogs;
pub mod persist;
pub mod scheduler;
pub mod service;
pub mod session;
pub mod verify;

pub use {
    persist::StatePersistence,
    scheduler::PromotionScheduler,
    service::{PromoterService, ServiceStatus},
    session::{PromotionOutcome, SessionState, SessionTracker},
    verify::{PendingVerification, VerificationQueue},
};
