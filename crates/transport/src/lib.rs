//! Transport abstraction over long-lived Telegram user sessions.
//!
//! The MTProto wire protocol itself lives outside this workspace; the core
//! sees an opaque [`RemoteClient`] that can connect, send, and fetch. This
//! crate owns the live handles: [`ClientRegistry`] creates and evicts them,
//! [`HealthChecker`] keeps them fit, and [`sim`] provides an in-process
//! implementation for tests and dry runs.

pub mod client;
pub mod error;
pub mod health;
pub mod registry;
pub mod sim;

pub use {
    client::{ChatEntity, ClientFactory, Dialog, MessageRef, RemoteClient, SelfInfo, SendOutcome,
             SendTarget},
    error::{ClientError, PermanentFailure},
    health::{HealthChecker, PoolObserver},
    registry::{ActiveConnection, ClientRegistry},
};
