//! Persistent-store interfaces consumed by the promotion core.
//!
//! The core reads and mutates channel metadata, reads message templates,
//! and reads/expires account records; the concrete backends live outside
//! this workspace. [`memory`] provides `HashMap`-backed implementations
//! for tests and dry runs.

pub mod memory;
pub mod notifier;
pub mod records;
pub mod store;

pub use {
    notifier::{BannedFeed, Notifier, NotifyEvent},
    records::{AccountRecord, ChannelPatch, ChannelRecord},
    store::{AccountStore, ChannelStore, TemplateStore},
};
