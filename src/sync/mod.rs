//! Sync session: engine, download queue and the async driver feeding them.

pub mod driver;
pub mod engine;
pub mod events;
pub mod queue;
pub mod transfer;

pub use engine::SyncEngine;
pub use events::SyncNotification;
pub use queue::{QueueEvent, TransferQueue, DEFAULT_MAX_PARALLEL_DOWNLOADS};
pub use transfer::{FileTransfer, QueueEntry, TransferRecord};
