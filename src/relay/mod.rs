//! Event handling: orchestration, ordering, retries and follow-up work.

pub mod album;
pub mod events;
pub mod lanes;
pub mod notify;
pub mod orchestrator;
pub mod patches;
pub mod retry;

pub use album::{AlbumCollector, spawn_flush_task};
pub use events::{
    DeliveryStatus, DestinationOutcome, EventKind, EventReport, RelayEvent, SkipReason,
};
pub use lanes::LaneRouter;
pub use notify::{Notification, Notifier, Throttle};
pub use orchestrator::Relay;
pub use patches::PatchQueue;
pub use retry::RetryPolicy;
