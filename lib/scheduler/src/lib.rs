//! Polling scheduler for the patchbay engine.
//!
//! Two background tasks run for the engine's lifetime:
//!
//! - the **poll sweep** (every 30 s by default): finds due active workflows,
//!   runs their trigger detectors, filters candidates through the dedup
//!   store, and appends at most one job per workflow per poll
//! - the **log reaper** (every 24 h by default): trims event-log and
//!   processed-trigger rows past the retention horizon
//!
//! Detectors (C4) normalize provider items into [`TriggerEvent`]s carrying a
//! stable external id and a flattened payload for template substitution.

pub mod detector;
pub mod poller;
pub mod reaper;

pub use detector::{
    DispatcherEventSource, EventSource, StaticEventSource, TriggerEvent, TriggerKind,
};
pub use poller::Poller;
pub use reaper::Reaper;
