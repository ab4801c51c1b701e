pub mod config;
pub mod device;
pub mod events;
pub mod metadata;
pub mod sync;

pub use config::{SyncConfig, SyncMode, TransformParams};
pub use events::{EventSink, RunStatus, SyncEvent, SyncOutcome, SyncSummary};
pub use sync::engine::{SyncEngine, SyncError, SyncHandle};
