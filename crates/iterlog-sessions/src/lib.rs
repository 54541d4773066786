pub mod archive;
pub mod event;
pub mod replay;
pub mod stats;
pub mod store;
pub mod types;

pub use archive::SessionArchive;
pub use event::{EventKind, IterationEvent};
pub use replay::{apply_line, parse_replay, replay, ReplayLine, ReplaySummary};
pub use store::{
    IterationSnapshot, IterationStore, StoreDebug, StoreOptions, Subscription,
    DEFAULT_PENDING_CAPACITY,
};
pub use types::{
    AgentHistory, EndOutcome, Iteration, SensorKind, SensorReading, Session, StorageUsage,
    ToolCall, ToolStatus,
};
