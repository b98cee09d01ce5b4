//! Sync engine: remote collaborators, conflict classification, the cycle
//! orchestrator and its background scheduler.

mod conflict;
mod error;
mod http;
mod memory;
mod orchestrator;
mod remote;
mod scheduler;

pub use conflict::{Classification, ConflictResolver};
pub use error::{SyncError, SyncResult};
pub use http::HttpRemoteDataSource;
pub use memory::MemoryRemote;
pub use orchestrator::{SkipReason, SyncOrchestrator, SyncOutcome, SyncPhase, SyncReport};
pub use remote::{
    Applied, AuthProvider, BatchResult, Change, ConnectivityReceiver, NetworkMonitor,
    PushOutcome, RejectReason, RemoteDataSource, RemoteRow, SessionAuth,
};
pub use scheduler::{SchedulePolicy, SyncHandle, SyncScheduler};
