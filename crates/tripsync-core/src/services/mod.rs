//! Service layer over the local database.
//!
//! Each service shares one `Arc<Mutex<Database>>` and is cheap to clone.

mod app;
mod local_store;
mod metadata;
mod queue;

pub use app::{remote_from_config, AppContext};
pub use local_store::{LocalStore, MergeOutcome, StoreEvent};
pub use metadata::SyncMetadataStore;
pub use queue::PendingOperationQueue;
