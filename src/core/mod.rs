pub mod decision;
pub mod engine;
pub mod filter;
pub mod hash;
pub mod key;
pub mod record;
pub mod scheduler;
pub mod snapshot;

pub use decision::{Decision, DecisionEngine, DecisionPolicy, SkipReason, UploadReason, VerifyStrategy};
pub use engine::{SyncEngine, SyncError, SyncReport};
pub use filter::{SkipRule, SkipRules};
pub use hash::{ContentHasher, EtagHasher};
pub use key::KeyMapper;
pub use record::{RecordStore, SqliteRecordStore};
pub use scheduler::{SyncJob, TransferError, TransferScheduler, TransferSummary};
pub use snapshot::{SnapshotCache, SnapshotOrigin, SourceEntry};
