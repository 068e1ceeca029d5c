//! Controllers driving the scheduler over time.
//!
//! - [`StreamController`] follows the chain head and records a cursor
//! - [`ReorgController`] walks fix jobs backwards and re-exports divergent blocks
//!
//! Both hand block ranges to a [`RangeRunner`], either the in-process
//! scheduler or a pool of worker processes.

pub mod cursor;
pub mod reorg;
pub mod runner;
pub mod stream;

pub use cursor::{DbSyncRecorder, FileSyncRecorder, SyncRecorder};
pub use reorg::{
    FixJobStore, LocalBlockStore, MemoryFixJobStore, ReorgController, ReorgOptions, ReorgOutcome,
    ReorgRequest, SqliteFixJobStore,
};
pub use runner::{RangeRunner, SubprocessRunner};
pub use stream::{StepOutcome, StreamController, StreamOptions};
