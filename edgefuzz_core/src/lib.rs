pub mod bitmap;
pub mod buffer;
pub mod config;
pub mod constants;
pub mod effector;
pub mod engine;
pub mod error;
pub mod executor;
pub mod extras;
pub mod fs;
pub mod queue;
pub mod stats;

pub use bitmap::{Bitmap, NewBits};
pub use buffer::{Endian, MutationBuffer};
pub use config::{EdgefuzzConfig, FuzzerSettings};
pub use effector::EffectorMap;
pub use engine::{Engine, EntryOutcome, RunOutcome};
pub use error::FuzzError;
pub use executor::{CommandExecutor, ExecStatus, Executor, InProcessExecutor};
pub use extras::{ExtraData, ExtrasStore};
pub use fs::{FileSystem, StdFileSystem};
pub use queue::{EntryId, Queue, QueueEntry, TopRated};
pub use stats::{FuzzerStats, RunCounters, Stage, StageStats};
