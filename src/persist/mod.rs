//! Durable run state: which items are done and what they produced.
//!
//! Both files are plain JSON documents rewritten whole through a
//! temp-then-rename sequence while an `fs2` lock on a sidecar `.lock`
//! file is held. A result is always appended before its id is marked.

mod fsutil;
mod progress;
mod recovery;
mod store;

pub use fsutil::atomic_write;
pub use progress::{ProgressStats, ProgressTracker, progress_path_for};
pub use recovery::{RecoveryCandidate, RecoveryManager, suggest_recovery_options};
pub use store::ResultStore;
