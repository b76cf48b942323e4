//! Crash-safe checkpoints for issues and the fleet.
//!
//! Layout under the configured state directory:
//!
//! ```text
//! <state_dir>/
//!   fleet.json
//!   issues/
//!     issue-<N>.json
//! ```
//!
//! Every write goes through a temp file in the same directory followed by a
//! rename, so a crash leaves either the previous checkpoint or the new one.
//! In-memory state only changes once its write has succeeded.

mod atomic;
mod fleet;
mod issue;

pub use atomic::read_json_lenient;
pub use fleet::{
    FleetCheckpoint, FleetCheckpointState, FleetIssueRecord, FleetIssueStatus,
    fleet_checkpoint_path,
};
pub use issue::{
    CheckpointState, IssueCheckpoint, PhaseResult, PipelineStatus, issue_checkpoint_path,
};
