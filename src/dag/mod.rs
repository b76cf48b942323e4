//! Dependency scheduler for issue-level and task-level ordering.
//!
//! One abstraction serves both call sites: the fleet orchestrator schedules
//! issues with it, and the task plan validator orders an issue's
//! implementation tasks with it.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs and validates the node graph (unknown ids, cycles)
//! 2. **Scheduler** - Tracks node statuses, computes ready sets and propagates failure
//!
//! ## Example
//!
//! ```
//! use conveyor::dag::{DependencyScheduler, NodeStatus};
//!
//! let mut scheduler = DependencyScheduler::new();
//! scheduler.add_node("1", &[]).unwrap();
//! scheduler.add_node("2", &["1".to_string()]).unwrap();
//! scheduler.add_node("3", &["1".to_string(), "2".to_string()]).unwrap();
//!
//! assert_eq!(scheduler.ready_nodes(), vec!["1".to_string()]);
//!
//! scheduler.mark_failed("1").unwrap();
//! assert_eq!(scheduler.status("3"), Some(NodeStatus::Blocked));
//! assert!(scheduler.is_complete());
//! ```

mod builder;
mod scheduler;

pub use builder::{DagBuilder, NodeGraph, NodeIndex, NodeSpec};
pub use scheduler::{DependencyScheduler, NodeStatus, SchedulerSummary, WorkNode};
