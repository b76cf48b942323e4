//! CLI command implementations.
//!
//! | Module   | Commands handled   |
//! |----------|--------------------|
//! | `run`    | `Run`              |
//! | `state`  | `Status`, `Reset`  |
//! | `plan`   | `Plan`             |

pub mod plan;
pub mod run;
pub mod state;

pub use plan::cmd_plan;
pub use run::cmd_run;
pub use state::{cmd_reset, cmd_status};
