pub mod checkpoint;
pub mod config;
pub mod dag;
pub mod errors;
pub mod fleet;
pub mod gates;
pub mod isolation;
pub mod issue;
pub mod phase;
pub mod pipeline;
pub mod plan;
pub mod retry;
