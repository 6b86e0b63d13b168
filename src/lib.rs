//! taskwarden — durable, human-gated task orchestration.
//!
//! Work arrives as markdown artifacts in a partitioned store; lifecycle
//! state *is* the partition holding the artifact, and every state change is
//! one atomic move. The orchestrator plans and dispatches tasks, the
//! executor walks each plan with persistence after every step, and any step
//! with an irreversible external effect blocks on an explicit human
//! decision collected by the approval gate. Error recovery, a circuit
//! breaker, scheduled maintenance, and a checksummed audit journal round
//! out the engine.
//!
//! The engine never performs an external effect itself: deployments
//! register [`context::ActionHandler`]s per task type, and anything without
//! a handler is left for manual execution after approval.

pub mod approval;
pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod schedule;
pub mod store;
pub mod task;
pub mod watcher;

pub use config::WardenConfig;
pub use context::{ActionHandler, WardenContext};
pub use error::{Error, Result};
pub use store::{FsTaskStore, Partition, TaskStore};
