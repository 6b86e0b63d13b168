//! Task data model and artifact grammar.

pub mod artifact;
pub mod model;

pub use artifact::{ApprovalDocument, Decision, TaskDocument};
pub use model::{Priority, Task, TaskType};
