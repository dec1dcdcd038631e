//! Domain model (identities, task records, wire messages, errors).

pub mod command;
pub mod errors;
pub mod events;
pub mod ids;
pub mod keys;
pub mod lease;
pub mod node;
pub mod state;
pub mod task;

pub use command::{CommandKind, WorkerCommand, WorkerMessage};
pub use errors::{CoordError, ErrorKind, GateError, Result};
pub use events::LivenessEvent;
pub use ids::{SessionId, TaskId};
pub use lease::{LeaseBinding, LeaseId};
pub use node::{NodeIdentity, NodeKind};
pub use state::{RunState, TaskAction, TaskState};
pub use task::{TaskDefinition, validate_task_name};
