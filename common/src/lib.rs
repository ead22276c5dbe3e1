pub mod api;
pub mod error;
pub mod ids;
pub mod job;
pub mod node_status;
pub mod policy;
pub mod status;
pub mod text;
pub mod wire;
pub mod wordcount;

pub use error::{NodeError, NodeResult};
pub use ids::{AttemptId, JobId, NodeId, TaskId};
pub use job::{
    AttemptStatus, ExecutorTask, JobDescriptor, JobStatus, QualifiedPath, TaskInput, TaskStatus,
};
pub use node_status::{NodeStatus, NodeStatusSnapshot};
pub use status::{Phase, PhasedStatus, State, Status};
