pub mod builder;
pub mod cleanup;
pub mod dag;
pub mod error;
pub mod job;
pub mod task;
pub mod worker;
pub mod workflow;

pub use builder::{build, BuildOptions};
pub use cleanup::{CleanupRequest, CleanupSummary, JobCleanupOutcome, RetentionPolicy};
pub use dag::TaskGraph;
pub use error::BuildError;
pub use job::{Job, JobEvent, JobId, JobStatus, SubmitResponse};
pub use task::{
    ResourceSpec, Task, TaskAssignment, TaskCategory, TaskId, TaskOutcome, TaskStatus,
};
pub use worker::{
    TaskAssignmentRequest, TaskAssignmentResponse, TaskCompleteRequest, TaskCompleteResponse,
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
pub use workflow::{WorkflowRequest, WorkflowType};
