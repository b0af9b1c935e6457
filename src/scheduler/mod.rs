//! Boundary to the remote batch scheduler.
//!
//! The scheduler itself (authentication, job execution, state queries) lives
//! outside this crate; the proxy only talks to it through `SchedulerPort`.

pub mod types;

pub use types::{
    JobInfo, JobState, JobStatus, SchedulerEvent, SchedulerNotification, TaskInfo, TaskResult,
    TaskStatus,
};

use crate::error::SchedulerResult;
use crate::model::JobDescriptor;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of lifecycle notifications delivered by a subscription
pub type NotificationStream = BoxStream<'static, SchedulerNotification>;

/// Operations the proxy consumes from the scheduler.
///
/// Send + Sync because the proxy shares one instance between the client-facing
/// calls, the notification pump and the transfer completions.
#[async_trait]
pub trait SchedulerPort: Send + Sync {
    /// Establish (or re-establish) the connection
    async fn connect(&self) -> SchedulerResult<()>;

    async fn disconnect(&self) -> SchedulerResult<()>;

    fn is_connected(&self) -> bool;

    /// Submit a job and return its scheduler-assigned identifier
    async fn submit(&self, job: &JobDescriptor) -> SchedulerResult<String>;

    async fn job_state(&self, job_id: &str) -> SchedulerResult<JobState>;

    /// `Ok(None)` while the task has not produced a result yet
    async fn task_result(&self, job_id: &str, task_name: &str)
        -> SchedulerResult<Option<TaskResult>>;

    /// Root URLs of the user storage space, client-side
    async fn user_space_urls(&self) -> SchedulerResult<Vec<String>>;

    /// Subscribe to the given notification kinds for the connected user's jobs.
    /// The stream ends when the connection is closed.
    async fn subscribe(&self, events: &[SchedulerEvent]) -> SchedulerResult<NotificationStream>;
}
