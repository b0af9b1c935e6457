//! Lifecycle types reported by the scheduler.

use serde::{Deserialize, Serialize};

/// Kinds of lifecycle notifications the scheduler can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerEvent {
    JobPendingToRunning,
    JobRunningToFinished,
    JobPendingToFinished,
    JobPaused,
    JobResumed,
    JobRestartedFromError,
    JobInError,
    TaskPendingToRunning,
    TaskRunningToFinished,
    TaskProgress,
    TaskInError,
    Killed,
    Shutdown,
    ShuttingDown,
    Stopped,
    Resumed,
}

impl SchedulerEvent {
    /// Events the proxy subscribes to
    pub const PROXY_EVENTS: [SchedulerEvent; 16] = [
        SchedulerEvent::JobRunningToFinished,
        SchedulerEvent::JobPendingToRunning,
        SchedulerEvent::JobPendingToFinished,
        SchedulerEvent::JobPaused,
        SchedulerEvent::JobResumed,
        SchedulerEvent::TaskPendingToRunning,
        SchedulerEvent::Killed,
        SchedulerEvent::Shutdown,
        SchedulerEvent::ShuttingDown,
        SchedulerEvent::Stopped,
        SchedulerEvent::Resumed,
        SchedulerEvent::TaskRunningToFinished,
        SchedulerEvent::TaskProgress,
        SchedulerEvent::JobRestartedFromError,
        SchedulerEvent::JobInError,
        SchedulerEvent::TaskInError,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Stalled,
    Paused,
    InError,
    Finished,
    Failed,
    Canceled,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Canceled | JobStatus::Killed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Submitted,
    Pending,
    Paused,
    Running,
    WaitingOnError,
    WaitingOnFailure,
    InError,
    Failed,
    NotStarted,
    NotRestarted,
    Aborted,
    Faulty,
    Finished,
    Skipped,
}

impl TaskStatus {
    /// Terminal statuses in which the task never produced output
    pub fn never_ran(self) -> bool {
        matches!(
            self,
            TaskStatus::Aborted
                | TaskStatus::NotStarted
                | TaskStatus::NotRestarted
                | TaskStatus::Skipped
        )
    }

    /// Terminal statuses after which output may exist
    pub fn has_output(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Faulty)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub job_id: String,
    /// Scheduler-wide task identifier
    pub task_id: String,
    /// Task name, unique within the job
    pub task_name: String,
    pub status: TaskStatus,
}

/// Snapshot of a job and all of its tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub info: JobInfo,
    pub tasks: Vec<TaskInfo>,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        self.info.status.is_terminal()
    }
}

/// Result of a task that completed on the scheduler side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub job_id: String,
    pub task_name: String,
    /// True when the task ended with an error
    pub had_error: bool,
}

/// A notification pushed by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerNotification {
    /// Scheduler-wide state change (killed, shutdown, ...)
    SchedulerState(SchedulerEvent),
    JobUpdated { event: SchedulerEvent, info: JobInfo },
    TaskUpdated { event: SchedulerEvent, info: TaskInfo },
}

impl SchedulerNotification {
    pub fn event(&self) -> SchedulerEvent {
        match self {
            SchedulerNotification::SchedulerState(event) => *event,
            SchedulerNotification::JobUpdated { event, .. } => *event,
            SchedulerNotification::TaskUpdated { event, .. } => *event,
        }
    }

    /// Job the notification is about, if any
    pub fn job_id(&self) -> Option<&str> {
        match self {
            SchedulerNotification::SchedulerState(_) => None,
            SchedulerNotification::JobUpdated { info, .. } => Some(&info.job_id),
            SchedulerNotification::TaskUpdated { info, .. } => Some(&info.job_id),
        }
    }
}
