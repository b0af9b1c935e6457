//! # JobStage
//!
//! Client-side data staging for a remote batch job scheduler. Jobs are
//! submitted with input and output folders on the client's filesystem; the
//! proxy pushes the input to shared storage before submission, tracks every
//! task whose output is still owed to the client, and pulls that output back
//! once the scheduler reports the task as done.
//!
//! ## Core Components
//!
//! * `store` - Persistent, session-scoped store of awaited jobs with crash recovery
//! * `transfer` - Bounded worker pool running push and pull copies
//! * `proxy` - Submission and staging, notification dispatch, reconciliation
//! * `events` - Fan-out of lifecycle and transfer notifications to listeners
//! * `scheduler` - Port to the scheduler and its lifecycle types
//! * `storage` - Port to the storage layer, URL helpers and a local adapter
//! * `model` - Awaited job/task records, job descriptors and file selectors
//! * `config` / `logging` / `error` - Configuration, log setup and error types
//!
//! ## Architecture
//!
//! The scheduler and the storage transport are collaborators reached through
//! the `SchedulerPort` and `StoragePort` traits. Tracking state lives in a
//! sled database, one per session name, and survives restarts: on
//! (re)connection the proxy asks the scheduler about every awaited job and
//! replays what it missed through the same code path as live notifications.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod proxy;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod transfer;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult, SchedulerError, SchedulerResult};
pub use events::{ChannelListener, EventConsumer, ListenerId, ProxyEvent, ProxyEventListener};
pub use model::{AwaitedJob, AwaitedTask, FileSelector, JobDescriptor, TaskDescriptor};
pub use proxy::{DataProxy, StagingOptions};
pub use scheduler::{
    JobInfo, JobState, JobStatus, NotificationStream, SchedulerEvent, SchedulerNotification,
    SchedulerPort, TaskInfo, TaskResult, TaskStatus,
};
pub use storage::{LocalFileStorage, StoragePort};
pub use store::AwaitedJobStore;
pub use transfer::{TransferPool, TransferUnit};
