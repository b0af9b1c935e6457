//! Plain data records exchanged between the proxy components.

pub mod awaited;
pub mod job;
pub mod selector;

pub use awaited::{AwaitedJob, AwaitedTask};
pub use job::{JobDescriptor, TaskDescriptor};
pub use selector::{CompiledSelector, FileSelector};
