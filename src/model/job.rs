//! Client-side description of a job submitted through the proxy.

use super::selector::FileSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A task of a job, as far as data staging is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Task name, unique within the job
    pub name: String,
    /// Files the task reads from the job's input space
    pub input_files: Vec<FileSelector>,
    /// Files the task produces in the job's output space
    pub output_files: Vec<FileSelector>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_input(mut self, selector: FileSelector) -> Self {
        self.input_files.push(selector);
        self
    }

    pub fn with_output(mut self, selector: FileSelector) -> Self {
        self.output_files.push(selector);
        self
    }

    /// All input selectors merged into one
    pub fn input_selector(&self) -> FileSelector {
        FileSelector::merged(&self.input_files)
    }
}

/// A job handed to the scheduler. The proxy rewrites its input/output space
/// URLs and adds metadata entries before submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    /// Input space URL as seen by compute nodes
    pub input_space: Option<String>,
    /// Output space URL as seen by compute nodes
    pub output_space: Option<String>,
    /// Free-form metadata forwarded to the scheduler
    pub generic_information: BTreeMap<String, String>,
    pub tasks: Vec<TaskDescriptor>,
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_input_space(mut self, url: impl Into<String>) -> Self {
        self.input_space = Some(url.into());
        self
    }

    pub fn with_output_space(mut self, url: impl Into<String>) -> Self {
        self.output_space = Some(url.into());
        self
    }

    pub fn with_task(mut self, task: TaskDescriptor) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn add_generic_information(&mut self, key: &str, value: impl Into<String>) {
        self.generic_information.insert(key.to_string(), value.into());
    }

    pub fn task(&self, name: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
