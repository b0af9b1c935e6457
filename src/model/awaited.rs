//! Records of jobs and tasks whose output is still owed to the client.

use super::selector::FileSelector;
use crate::constants::TASKID_PLACEHOLDER;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A task of an awaited job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitedTask {
    pub name: String,
    /// Assigned by the scheduler once the task starts
    pub task_id: Option<String>,
    /// True while a pull for this task is in flight
    pub transferring: bool,
    /// Selectors describing which produced files form the task output
    pub output_selectors: Vec<FileSelector>,
}

impl AwaitedTask {
    pub fn new(name: impl Into<String>, output_selectors: Vec<FileSelector>) -> Self {
        Self {
            name: name.into(),
            task_id: None,
            transferring: false,
            output_selectors,
        }
    }

    /// All output selectors merged into one
    pub fn output_selector(&self) -> FileSelector {
        FileSelector::merged(&self.output_selectors)
    }
}

/// A job submitted with local data support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitedJob {
    pub job_id: String,
    pub local_input_folder: Option<PathBuf>,
    pub local_output_folder: Option<PathBuf>,
    /// Rewritten input space, node-side
    pub input_space_url: Option<String>,
    /// Rewritten output space, node-side
    pub output_space_url: Option<String>,
    /// Scratch input folder, client-side
    pub push_url: Option<String>,
    /// Scratch output folder, client-side
    pub pull_url: Option<String>,
    pub isolate_task_outputs: bool,
    pub automatic_transfer: bool,
    pub awaited_tasks: HashMap<String, AwaitedTask>,
}

impl AwaitedJob {
    pub fn task(&self, name: &str) -> Option<&AwaitedTask> {
        self.awaited_tasks.get(name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut AwaitedTask> {
        self.awaited_tasks.get_mut(name)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.awaited_tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Client-side URL the output of `task` is pulled from.
    ///
    /// With isolated outputs the placeholder segment is replaced by the task id,
    /// which therefore must be known. `None` when the job has no pull URL.
    pub fn task_pull_url(&self, task: &AwaitedTask) -> Result<Option<String>, String> {
        let Some(pull_url) = &self.pull_url else {
            return Ok(None);
        };
        if !self.isolate_task_outputs {
            return Ok(Some(pull_url.clone()));
        }
        match &task.task_id {
            Some(task_id) => Ok(Some(pull_url.replace(TASKID_PLACEHOLDER, task_id))),
            None => Err(format!(
                "task {} of job {} has no task id yet, its isolated output folder is unknown",
                task.name, self.job_id
            )),
        }
    }

    /// Client-side scratch folders to delete once the job is no longer awaited.
    ///
    /// With isolated outputs the pull URL ends with the placeholder segment, so
    /// the output root is its parent as computed by `parent`.
    pub fn scratch_roots<F>(&self, parent: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut roots = Vec::new();
        if let Some(push_url) = &self.push_url {
            roots.push(push_url.clone());
        }
        if let Some(pull_url) = &self.pull_url {
            let root = if self.isolate_task_outputs {
                parent(pull_url).unwrap_or_else(|| pull_url.clone())
            } else {
                pull_url.clone()
            };
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(isolate: bool) -> AwaitedJob {
        let mut tasks = HashMap::new();
        tasks.insert("A".to_string(), AwaitedTask::new("A", vec![]));
        AwaitedJob {
            job_id: "7".to_string(),
            local_input_folder: None,
            local_output_folder: Some(PathBuf::from("/tmp/out")),
            input_space_url: None,
            output_space_url: Some("file:///shared/u_1/output".to_string()),
            push_url: Some("file:///home/u/space/u_1/input".to_string()),
            pull_url: Some(if isolate {
                format!("file:///home/u/space/u_1/output/{}", TASKID_PLACEHOLDER)
            } else {
                "file:///home/u/space/u_1/output".to_string()
            }),
            isolate_task_outputs: isolate,
            automatic_transfer: true,
            awaited_tasks: tasks,
        }
    }

    #[test]
    fn isolated_pull_url_requires_task_id() {
        let mut job = job(true);
        let task = job.task("A").unwrap().clone();
        assert!(job.task_pull_url(&task).is_err());

        job.task_mut("A").unwrap().task_id = Some("17".to_string());
        let task = job.task("A").unwrap().clone();
        assert_eq!(
            job.task_pull_url(&task).unwrap().as_deref(),
            Some("file:///home/u/space/u_1/output/17")
        );
    }

    #[test]
    fn scratch_roots_ascend_above_placeholder() {
        assert_eq!(
            job(true).scratch_roots(crate::storage::parent_url),
            vec![
                "file:///home/u/space/u_1/input".to_string(),
                "file:///home/u/space/u_1/output".to_string()
            ]
        );
        assert_eq!(job(false).scratch_roots(crate::storage::parent_url).len(), 2);
    }
}
