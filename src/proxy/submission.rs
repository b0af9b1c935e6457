//! Job submission with input staging and output preparation.

use super::DataProxy;
use crate::constants::{
    FILE_SCHEME_PREFIX, INPUT_FOLDER_NAME, METADATA_INPUT_FOLDER, METADATA_OUTPUT_FOLDER,
    METADATA_PULL_URL, METADATA_PUSH_URL, OUTPUT_FOLDER_NAME, TASKID_PLACEHOLDER,
};
use crate::error::{ProxyError, ProxyResult};
use crate::model::{AwaitedJob, AwaitedTask, JobDescriptor};
use crate::storage::{join_url, path_to_url};
use crate::transfer::TransferUnit;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Where a job's data comes from and goes to, and how output is retrieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingOptions {
    /// Local folder pushed to the job's input space; `None` disables input staging
    pub local_input_folder: Option<PathBuf>,
    /// Client-side URL of the shared storage backing the input space
    pub push_url: Option<String>,
    /// Local folder receiving task output; `None` disables output retrieval
    pub local_output_folder: Option<PathBuf>,
    /// Client-side URL of the shared storage backing the output space
    pub pull_url: Option<String>,
    /// Give every task its own output folder
    pub isolate_task_outputs: bool,
    /// Pull output as soon as a task ends instead of waiting for `pull_data`
    pub automatic_transfer: bool,
}

impl StagingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, folder: impl Into<PathBuf>) -> Self {
        self.local_input_folder = Some(folder.into());
        self
    }

    pub fn with_output(mut self, folder: impl Into<PathBuf>) -> Self {
        self.local_output_folder = Some(folder.into());
        self
    }

    pub fn with_push_url(mut self, url: impl Into<String>) -> Self {
        self.push_url = Some(url.into());
        self
    }

    pub fn with_pull_url(mut self, url: impl Into<String>) -> Self {
        self.pull_url = Some(url.into());
        self
    }

    pub fn isolate_task_outputs(mut self, isolate: bool) -> Self {
        self.isolate_task_outputs = isolate;
        self
    }

    pub fn automatic_transfer(mut self, automatic: bool) -> Self {
        self.automatic_transfer = automatic;
        self
    }
}

/// Scratch locations decided while staging a submission.
#[derive(Debug, Default)]
struct StagedJob {
    push_url: Option<String>,
    pull_url: Option<String>,
    /// Client-side scratch roots to delete if the submission fails
    rollback_roots: Vec<String>,
}

fn absolute_path(path: &Path) -> ProxyResult<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn non_empty(url: &Option<String>) -> Option<&str> {
    url.as_deref().filter(|u| !u.trim().is_empty())
}

/// `{user}_{timestamp}_{random}`: readable, and unique even for submissions
/// in the same millisecond.
pub(crate) fn new_folder_name() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H.%M.%S%.3f");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", user, timestamp, &suffix[..8])
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl DataProxy {
    /// Submit a job whose input lives in `local_input_folder` and whose output
    /// is wanted in `local_output_folder`, using the scheduler's local user
    /// space as shared storage.
    pub async fn submit(
        &self,
        job: JobDescriptor,
        local_input_folder: Option<&Path>,
        local_output_folder: Option<&Path>,
        isolate_task_outputs: bool,
        automatic_transfer: bool,
    ) -> ProxyResult<String> {
        let options = StagingOptions {
            local_input_folder: local_input_folder.map(Path::to_path_buf),
            local_output_folder: local_output_folder.map(Path::to_path_buf),
            isolate_task_outputs,
            automatic_transfer,
            ..Default::default()
        };
        self.submit_with_options(job, options).await
    }

    /// Submit a job with explicit staging options.
    ///
    /// Input is pushed before the job reaches the scheduler. If anything fails
    /// before the scheduler accepts the job, the scratch folders are deleted
    /// and nothing is recorded.
    pub async fn submit_with_options(
        &self,
        mut job: JobDescriptor,
        options: StagingOptions,
    ) -> ProxyResult<String> {
        self.check_initialized()?;
        let store = self.store()?;

        let local_input = options
            .local_input_folder
            .as_deref()
            .map(absolute_path)
            .transpose()?;
        let local_output = options
            .local_output_folder
            .as_deref()
            .map(absolute_path)
            .transpose()?;
        if let Some(input) = &local_input {
            if !input.is_dir() {
                return Err(ProxyError::InvalidArgument(format!(
                    "local input folder {} does not exist",
                    input.display()
                )));
            }
        }

        let push_base = match non_empty(&options.push_url) {
            Some(url) => Some(url.to_string()),
            None if local_input.is_some() => self.local_user_space().await?,
            None => None,
        };
        let pull_base = match non_empty(&options.pull_url) {
            Some(url) => Some(url.to_string()),
            None if local_output.is_some() => self.local_user_space().await?,
            None => None,
        };

        let push_base = match push_base {
            Some(url) => Some(self.inner.storage.resolve(&url).await?),
            None => None,
        };
        let pull_base = match pull_base {
            Some(url) => Some(self.inner.storage.resolve(&url).await?),
            None => None,
        };

        let folder_name = new_folder_name();
        let mut staged = StagedJob::default();
        let submitted = self
            .stage_and_submit(
                &mut job,
                local_input.as_deref(),
                local_output.as_deref(),
                push_base.as_deref(),
                pull_base.as_deref(),
                &folder_name,
                options.isolate_task_outputs,
                &mut staged,
            )
            .await;

        let job_id = match submitted {
            Ok(job_id) => job_id,
            Err(e) => {
                error!("Error while submitting job {}: {}", job.name, e);
                self.rollback(&staged).await;
                return Err(e);
            }
        };

        let awaited_tasks: HashMap<String, AwaitedTask> = job
            .tasks
            .iter()
            .map(|task| {
                (
                    task.name.clone(),
                    AwaitedTask::new(task.name.clone(), task.output_files.clone()),
                )
            })
            .collect();
        let awaited = AwaitedJob {
            job_id: job_id.clone(),
            local_input_folder: local_input,
            local_output_folder: local_output,
            input_space_url: job.input_space.clone(),
            output_space_url: job.output_space.clone(),
            push_url: staged.push_url,
            pull_url: staged.pull_url,
            isolate_task_outputs: options.isolate_task_outputs,
            automatic_transfer: options.automatic_transfer,
            awaited_tasks,
        };

        store.put_job(&job_id, &awaited).map_err(|e| {
            error!(
                "Job {} was submitted but could not be recorded, its output must be retrieved manually from {:?}: {}",
                job_id, awaited.pull_url, e
            );
            e
        })?;
        info!(
            "Submitted job {} ({} task(s) awaited)",
            job_id,
            awaited.awaited_tasks.len()
        );
        Ok(job_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stage_and_submit(
        &self,
        job: &mut JobDescriptor,
        local_input: Option<&Path>,
        local_output: Option<&Path>,
        push_base: Option<&str>,
        pull_base: Option<&str>,
        folder_name: &str,
        isolate_task_outputs: bool,
        staged: &mut StagedJob,
    ) -> ProxyResult<String> {
        if let (Some(local_input), Some(input_space), Some(push_base)) =
            (local_input, non_empty(&job.input_space), push_base)
        {
            let scratch = join_url(push_base, folder_name);
            let push_url = join_url(&scratch, INPUT_FOLDER_NAME);
            let input_space = join_url(&join_url(input_space, folder_name), INPUT_FOLDER_NAME);
            staged.rollback_roots.push(scratch);

            self.inner.storage.create_folder(&push_url).await?;
            debug!("Input space of job {} will be {}", job.name, input_space);
            job.input_space = Some(input_space);
            job.add_generic_information(METADATA_INPUT_FOLDER, local_input.to_string_lossy());
            job.add_generic_information(METADATA_PUSH_URL, push_url.clone());
            staged.push_url = Some(push_url);
        }

        if let (Some(local_output), Some(output_space), Some(pull_base)) =
            (local_output, non_empty(&job.output_space), pull_base)
        {
            let scratch = join_url(pull_base, folder_name);
            let output_folder = join_url(&scratch, OUTPUT_FOLDER_NAME);
            let mut output_space = join_url(&join_url(output_space, folder_name), OUTPUT_FOLDER_NAME);
            let mut pull_url = output_folder.clone();
            if isolate_task_outputs {
                output_space = join_url(&output_space, TASKID_PLACEHOLDER);
                pull_url = join_url(&pull_url, TASKID_PLACEHOLDER);
            }
            if !staged.rollback_roots.contains(&scratch) {
                staged.rollback_roots.push(scratch);
            }

            self.inner.storage.create_folder(&output_folder).await?;
            debug!("Output space of job {} will be {}", job.name, output_space);
            job.output_space = Some(output_space);
            job.add_generic_information(METADATA_OUTPUT_FOLDER, local_output.to_string_lossy());
            job.add_generic_information(METADATA_PULL_URL, pull_url.clone());
            staged.pull_url = Some(pull_url);
        }

        if let (Some(local_input), Some(push_url)) = (local_input, &staged.push_url) {
            let source = path_to_url(local_input);
            let units: Vec<TransferUnit> = job
                .tasks
                .iter()
                .filter(|task| !task.input_files.is_empty())
                .map(|task| {
                    TransferUnit::push(
                        job.name.clone(),
                        task.name.clone(),
                        source.clone(),
                        push_url.clone(),
                        task.input_selector(),
                    )
                })
                .collect();
            if !units.is_empty() {
                let copied = self.inner.pool.run_all(&units).await?;
                info!("Pushed {} input file(s) of job {} to {}", copied, job.name, push_url);
            }
        }

        Ok(self.inner.scheduler.submit(job).await?)
    }

    async fn rollback(&self, staged: &StagedJob) {
        for root in &staged.rollback_roots {
            match self.inner.storage.delete(root).await {
                Ok(()) => debug!("Removed scratch folder {}", root),
                Err(e) => warn!("Could not remove scratch folder {}: {}", root, e),
            }
        }
    }

    /// First user space root reachable as a local file system
    async fn local_user_space(&self) -> ProxyResult<Option<String>> {
        let urls = self.inner.scheduler.user_space_urls().await?;
        Ok(urls.into_iter().find(|url| url.starts_with(FILE_SCHEME_PREFIX)))
    }
}
