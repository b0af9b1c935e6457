//! Handling of scheduler notifications and output retrieval.

use super::DataProxy;
use crate::error::{ProxyError, ProxyResult};
use crate::events::ProxyEvent;
use crate::model::AwaitedJob;
use crate::scheduler::{JobInfo, JobStatus, SchedulerNotification, TaskInfo};
use crate::storage::path_to_url;
use crate::store::TransferClaim;
use crate::transfer::TransferUnit;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};

impl DataProxy {
    /// Apply a scheduler notification to the awaited jobs, then forward it to
    /// the listeners. Notifications about jobs or tasks that are not awaited
    /// are only forwarded.
    pub async fn dispatch(&self, notification: SchedulerNotification) -> ProxyResult<()> {
        let result = match &notification {
            SchedulerNotification::SchedulerState(event) => {
                debug!("Scheduler state changed: {:?}", event);
                Ok(())
            }
            SchedulerNotification::JobUpdated { info, .. } => self.update_job(info).await,
            SchedulerNotification::TaskUpdated { info, .. } => self.update_task(info).await,
        };
        self.inner.listeners.publish(&ProxyEvent::from(notification));
        result
    }

    async fn update_job(&self, info: &JobInfo) -> ProxyResult<()> {
        let store = self.store()?;
        let Some(awaited) = store.get_job(&info.job_id)? else {
            return Ok(());
        };
        match info.status {
            JobStatus::Killed | JobStatus::Canceled => {
                warn!(
                    "Job {} is {:?}, it will not be awaited any more (output folder was {:?})",
                    info.job_id, info.status, awaited.pull_url
                );
                store.remove_job(&info.job_id).await?;
            }
            JobStatus::Finished | JobStatus::Failed => {
                debug!("Job {} is {:?}", info.job_id, info.status);
            }
            _ => {}
        }
        Ok(())
    }

    async fn update_task(&self, info: &TaskInfo) -> ProxyResult<()> {
        let store = self.store()?;
        let Some(awaited) = store.set_task_id(&info.job_id, &info.task_name, &info.task_id)? else {
            return Ok(());
        };

        if info.status.never_ran() {
            debug!(
                "Task {} of job {} could not start ({:?}), no data will be transferred",
                info.task_name, info.job_id, info.status
            );
            store.remove_task(&info.job_id, &info.task_name).await?;
            return Ok(());
        }

        if !info.status.has_output() || !awaited.automatic_transfer {
            return Ok(());
        }

        let (Some(_), Some(local_folder)) = (&awaited.pull_url, &awaited.local_output_folder) else {
            debug!(
                "Job {} retrieves no output, task {} is done",
                info.job_id, info.task_name
            );
            store.remove_task(&info.job_id, &info.task_name).await?;
            return Ok(());
        };

        info!(
            "Task {} of job {} is {:?}, retrieving its output",
            info.task_name, info.job_id, info.status
        );
        if let Err(e) = self.start_pull(&awaited, &info.task_name, local_folder) {
            error!(
                "Error while handling data of task {} of job {}, the task will be removed (output left at {:?}): {}",
                info.task_name, info.job_id, awaited.pull_url, e
            );
            store.abandon_task(&info.job_id, &info.task_name).await?;
        }
        Ok(())
    }

    /// Claim the task and hand its pull to the transfer pool. Returns false
    /// when a pull is already in flight or the task is gone.
    fn start_pull(&self, job: &AwaitedJob, task_name: &str, local_folder: &Path) -> ProxyResult<bool> {
        let store = self.store()?;
        let unit = pull_unit(job, task_name, local_folder)?;

        match store.try_mark_transferring(&job.job_id, task_name)? {
            TransferClaim::Claimed => {}
            TransferClaim::AlreadyTransferring => {
                debug!(
                    "Output of task {} of job {} is already being transferred",
                    task_name, job.job_id
                );
                return Ok(false);
            }
            TransferClaim::Missing => return Ok(false),
        }

        let proxy = self.clone();
        let local_path = local_folder.to_path_buf();
        if let Err(e) = self
            .inner
            .pool
            .spawn(async move { proxy.complete_pull(unit, local_path).await })
        {
            store.set_task_transferring(&job.job_id, task_name, false)?;
            return Err(e);
        }
        Ok(true)
    }

    /// Body of an automatic pull: copy, then settle the task and notify.
    async fn complete_pull(&self, unit: TransferUnit, local_path: PathBuf) {
        let result = self.inner.pool.run(&unit).await;
        if let Err(ProxyError::PoolShutdown) = result {
            warn!(
                "Pull of task {} of job {} was abandoned, it will be retried next session",
                unit.task_name, unit.job_id
            );
            return;
        }
        let store = match self.store() {
            Ok(store) => store,
            Err(e) => {
                warn!(
                    "Pull of task {} of job {} ended after the store was closed: {}",
                    unit.task_name, unit.job_id, e
                );
                return;
            }
        };

        match result {
            Ok(_) => {
                if let Err(e) = store.remove_task(&unit.job_id, &unit.task_name).await {
                    error!(
                        "Could not remove task {} of job {} after its output was retrieved: {}",
                        unit.task_name, unit.job_id, e
                    );
                }
                self.inner.listeners.publish(&ProxyEvent::PullFinished {
                    job_id: unit.job_id,
                    task_name: unit.task_name,
                    local_path,
                });
            }
            Err(e) => {
                error!(
                    "Output of task {} of job {} could not be retrieved, it is left at {}: {}",
                    unit.task_name, unit.job_id, unit.source, e
                );
                if let Err(e) = store.abandon_task(&unit.job_id, &unit.task_name).await {
                    error!(
                        "Could not remove task {} of job {}: {}",
                        unit.task_name, unit.job_id, e
                    );
                }
                self.inner.listeners.publish(&ProxyEvent::PullFailed {
                    job_id: unit.job_id,
                    task_name: unit.task_name,
                    source_url: unit.source,
                    cause: match e {
                        ProxyError::Transfer(message) => message,
                        other => other.to_string(),
                    },
                });
            }
        }
    }

    /// Copy the output of a task of a manually transferred job, in the calling
    /// task. The task stops being awaited whether or not the copy succeeds.
    ///
    /// `local_folder` overrides the job's local output folder. Returns the
    /// folder the output was copied to.
    pub async fn pull_data(
        &self,
        job_id: &str,
        task_name: &str,
        local_folder: Option<&Path>,
    ) -> ProxyResult<PathBuf> {
        self.check_initialized()?;
        let store = self.store()?;

        let awaited = store.get_job(job_id)?.ok_or_else(|| {
            ProxyError::InvalidArgument(format!("The job {} is unknown or has been removed", job_id))
        })?;
        if awaited.automatic_transfer {
            return Err(ProxyError::InvalidState(format!(
                "Transfer of output files of job {} is handled automatically",
                job_id
            )));
        }
        let local_folder = match local_folder {
            Some(folder) if folder.is_absolute() => folder.to_path_buf(),
            Some(folder) => std::env::current_dir()?.join(folder),
            None => awaited.local_output_folder.clone().ok_or_else(|| {
                ProxyError::InvalidState(format!(
                    "The job {} does not define a local output folder, please provide one",
                    job_id
                ))
            })?,
        };
        let unit = pull_unit(&awaited, task_name, &local_folder)?;

        match store.try_mark_transferring(job_id, task_name)? {
            TransferClaim::Claimed => {}
            TransferClaim::AlreadyTransferring => {
                return Err(ProxyError::InvalidState(format!(
                    "Output of task {} of job {} is already being transferred",
                    task_name, job_id
                )))
            }
            TransferClaim::Missing => {
                return Err(ProxyError::InvalidArgument(format!(
                    "The task {} does not belong to job {} or has already been removed",
                    task_name, job_id
                )))
            }
        }

        debug!("Copying files from {} to {}", unit.source, unit.destination);
        let copied = self
            .inner
            .storage
            .copy(&unit.source, &unit.destination, &unit.selector)
            .await;
        match copied {
            Ok(count) => {
                store.remove_task(job_id, task_name).await?;
                info!(
                    "Retrieved {} file(s) of task {} of job {} into {}",
                    count,
                    task_name,
                    job_id,
                    local_folder.display()
                );
                Ok(local_folder)
            }
            Err(e) => {
                error!(
                    "Output of task {} of job {} could not be retrieved, it is left at {}: {}",
                    task_name, job_id, unit.source, e
                );
                store.abandon_task(job_id, task_name).await?;
                Err(ProxyError::Transfer(format!(
                    "pull of task {} of job {} from {} failed: {}",
                    task_name, job_id, unit.source, e
                )))
            }
        }
    }
}

/// Pull unit for a task, with the isolation placeholder resolved.
fn pull_unit(job: &AwaitedJob, task_name: &str, local_folder: &Path) -> ProxyResult<TransferUnit> {
    let task = job.task(task_name).ok_or_else(|| {
        ProxyError::InvalidArgument(format!(
            "The task {} does not belong to job {} or has already been removed",
            task_name, job.job_id
        ))
    })?;
    let source = job
        .task_pull_url(task)
        .map_err(ProxyError::InvalidState)?
        .ok_or_else(|| {
            ProxyError::InvalidState(format!(
                "The job {} has no output folder on shared storage",
                job.job_id
            ))
        })?;
    Ok(TransferUnit::pull(
        job.job_id.clone(),
        task_name,
        source,
        path_to_url(local_folder),
        task.output_selector(),
    ))
}
