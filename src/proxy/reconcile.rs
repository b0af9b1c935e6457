//! Replay of notifications missed while the proxy was not listening.
//!
//! For every awaited job the scheduler is asked for the current state. Tasks
//! that already have a result go through the same path as a live "task
//! finished" notification, so a replay after the live event is a no-op.

use super::DataProxy;
use crate::error::{ProxyResult, SchedulerError};
use crate::scheduler::{SchedulerEvent, SchedulerNotification};
use log::{debug, error, warn};

impl DataProxy {
    /// Synchronize every awaited job with the scheduler.
    pub async fn sync_awaited_jobs(&self) -> ProxyResult<()> {
        let store = self.store()?;
        for job_id in store.list_ids()? {
            if let Err(e) = self.sync_awaited_job(&job_id).await {
                error!("Could not synchronize awaited job {}: {}", job_id, e);
            }
        }
        Ok(())
    }

    async fn sync_awaited_job(&self, job_id: &str) -> ProxyResult<()> {
        let store = self.store()?;
        let Some(awaited) = store.get_job(job_id)? else {
            return Ok(());
        };

        let state = match self.inner.scheduler.job_state(job_id).await {
            Ok(state) => state,
            Err(SchedulerError::UnknownJob(_)) => {
                warn!(
                    "Job {} is not known by the scheduler and will not be awaited any more. Its output may be copied manually from {:?}",
                    job_id, awaited.pull_url
                );
                store.discard(job_id)?;
                return Ok(());
            }
            Err(e @ SchedulerError::NotConnected(_)) | Err(e @ SchedulerError::Permission(_)) => {
                error!(
                    "Could not synchronize job {} ({}). It remains awaited and will be synchronized again at the next connection",
                    job_id, e
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        for task in &state.tasks {
            let Some(awaited_task) = awaited.task(&task.task_name) else {
                continue;
            };
            if awaited_task.transferring {
                continue;
            }
            match self.inner.scheduler.task_result(job_id, &task.task_name).await {
                Ok(Some(result)) => {
                    if result.had_error {
                        warn!(
                            "Task {} of job {} ended with an error, retrieving what it produced",
                            task.task_name, job_id
                        );
                    }
                    debug!("Synchronizing task {} of job {}", task.task_name, job_id);
                    self.dispatch(SchedulerNotification::TaskUpdated {
                        event: SchedulerEvent::TaskRunningToFinished,
                        info: task.clone(),
                    })
                    .await?;
                }
                Ok(None) => {}
                Err(SchedulerError::UnknownTask { .. }) => {
                    let pull_url = awaited.task_pull_url(awaited_task).ok().flatten();
                    warn!(
                        "Task {} of job {} is not known by the scheduler and will not be awaited any more. Its output may be copied manually from {:?}",
                        task.task_name, job_id, pull_url.or_else(|| awaited.pull_url.clone())
                    );
                    store.abandon_task(job_id, &task.task_name).await?;
                }
                Err(e) => error!(
                    "Could not get the result of task {} of job {}: {}",
                    task.task_name, job_id, e
                ),
            }
        }

        if state.is_finished() {
            self.dispatch(SchedulerNotification::JobUpdated {
                event: SchedulerEvent::JobRunningToFinished,
                info: state.info.clone(),
            })
            .await?;
        }
        Ok(())
    }
}
