//! Bounded pool executing push and pull copies.
//!
//! A `Semaphore` caps the number of copies running at once. Push batches are
//! awaited by the caller (`run_all`); pulls are spawned and tracked so that
//! `shutdown` can either wait for them or abandon them.

use crate::error::{ProxyError, ProxyResult};
use crate::model::FileSelector;
use crate::storage::StoragePort;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Local input folder to the scratch input folder
    Push,
    /// Scratch output folder to the local output folder
    Pull,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Push => write!(f, "push"),
            TransferDirection::Pull => write!(f, "pull"),
        }
    }
}

/// One copy of a task's files between two locations.
#[derive(Debug, Clone)]
pub struct TransferUnit {
    pub job_id: String,
    pub task_name: String,
    pub source: String,
    pub destination: String,
    pub selector: FileSelector,
    pub direction: TransferDirection,
}

impl TransferUnit {
    pub fn push(
        job_id: impl Into<String>,
        task_name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        selector: FileSelector,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_name: task_name.into(),
            source: source.into(),
            destination: destination.into(),
            selector,
            direction: TransferDirection::Push,
        }
    }

    pub fn pull(
        job_id: impl Into<String>,
        task_name: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        selector: FileSelector,
    ) -> Self {
        Self {
            direction: TransferDirection::Pull,
            ..Self::push(job_id, task_name, source, destination, selector)
        }
    }
}

pub struct TransferPool {
    workers: usize,
    permits: Arc<Semaphore>,
    storage: Arc<dyn StoragePort>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TransferPool {
    pub fn new(workers: usize, storage: Arc<dyn StoragePort>) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            storage,
            in_flight: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run one unit on a worker slot. Returns the number of files copied.
    pub async fn run(&self, unit: &TransferUnit) -> ProxyResult<usize> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::PoolShutdown)?;

        debug!(
            "Starting {} of task {} of job {}: {} -> {}",
            unit.direction, unit.task_name, unit.job_id, unit.source, unit.destination
        );
        let copied = self
            .storage
            .copy(&unit.source, &unit.destination, &unit.selector)
            .await
            .map_err(|e| {
                ProxyError::Transfer(format!(
                    "{} of task {} of job {} from {} to {} failed: {}",
                    unit.direction, unit.task_name, unit.job_id, unit.source, unit.destination, e
                ))
            })?;
        info!(
            "Finished {} of task {} of job {} ({} file(s))",
            unit.direction, unit.task_name, unit.job_id, copied
        );
        Ok(copied)
    }

    /// Run a batch concurrently and wait for all of it. The first failure is
    /// returned and the units still running are dropped.
    pub async fn run_all(&self, units: &[TransferUnit]) -> ProxyResult<usize> {
        if self.is_shutdown() {
            return Err(ProxyError::PoolShutdown);
        }
        let mut pending: FuturesUnordered<_> = units.iter().map(|unit| self.run(unit)).collect();
        let mut total = 0;
        while let Some(result) = pending.next().await {
            total += result?;
        }
        Ok(total)
    }

    /// Start a background job; it is tracked until it completes.
    pub fn spawn<F>(&self, work: F) -> ProxyResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return Err(ProxyError::PoolShutdown);
        }
        let handle = tokio::spawn(work);
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| ProxyError::lock_poisoned("transfer pool"))?;
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
        Ok(())
    }

    /// Number of spawned jobs not finished yet
    pub fn in_flight(&self) -> usize {
        match self.in_flight.lock() {
            Ok(mut in_flight) => {
                in_flight.retain(|h| !h.is_finished());
                in_flight.len()
            }
            Err(_) => 0,
        }
    }

    /// Stop accepting work. With `wait` the spawned jobs run to completion,
    /// otherwise they are aborted and any unit still waiting for a worker
    /// fails with `PoolShutdown`.
    pub async fn shutdown(&self, wait: bool) {
        self.closed.store(true, Ordering::SeqCst);
        let handles = match self.in_flight.lock() {
            Ok(mut in_flight) => std::mem::take(&mut *in_flight),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        if wait {
            info!("Waiting for {} transfer(s) to complete", handles.len());
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    warn!("Transfer job ended abnormally: {}", e);
                }
            }
            self.permits.close();
        } else {
            self.permits.close();
            if !handles.is_empty() {
                warn!("Abandoning {} in-flight transfer(s)", handles.len());
            }
            for handle in handles {
                handle.abort();
            }
        }
    }
}
