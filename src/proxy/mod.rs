//! The data staging proxy.
//!
//! `DataProxy` ties the collaborators together: it stages input data and
//! submits jobs (`submission`), reacts to scheduler notifications and starts
//! pulls (`dispatch`), and replays what it missed while disconnected
//! (`reconcile`). It is a cheap, cloneable handle; spawned work such as the
//! notification pump and pull completions holds a clone.

mod dispatch;
mod reconcile;
mod submission;

pub use submission::StagingOptions;

use crate::config::{validate_session_name, ProxyConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::events::{ChannelListener, EventConsumer, ListenerId, ListenerRegistry, ProxyEventListener};
use crate::model::AwaitedJob;
use crate::scheduler::{NotificationStream, SchedulerEvent, SchedulerPort};
use crate::storage::StoragePort;
use crate::store::AwaitedJobStore;
use crate::transfer::TransferPool;
use futures::StreamExt;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Initialized,
    Terminated,
}

struct ProxyInner {
    config: RwLock<ProxyConfig>,
    scheduler: Arc<dyn SchedulerPort>,
    storage: Arc<dyn StoragePort>,
    store: RwLock<Option<Arc<AwaitedJobStore>>>,
    pool: TransferPool,
    listeners: ListenerRegistry,
    pump: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Mutex<Lifecycle>,
}

/// Client-side proxy staging job data between the local filesystem and the
/// scheduler's shared storage.
#[derive(Clone)]
pub struct DataProxy {
    inner: Arc<ProxyInner>,
}

impl DataProxy {
    pub fn new(
        config: ProxyConfig,
        scheduler: Arc<dyn SchedulerPort>,
        storage: Arc<dyn StoragePort>,
    ) -> ProxyResult<Self> {
        config.validate()?;
        let pool = TransferPool::new(config.transfer_workers, storage.clone());
        Ok(Self {
            inner: Arc::new(ProxyInner {
                config: RwLock::new(config),
                scheduler,
                storage,
                store: RwLock::new(None),
                pool,
                listeners: ListenerRegistry::new(),
                pump: Mutex::new(None),
                lifecycle: Mutex::new(Lifecycle::Created),
            }),
        })
    }

    pub fn config(&self) -> ProxyResult<ProxyConfig> {
        Ok(self
            .inner
            .config
            .read()
            .map_err(|_| ProxyError::lock_poisoned("proxy config"))?
            .clone())
    }

    pub fn session_name(&self) -> ProxyResult<String> {
        Ok(self.config()?.session_name)
    }

    /// Change the session scoping the awaited-job store. Only allowed before
    /// the store is loaded by `init`.
    pub fn set_session_name(&self, name: &str) -> ProxyResult<()> {
        validate_session_name(name)?;
        let loaded = self
            .inner
            .store
            .read()
            .map_err(|_| ProxyError::lock_poisoned("awaited job store"))?
            .is_some();
        if loaded {
            return Err(ProxyError::InvalidState(
                "the session name cannot be changed once the awaited job store is loaded"
                    .to_string(),
            ));
        }
        self.inner
            .config
            .write()
            .map_err(|_| ProxyError::lock_poisoned("proxy config"))?
            .session_name = name.to_string();
        Ok(())
    }

    fn lifecycle(&self) -> ProxyResult<Lifecycle> {
        Ok(*self
            .inner
            .lifecycle
            .lock()
            .map_err(|_| ProxyError::lock_poisoned("proxy lifecycle"))?)
    }

    fn check_initialized(&self) -> ProxyResult<()> {
        match self.lifecycle()? {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Created => Err(ProxyError::InvalidState(
                "this proxy has not been initialized".to_string(),
            )),
            Lifecycle::Terminated => Err(ProxyError::InvalidState(
                "this proxy has been terminated and cannot be used any more".to_string(),
            )),
        }
    }

    fn store(&self) -> ProxyResult<Arc<AwaitedJobStore>> {
        self.inner
            .store
            .read()
            .map_err(|_| ProxyError::lock_poisoned("awaited job store"))?
            .clone()
            .ok_or_else(|| ProxyError::InvalidState("awaited job store is not loaded".to_string()))
    }

    fn load_store(&self) -> ProxyResult<()> {
        let config = self.config()?;
        let mut slot = self
            .inner
            .store
            .write()
            .map_err(|_| ProxyError::lock_poisoned("awaited job store"))?;
        if slot.is_none() {
            let store = AwaitedJobStore::load(
                &config.store_dir,
                &config.session_name,
                self.inner.storage.clone(),
                config.clear_transferring_on_load,
            )?;
            *slot = Some(Arc::new(store));
        }
        Ok(())
    }

    /// Load the awaited-job store, connect to the scheduler, subscribe to its
    /// notifications and replay what happened to awaited jobs meanwhile.
    ///
    /// A connection failure is returned but leaves the proxy initialized, so
    /// `reconnect` can be retried.
    pub async fn init(&self) -> ProxyResult<()> {
        {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock()
                .map_err(|_| ProxyError::lock_poisoned("proxy lifecycle"))?;
            match *lifecycle {
                Lifecycle::Created => {}
                Lifecycle::Initialized => {
                    return Err(ProxyError::InvalidState(
                        "this proxy is already initialized".to_string(),
                    ))
                }
                Lifecycle::Terminated => {
                    return Err(ProxyError::InvalidState(
                        "this proxy has been terminated and cannot be used any more".to_string(),
                    ))
                }
            }
            self.load_store()?;
            *lifecycle = Lifecycle::Initialized;
        }
        info!("Data proxy initialized for session '{}'", self.session_name()?);
        self.connect_and_sync().await
    }

    /// Drop the current connection and establish a new one, then reconcile.
    pub async fn reconnect(&self) -> ProxyResult<()> {
        self.check_initialized()?;
        self.stop_pump()?;
        if let Err(e) = self.inner.scheduler.disconnect().await {
            debug!("Ignoring error while disconnecting before reconnect: {}", e);
        }
        self.connect_and_sync().await
    }

    pub async fn disconnect(&self) -> ProxyResult<()> {
        self.check_initialized()?;
        self.stop_pump()?;
        self.inner.scheduler.disconnect().await?;
        info!("Disconnected from the scheduler");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.scheduler.is_connected()
    }

    /// Stop the proxy for good. With `wait_for_transfers` in-flight pulls run
    /// to completion first; otherwise they are abandoned and their tasks stay
    /// awaited for the next session.
    pub async fn terminate(&self, wait_for_transfers: bool) -> ProxyResult<()> {
        {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock()
                .map_err(|_| ProxyError::lock_poisoned("proxy lifecycle"))?;
            if *lifecycle == Lifecycle::Terminated {
                return Ok(());
            }
            *lifecycle = Lifecycle::Terminated;
        }

        self.stop_pump()?;
        self.inner.pool.shutdown(wait_for_transfers).await;
        if self.inner.scheduler.is_connected() {
            if let Err(e) = self.inner.scheduler.disconnect().await {
                warn!("Error while disconnecting from the scheduler: {}", e);
            }
        }

        let store = self
            .inner
            .store
            .write()
            .map_err(|_| ProxyError::lock_poisoned("awaited job store"))?
            .take();
        if let Some(store) = store {
            store.close()?;
        }
        info!("Data proxy terminated");
        Ok(())
    }

    async fn connect_and_sync(&self) -> ProxyResult<()> {
        self.inner.scheduler.connect().await?;
        let stream = self
            .inner
            .scheduler
            .subscribe(&SchedulerEvent::PROXY_EVENTS)
            .await?;
        self.start_pump(stream)?;
        info!("Connected to the scheduler, synchronizing awaited jobs");
        self.sync_awaited_jobs().await
    }

    fn start_pump(&self, mut stream: NotificationStream) -> ProxyResult<()> {
        let proxy = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if let Err(e) = proxy.dispatch(notification).await {
                    error!("Error while handling scheduler notification: {}", e);
                }
            }
            debug!("Scheduler notification stream ended");
        });
        let previous = self
            .inner
            .pump
            .lock()
            .map_err(|_| ProxyError::lock_poisoned("notification pump"))?
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn stop_pump(&self) -> ProxyResult<()> {
        let handle = self
            .inner
            .pump
            .lock()
            .map_err(|_| ProxyError::lock_poisoned("notification pump"))?
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    /// Register a listener for job/task updates and pull results.
    pub fn add_event_listener(&self, listener: Arc<dyn ProxyEventListener>) -> ProxyResult<ListenerId> {
        self.inner.listeners.add(listener)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> ProxyResult<bool> {
        self.inner.listeners.remove(id)
    }

    /// Register a channel-backed listener and return its receiving side.
    pub fn subscribe_events(&self) -> ProxyResult<(ListenerId, EventConsumer)> {
        let (listener, consumer) = ChannelListener::new();
        let id = self.add_event_listener(Arc::new(listener))?;
        Ok((id, consumer))
    }

    /// Stop awaiting a job. Its remote data is left in place.
    pub fn discard_job(&self, job_id: &str) -> ProxyResult<bool> {
        self.check_initialized()?;
        let discarded = self.store()?.discard(job_id)?;
        if discarded {
            info!("Discarded awaited job {}", job_id);
        }
        Ok(discarded)
    }

    /// Stop awaiting every job of the session. Remote data is left in place.
    pub fn discard_all_jobs(&self) -> ProxyResult<()> {
        self.check_initialized()?;
        self.store()?.discard_all()?;
        info!("Discarded all awaited jobs");
        Ok(())
    }

    pub fn awaited_job(&self, job_id: &str) -> ProxyResult<Option<AwaitedJob>> {
        self.store()?.get_job(job_id)
    }

    pub fn awaited_job_ids(&self) -> ProxyResult<Vec<String>> {
        self.store()?.list_ids()
    }

    /// Number of automatic pulls still running
    pub fn transfers_in_flight(&self) -> usize {
        self.inner.pool.in_flight()
    }
}
