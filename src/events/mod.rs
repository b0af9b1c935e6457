//! Fan-out of scheduler and transfer notifications to client listeners.
//!
//! Listeners are called synchronously from the dispatching task, one after
//! the other, on a snapshot of the registry. A listener that returns an error
//! or panics is unregistered after the pass.

use crate::error::{ProxyError, ProxyResult};
use crate::scheduler::{JobInfo, SchedulerEvent, SchedulerNotification, TaskInfo};
use log::{debug, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Callbacks for job/task lifecycle updates and pull results.
///
/// Every method defaults to doing nothing, so implementors only override
/// what they care about.
pub trait ProxyEventListener: Send + Sync {
    fn scheduler_state_updated(&self, _event: SchedulerEvent) -> ProxyResult<()> {
        Ok(())
    }

    fn job_state_updated(&self, _event: SchedulerEvent, _info: &JobInfo) -> ProxyResult<()> {
        Ok(())
    }

    fn task_state_updated(&self, _event: SchedulerEvent, _info: &TaskInfo) -> ProxyResult<()> {
        Ok(())
    }

    /// Output of a task has been copied to `local_path`
    fn pull_data_finished(
        &self,
        _job_id: &str,
        _task_name: &str,
        _local_path: &Path,
    ) -> ProxyResult<()> {
        Ok(())
    }

    /// Output of a task could not be copied; it is left at `source_url`
    fn pull_data_failed(
        &self,
        _job_id: &str,
        _task_name: &str,
        _source_url: &str,
        _cause: &ProxyError,
    ) -> ProxyResult<()> {
        Ok(())
    }
}

/// Owned form of every notification a listener can receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    SchedulerState(SchedulerEvent),
    JobUpdated {
        event: SchedulerEvent,
        info: JobInfo,
    },
    TaskUpdated {
        event: SchedulerEvent,
        info: TaskInfo,
    },
    PullFinished {
        job_id: String,
        task_name: String,
        local_path: PathBuf,
    },
    PullFailed {
        job_id: String,
        task_name: String,
        source_url: String,
        cause: String,
    },
}

impl From<SchedulerNotification> for ProxyEvent {
    fn from(notification: SchedulerNotification) -> Self {
        match notification {
            SchedulerNotification::SchedulerState(event) => ProxyEvent::SchedulerState(event),
            SchedulerNotification::JobUpdated { event, info } => ProxyEvent::JobUpdated { event, info },
            SchedulerNotification::TaskUpdated { event, info } => {
                ProxyEvent::TaskUpdated { event, info }
            }
        }
    }
}

impl ProxyEvent {
    fn deliver_to(&self, listener: &dyn ProxyEventListener) -> ProxyResult<()> {
        match self {
            ProxyEvent::SchedulerState(event) => listener.scheduler_state_updated(*event),
            ProxyEvent::JobUpdated { event, info } => listener.job_state_updated(*event, info),
            ProxyEvent::TaskUpdated { event, info } => listener.task_state_updated(*event, info),
            ProxyEvent::PullFinished {
                job_id,
                task_name,
                local_path,
            } => listener.pull_data_finished(job_id, task_name, local_path),
            ProxyEvent::PullFailed {
                job_id,
                task_name,
                source_url,
                cause,
            } => listener.pull_data_failed(
                job_id,
                task_name,
                source_url,
                &ProxyError::Transfer(cause.clone()),
            ),
        }
    }
}

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ProxyEventListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ProxyEventListener>) -> ProxyResult<ListenerId> {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .write()
            .map_err(|_| ProxyError::lock_poisoned("listener registry"))?
            .push((id, listener));
        Ok(id)
    }

    pub fn remove(&self, id: ListenerId) -> ProxyResult<bool> {
        let mut listeners = self
            .listeners
            .write()
            .map_err(|_| ProxyError::lock_poisoned("listener registry"))?;
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        Ok(listeners.len() != before)
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener. Returns how many accepted it.
    pub fn publish(&self, event: &ProxyEvent) -> usize {
        let snapshot = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                warn!("Listener registry lock poisoned, dropping event {:?}", event);
                return 0;
            }
        };

        let mut broken = Vec::new();
        for (id, listener) in &snapshot {
            match catch_unwind(AssertUnwindSafe(|| event.deliver_to(listener.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Listener {:?} failed ({}), removing it", id, e);
                    broken.push(*id);
                }
                Err(_) => {
                    warn!("Listener {:?} panicked, removing it", id);
                    broken.push(*id);
                }
            }
        }

        if !broken.is_empty() {
            if let Ok(mut listeners) = self.listeners.write() {
                listeners.retain(|(id, _)| !broken.contains(id));
            }
        }
        debug!(
            "Delivered {:?} to {} listener(s)",
            event,
            snapshot.len() - broken.len()
        );
        snapshot.len() - broken.len()
    }
}

/// Listener forwarding every event into a channel.
///
/// Once its `EventConsumer` is dropped the listener errors and the registry
/// unregisters it.
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<ProxyEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, EventConsumer) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventConsumer { receiver })
    }

    fn forward(&self, event: ProxyEvent) -> ProxyResult<()> {
        self.sender
            .send(event)
            .map_err(|_| ProxyError::InvalidState("event consumer dropped".to_string()))
    }
}

impl ProxyEventListener for ChannelListener {
    fn scheduler_state_updated(&self, event: SchedulerEvent) -> ProxyResult<()> {
        self.forward(ProxyEvent::SchedulerState(event))
    }

    fn job_state_updated(&self, event: SchedulerEvent, info: &JobInfo) -> ProxyResult<()> {
        self.forward(ProxyEvent::JobUpdated {
            event,
            info: info.clone(),
        })
    }

    fn task_state_updated(&self, event: SchedulerEvent, info: &TaskInfo) -> ProxyResult<()> {
        self.forward(ProxyEvent::TaskUpdated {
            event,
            info: info.clone(),
        })
    }

    fn pull_data_finished(&self, job_id: &str, task_name: &str, local_path: &Path) -> ProxyResult<()> {
        self.forward(ProxyEvent::PullFinished {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            local_path: local_path.to_path_buf(),
        })
    }

    fn pull_data_failed(
        &self,
        job_id: &str,
        task_name: &str,
        source_url: &str,
        cause: &ProxyError,
    ) -> ProxyResult<()> {
        self.forward(ProxyEvent::PullFailed {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            source_url: source_url.to_string(),
            cause: match cause {
                ProxyError::Transfer(message) => message.clone(),
                other => other.to_string(),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRecvError {
    Timeout,
    Disconnected,
}

/// Receiving side of a `ChannelListener`
pub struct EventConsumer {
    receiver: mpsc::UnboundedReceiver<ProxyEvent>,
}

impl EventConsumer {
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        self.receiver.recv().await
    }

    pub async fn recv_timeout(&mut self, duration: Duration) -> Result<ProxyEvent, EventRecvError> {
        match timeout(duration, self.receiver.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(EventRecvError::Disconnected),
            Err(_) => Err(EventRecvError::Timeout),
        }
    }

    pub fn try_recv(&mut self) -> Option<ProxyEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<ProxyEvent> {
        UnboundedReceiverStream::new(self.receiver)
    }
}
