//! Shared fixtures for the proxy integration tests
//!
//! `MockScheduler` plays the scheduler from scripted state, and
//! `RecordingStorage` wraps the local storage adapter to observe and inject
//! failures. `Harness` wires both into an initialized `DataProxy` over
//! temporary directories.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use jobstage::storage::{path_to_url, url_to_path};
use jobstage::{
    DataProxy, FileSelector, JobDescriptor, JobInfo, JobState, JobStatus, LocalFileStorage,
    NotificationStream, ProxyConfig, ProxyError, ProxyResult, SchedulerError, SchedulerEvent,
    SchedulerNotification, SchedulerPort, StoragePort, TaskDescriptor, TaskInfo, TaskResult,
    TaskStatus,
};
use jobstage::error::SchedulerResult;
use jobstage::logging::LoggingSystem;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Scheduler double driven by the test.
pub struct MockScheduler {
    connected: AtomicBool,
    next_job_id: AtomicU64,
    connects: AtomicUsize,
    user_spaces: Mutex<Vec<String>>,
    submit_error: Mutex<Option<SchedulerError>>,
    job_errors: Mutex<HashMap<String, SchedulerError>>,
    states: Mutex<HashMap<String, JobState>>,
    results: Mutex<HashMap<(String, String), TaskResult>>,
    result_errors: Mutex<HashMap<(String, String), SchedulerError>>,
    submitted: Mutex<Vec<JobDescriptor>>,
    events: Mutex<Option<mpsc::UnboundedSender<SchedulerNotification>>>,
}

impl MockScheduler {
    pub fn new(user_space: &str) -> Self {
        Self {
            connected: AtomicBool::new(false),
            next_job_id: AtomicU64::new(100),
            connects: AtomicUsize::new(0),
            user_spaces: Mutex::new(vec![
                "sftp://gateway/space".to_string(),
                user_space.to_string(),
            ]),
            submit_error: Mutex::new(None),
            job_errors: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            results: Mutex::new(HashMap::new()),
            result_errors: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
            events: Mutex::new(None),
        }
    }

    pub fn fail_next_submit(&self, error: SchedulerError) {
        *self.submit_error.lock().unwrap() = Some(error);
    }

    pub fn set_job_error(&self, job_id: &str, error: SchedulerError) {
        self.job_errors
            .lock()
            .unwrap()
            .insert(job_id.to_string(), error);
    }

    pub fn clear_job_error(&self, job_id: &str) {
        self.job_errors.lock().unwrap().remove(job_id);
    }

    pub fn set_job_state(&self, state: JobState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.info.job_id.clone(), state);
    }

    pub fn set_task_result(&self, job_id: &str, task_name: &str) {
        self.results.lock().unwrap().insert(
            (job_id.to_string(), task_name.to_string()),
            TaskResult {
                job_id: job_id.to_string(),
                task_name: task_name.to_string(),
                had_error: false,
            },
        );
    }

    /// Make `task_result` fail for one task
    pub fn set_task_result_error(&self, job_id: &str, task_name: &str, error: SchedulerError) {
        self.result_errors
            .lock()
            .unwrap()
            .insert((job_id.to_string(), task_name.to_string()), error);
    }

    pub fn submitted(&self) -> Vec<JobDescriptor> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Push a notification to the current subscription
    pub fn emit(&self, notification: SchedulerNotification) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(sender) => sender.send(notification).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SchedulerPort for MockScheduler {
    async fn connect(&self) -> SchedulerResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> SchedulerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.events.lock().unwrap().take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn submit(&self, job: &JobDescriptor) -> SchedulerResult<String> {
        if !self.is_connected() {
            return Err(SchedulerError::NotConnected("mock".to_string()));
        }
        if let Some(error) = self.submit_error.lock().unwrap().take() {
            return Err(error);
        }
        self.submitted.lock().unwrap().push(job.clone());
        Ok(self.next_job_id.fetch_add(1, Ordering::SeqCst).to_string())
    }

    async fn job_state(&self, job_id: &str) -> SchedulerResult<JobState> {
        if let Some(error) = self.job_errors.lock().unwrap().get(job_id) {
            return Err(error.clone());
        }
        self.states
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))
    }

    async fn task_result(
        &self,
        job_id: &str,
        task_name: &str,
    ) -> SchedulerResult<Option<TaskResult>> {
        let key = (job_id.to_string(), task_name.to_string());
        if let Some(error) = self.result_errors.lock().unwrap().get(&key) {
            return Err(error.clone());
        }
        Ok(self
            .results
            .lock()
            .unwrap()
            .get(&(job_id.to_string(), task_name.to_string()))
            .cloned())
    }

    async fn user_space_urls(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.user_spaces.lock().unwrap().clone())
    }

    async fn subscribe(&self, _events: &[SchedulerEvent]) -> SchedulerResult<NotificationStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

/// Local storage that records calls and can be told to fail or stall.
#[derive(Default)]
pub struct RecordingStorage {
    inner: LocalFileStorage,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub copies: Mutex<Vec<(String, String)>>,
    pub resolved: Mutex<Vec<String>>,
    fail_copies_from: Mutex<Option<String>>,
    fail_create: AtomicBool,
    copy_delay_ms: AtomicU64,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every copy whose source contains `fragment`
    pub fn fail_copies_from(&self, fragment: &str) {
        *self.fail_copies_from.lock().unwrap() = Some(fragment.to_string());
    }

    pub fn fail_folder_creation(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn delay_copies(&self, delay: Duration) {
        self.copy_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().unwrap().clone()
    }

    pub fn copies_from(&self, source: &str) -> usize {
        self.copies()
            .iter()
            .filter(|(from, _)| from == source)
            .count()
    }

    pub fn resolved(&self) -> Vec<String> {
        self.resolved.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl StoragePort for RecordingStorage {
    async fn resolve(&self, url: &str) -> ProxyResult<String> {
        self.resolved.lock().unwrap().push(url.to_string());
        self.inner.resolve(url).await
    }

    async fn create_folder(&self, url: &str) -> ProxyResult<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProxyError::Storage(format!("cannot create {}", url)));
        }
        self.created.lock().unwrap().push(url.to_string());
        self.inner.create_folder(url).await
    }

    async fn copy(
        &self,
        source: &str,
        destination: &str,
        selector: &FileSelector,
    ) -> ProxyResult<usize> {
        self.copies
            .lock()
            .unwrap()
            .push((source.to_string(), destination.to_string()));
        let delay = self.copy_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self.fail_copies_from.lock().unwrap().clone();
        if let Some(fragment) = failing {
            if source.contains(&fragment) {
                return Err(ProxyError::Storage(format!("injected failure for {}", source)));
            }
        }
        self.inner.copy(source, destination, selector).await
    }

    async fn delete(&self, url: &str) -> ProxyResult<()> {
        self.deleted.lock().unwrap().push(url.to_string());
        self.inner.delete(url).await
    }
}

/// A proxy wired to the doubles over temporary directories.
pub struct Harness {
    pub proxy: DataProxy,
    pub scheduler: Arc<MockScheduler>,
    pub storage: Arc<RecordingStorage>,
    pub space: TempDir,
    pub store_dir: TempDir,
    pub local_in: TempDir,
    pub local_out: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        let _ = LoggingSystem::init_default();
        let space = tempfile::tempdir().unwrap();
        let store_dir = tempfile::tempdir().unwrap();
        let local_in = tempfile::tempdir().unwrap();
        let local_out = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(MockScheduler::new(&path_to_url(space.path())));
        let storage = Arc::new(RecordingStorage::new());
        let proxy = build_proxy(store_dir.path(), scheduler.clone(), storage.clone());
        proxy.init().await.unwrap();
        Self {
            proxy,
            scheduler,
            storage,
            space,
            store_dir,
            local_in,
            local_out,
        }
    }

    /// Terminate the proxy and start a new one over the same store, as after
    /// a process restart.
    pub async fn restart(mut self) -> Self {
        self.proxy.terminate(true).await.unwrap();
        self.proxy = build_proxy(
            self.store_dir.path(),
            self.scheduler.clone(),
            self.storage.clone(),
        );
        self.proxy.init().await.unwrap();
        self
    }

    /// Node-side URL of the shared space; nodes and client share it here
    pub fn space_url(&self) -> String {
        path_to_url(self.space.path())
    }

    pub fn write_input(&self, relative: &str, content: &str) {
        write_file(&self.local_in.path().join(relative), content);
    }

    /// Write a produced file into the output folder of a task
    pub fn write_task_output(&self, job_id: &str, task_id: &str, relative: &str, content: &str) {
        let job = self.proxy.awaited_job(job_id).unwrap().unwrap();
        let pull_url = job
            .pull_url
            .unwrap()
            .replace(jobstage::constants::TASKID_PLACEHOLDER, task_id);
        let folder = url_to_path(&pull_url).unwrap();
        write_file(&folder.join(relative), content);
    }

    pub fn local_output(&self, relative: &str) -> PathBuf {
        self.local_out.path().join(relative)
    }

    pub async fn submit(&self, job: JobDescriptor, isolate: bool, automatic: bool) -> String {
        self.proxy
            .submit(
                job,
                Some(self.local_in.path()),
                Some(self.local_out.path()),
                isolate,
                automatic,
            )
            .await
            .unwrap()
    }

    pub fn awaited_tasks(&self, job_id: &str) -> Option<Vec<String>> {
        self.proxy
            .awaited_job(job_id)
            .unwrap()
            .map(|job| job.task_names())
    }
}

pub fn build_proxy(
    store_dir: &Path,
    scheduler: Arc<MockScheduler>,
    storage: Arc<RecordingStorage>,
) -> DataProxy {
    let config = ProxyConfig::new(store_dir.to_path_buf())
        .with_session_name("IntegrationTests")
        .with_transfer_workers(4);
    DataProxy::new(config, scheduler, storage).unwrap()
}

pub fn write_file(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Two tasks reading `*.in` files and producing `*.out` files
pub fn two_task_job(space_url: &str) -> JobDescriptor {
    JobDescriptor::new("staging-test")
        .with_input_space(space_url)
        .with_output_space(space_url)
        .with_task(
            TaskDescriptor::new("A")
                .with_input(FileSelector::including(["a.in"]))
                .with_output(FileSelector::including(["a*.out"])),
        )
        .with_task(
            TaskDescriptor::new("B")
                .with_input(FileSelector::including(["b.in"]))
                .with_output(FileSelector::including(["b*.out"])),
        )
}

pub fn task_info(job_id: &str, task_name: &str, task_id: &str, status: TaskStatus) -> TaskInfo {
    TaskInfo {
        job_id: job_id.to_string(),
        task_id: task_id.to_string(),
        task_name: task_name.to_string(),
        status,
    }
}

pub fn task_finished(job_id: &str, task_name: &str, task_id: &str) -> SchedulerNotification {
    SchedulerNotification::TaskUpdated {
        event: SchedulerEvent::TaskRunningToFinished,
        info: task_info(job_id, task_name, task_id, TaskStatus::Finished),
    }
}

pub fn job_updated(job_id: &str, status: JobStatus) -> SchedulerNotification {
    SchedulerNotification::JobUpdated {
        event: SchedulerEvent::JobRunningToFinished,
        info: JobInfo {
            job_id: job_id.to_string(),
            status,
        },
    }
}

pub fn job_state(job_id: &str, status: JobStatus, tasks: Vec<TaskInfo>) -> JobState {
    JobState {
        info: JobInfo {
            job_id: job_id.to_string(),
            status,
        },
        tasks,
    }
}

/// Poll `condition` until it holds or a few seconds have passed
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// Next pull result delivered to `consumer`, skipping lifecycle events
pub async fn next_pull_event(consumer: &mut jobstage::EventConsumer) -> jobstage::ProxyEvent {
    use jobstage::ProxyEvent;
    loop {
        match consumer.recv_timeout(Duration::from_secs(5)).await {
            Ok(event @ ProxyEvent::PullFinished { .. }) | Ok(event @ ProxyEvent::PullFailed { .. }) => {
                return event
            }
            Ok(_) => continue,
            Err(e) => panic!("no pull result received: {:?}", e),
        }
    }
}

/// Entries of a directory, empty when it does not exist
pub fn entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(read) => read
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    }
}
