//! Persistent, session-scoped store of awaited jobs.
//!
//! One sled database per session name under the configured base directory.
//! Entries are JSON-encoded `AwaitedJob`s keyed by job id; every mutation is a
//! compare-and-swap on a single key followed by a flush, so concurrent updates
//! of different jobs never block each other and updates of the same job are
//! serialized without an extra lock.

use crate::config::validate_session_name;
use crate::constants::STORE_SCHEMA_VERSION;
use crate::error::{ProxyError, ProxyResult};
use crate::model::AwaitedJob;
use crate::storage::StoragePort;
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const JOBS_TREE: &str = "awaited_jobs";
const METADATA_TREE: &str = "metadata";
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Outcome of trying to flag a task as transferring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferClaim {
    /// The flag was clear and is now set; the caller owns the pull
    Claimed,
    /// Another pull is already in flight
    AlreadyTransferring,
    /// The job or the task is no longer awaited
    Missing,
}

pub struct AwaitedJobStore {
    session_name: String,
    path: PathBuf,
    db: sled::Db,
    jobs_tree: sled::Tree,
    metadata_tree: sled::Tree,
    storage: Arc<dyn StoragePort>,
}

fn encode_job(job: &AwaitedJob) -> ProxyResult<Vec<u8>> {
    Ok(serde_json::to_vec(job)?)
}

fn decode_job(bytes: &[u8]) -> ProxyResult<AwaitedJob> {
    serde_json::from_slice(bytes)
        .map_err(|e| ProxyError::Schema(format!("unreadable awaited job entry: {}", e)))
}

impl AwaitedJobStore {
    /// Open (or create) the store of `session_name` under `base_dir`.
    ///
    /// A store that cannot be read under the current layout is discarded with
    /// all of its files and recreated empty, then loaded once more.
    pub fn load(
        base_dir: &Path,
        session_name: &str,
        storage: Arc<dyn StoragePort>,
        clear_transferring: bool,
    ) -> ProxyResult<Self> {
        validate_session_name(session_name)?;
        std::fs::create_dir_all(base_dir)?;

        let store = match Self::open(base_dir, session_name, storage.clone()) {
            Ok(store) => store,
            Err(e @ ProxyError::InvalidState(_)) => return Err(e),
            Err(e) => {
                error!(
                    "Error occurred when loading awaited job store {} ({}), now cleaning it and retrying. Awaited jobs of this session are lost.",
                    base_dir.join(session_name).display(),
                    e
                );
                Self::destroy_session_files(base_dir, session_name);
                let store = Self::open(base_dir, session_name, storage).map_err(|e| {
                    ProxyError::Store(format!(
                        "Error when loading awaited job store (even after cleaning it) {}: {}",
                        base_dir.join(session_name).display(),
                        e
                    ))
                })?;
                info!("Loading of awaited job store successful after clean.");
                store
            }
        };

        if clear_transferring {
            store.clear_transferring_flags()?;
        }
        info!(
            "Loaded awaited job store '{}' with {} job(s)",
            store.session_name,
            store.jobs_tree.len()
        );
        Ok(store)
    }

    fn open(base_dir: &Path, session_name: &str, storage: Arc<dyn StoragePort>) -> ProxyResult<Self> {
        let path = base_dir.join(session_name);
        info!("Loading awaited job store from {}", path.display());
        let db = sled::open(&path).map_err(|e| match e {
            sled::Error::Io(ref io) if io.kind() == std::io::ErrorKind::WouldBlock => {
                ProxyError::InvalidState(format!(
                    "awaited job store {} is in use by another process",
                    path.display()
                ))
            }
            other => ProxyError::from(other),
        })?;
        let jobs_tree = db.open_tree(JOBS_TREE)?;
        let metadata_tree = db.open_tree(METADATA_TREE)?;

        let store = Self {
            session_name: session_name.to_string(),
            path,
            db,
            jobs_tree,
            metadata_tree,
            storage,
        };
        store.check_schema()?;
        Ok(store)
    }

    fn check_schema(&self) -> ProxyResult<()> {
        match self.metadata_tree.get(SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let version: u32 = serde_json::from_slice(&bytes).map_err(|e| {
                    ProxyError::Schema(format!("unreadable schema version: {}", e))
                })?;
                if version != STORE_SCHEMA_VERSION {
                    return Err(ProxyError::Schema(format!(
                        "store schema version {} does not match expected version {}",
                        version, STORE_SCHEMA_VERSION
                    )));
                }
            }
            None if !self.jobs_tree.is_empty() => {
                return Err(ProxyError::Schema(
                    "store has entries but no schema version".to_string(),
                ));
            }
            None => {
                self.metadata_tree
                    .insert(SCHEMA_VERSION_KEY, serde_json::to_vec(&STORE_SCHEMA_VERSION)?)?;
                self.commit()?;
            }
        }

        for entry in self.jobs_tree.iter() {
            let (_, value) = entry?;
            decode_job(&value)?;
        }
        Ok(())
    }

    /// Delete every file belonging to a session. Failures are logged only.
    fn destroy_session_files(base_dir: &Path, session_name: &str) {
        info!("Cleaning awaited job store of session '{}'", session_name);
        let entries = match std::fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Could not list {}: {}", base_dir.display(), e);
                return;
            }
        };
        let prefix = format!("{}.", session_name);
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name != session_name && !name.starts_with(&prefix) {
                continue;
            }
            let path = entry.path();
            info!("Deleting {}", path.display());
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                error!(
                    "Could not delete {} ({}). Please remove it manually.",
                    path.display(),
                    e
                );
            }
        }
    }

    fn clear_transferring_flags(&self) -> ProxyResult<()> {
        for job_id in self.list_ids()? {
            let cleared = self.update(&job_id, |current| match current {
                Some(mut job) => {
                    let mut cleared = Vec::new();
                    for task in job.awaited_tasks.values_mut() {
                        if task.transferring {
                            task.transferring = false;
                            cleared.push(task.name.clone());
                        }
                    }
                    (Some(job), cleared)
                }
                None => (None, Vec::new()),
            })?;
            for task_name in cleared {
                warn!(
                    "Transfer of task {} of job {} was interrupted, it will be attempted again",
                    task_name, job_id
                );
            }
        }
        Ok(())
    }

    /// Durably write pending changes to disk
    fn commit(&self) -> ProxyResult<()> {
        self.db
            .flush()
            .map_err(|e| ProxyError::Store(format!("Failed to commit awaited job store: {}", e)))?;
        Ok(())
    }

    /// Atomically read-modify-write one job entry.
    ///
    /// `f` receives the current value and returns the new value (`None` deletes
    /// the entry) plus an outcome; it runs again if the entry changed meanwhile.
    fn update<R>(
        &self,
        job_id: &str,
        mut f: impl FnMut(Option<AwaitedJob>) -> (Option<AwaitedJob>, R),
    ) -> ProxyResult<R> {
        let key = job_id.as_bytes();
        loop {
            let current = self.jobs_tree.get(key)?;
            let decoded = current.as_deref().map(decode_job).transpose()?;
            let (next, outcome) = f(decoded);
            let encoded = next.as_ref().map(encode_job).transpose()?;
            if current.as_deref() == encoded.as_deref() {
                return Ok(outcome);
            }
            match self.jobs_tree.compare_and_swap(key, current, encoded)? {
                Ok(()) => {
                    self.commit()?;
                    return Ok(outcome);
                }
                Err(_) => debug!("Concurrent update of job {}, retrying", job_id),
            }
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert or replace a job and commit
    pub fn put_job(&self, job_id: &str, job: &AwaitedJob) -> ProxyResult<()> {
        self.jobs_tree.insert(job_id.as_bytes(), encode_job(job)?)?;
        self.commit()
    }

    pub fn get_job(&self, job_id: &str) -> ProxyResult<Option<AwaitedJob>> {
        match self.jobs_tree.get(job_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_job(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, job_id: &str) -> ProxyResult<bool> {
        Ok(self.jobs_tree.contains_key(job_id.as_bytes())?)
    }

    pub fn list_ids(&self) -> ProxyResult<Vec<String>> {
        let mut ids = Vec::new();
        for key in self.jobs_tree.iter().keys() {
            ids.push(String::from_utf8_lossy(&key?).to_string());
        }
        Ok(ids)
    }

    pub fn job_count(&self) -> usize {
        self.jobs_tree.len()
    }

    /// Record the scheduler task id of a task. Returns the updated job, or
    /// `None` when the job or task is not awaited.
    pub fn set_task_id(
        &self,
        job_id: &str,
        task_name: &str,
        task_id: &str,
    ) -> ProxyResult<Option<AwaitedJob>> {
        self.update(job_id, |current| {
            let Some(mut job) = current else {
                return (None, None);
            };
            let Some(task) = job.task_mut(task_name) else {
                return (Some(job), None);
            };
            if task.task_id.as_deref() != Some(task_id) {
                task.task_id = Some(task_id.to_string());
            }
            (Some(job.clone()), Some(job))
        })
    }

    /// Set or clear the transferring flag. Returns false when the task is not awaited.
    pub fn set_task_transferring(
        &self,
        job_id: &str,
        task_name: &str,
        transferring: bool,
    ) -> ProxyResult<bool> {
        self.update(job_id, |current| {
            let Some(mut job) = current else {
                return (None, false);
            };
            match job.task_mut(task_name) {
                Some(task) => {
                    task.transferring = transferring;
                    (Some(job), true)
                }
                None => (Some(job), false),
            }
        })
    }

    /// Set the transferring flag only if it is clear
    pub fn try_mark_transferring(&self, job_id: &str, task_name: &str) -> ProxyResult<TransferClaim> {
        self.update(job_id, |current| {
            let Some(mut job) = current else {
                return (None, TransferClaim::Missing);
            };
            match job.task_mut(task_name) {
                Some(task) if task.transferring => (Some(job), TransferClaim::AlreadyTransferring),
                Some(task) => {
                    task.transferring = true;
                    (Some(job), TransferClaim::Claimed)
                }
                None => (Some(job), TransferClaim::Missing),
            }
        })
    }

    /// Remove one task; removing the last task removes the job and its scratch
    /// folders. Returns false when the task was not awaited.
    pub async fn remove_task(&self, job_id: &str, task_name: &str) -> ProxyResult<bool> {
        self.remove_task_inner(job_id, task_name, true).await
    }

    /// Like `remove_task`, but a job emptied this way keeps its scratch
    /// folders so that unretrieved output can still be copied by hand.
    pub async fn abandon_task(&self, job_id: &str, task_name: &str) -> ProxyResult<bool> {
        self.remove_task_inner(job_id, task_name, false).await
    }

    async fn remove_task_inner(
        &self,
        job_id: &str,
        task_name: &str,
        cleanup: bool,
    ) -> ProxyResult<bool> {
        let (removed, emptied_job) = self.update(job_id, |current| {
            let Some(mut job) = current else {
                return (None, (false, None));
            };
            if job.awaited_tasks.remove(task_name).is_none() {
                return (Some(job), (false, None));
            }
            if job.awaited_tasks.is_empty() {
                (None, (true, Some(job)))
            } else {
                (Some(job), (true, None))
            }
        })?;

        if removed {
            debug!("Removed awaited task {} of job {}", task_name, job_id);
        }
        if let Some(job) = emptied_job {
            info!(
                "All tasks of job {} have been handled, removing the job",
                job_id
            );
            if cleanup {
                self.cleanup_remote(&job).await;
            } else {
                warn!(
                    "Remote folders of job {} are kept: {:?}",
                    job_id,
                    job.scratch_roots(|url| self.storage.parent(url))
                );
            }
        }
        Ok(removed)
    }

    /// Remove a job and delete its scratch folders. Remote cleanup is best
    /// effort; the local entry is removed regardless.
    pub async fn remove_job(&self, job_id: &str) -> ProxyResult<bool> {
        let removed = self.update(job_id, |current| (None, current))?;
        match removed {
            Some(job) => {
                info!("Removed awaited job {}", job_id);
                self.cleanup_remote(&job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn cleanup_remote(&self, job: &AwaitedJob) {
        for root in job.scratch_roots(|url| self.storage.parent(url)) {
            match self.storage.delete(&root).await {
                Ok(()) => debug!("Deleted remote folder {} of job {}", root, job.job_id),
                Err(e) => warn!(
                    "Could not delete remote folder {} of job {}: {}",
                    root, job.job_id, e
                ),
            }
        }
    }

    /// Forget a job without touching remote data
    pub fn discard(&self, job_id: &str) -> ProxyResult<bool> {
        let removed = self.jobs_tree.remove(job_id.as_bytes())?.is_some();
        self.commit()?;
        Ok(removed)
    }

    /// Forget every job without touching remote data
    pub fn discard_all(&self) -> ProxyResult<()> {
        self.jobs_tree.clear()?;
        self.commit()
    }

    /// Flush and release; the store must not be used afterwards
    pub fn close(&self) -> ProxyResult<()> {
        self.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AwaitedTask, FileSelector};
    use crate::storage::{path_to_url, LocalFileStorage};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn storage() -> Arc<dyn StoragePort> {
        Arc::new(LocalFileStorage::new())
    }

    fn load(dir: &TempDir) -> AwaitedJobStore {
        AwaitedJobStore::load(dir.path(), "TestSession", storage(), true).unwrap()
    }

    fn awaited_job(job_id: &str, tasks: &[&str], scratch: Option<&Path>) -> AwaitedJob {
        let awaited_tasks: HashMap<String, AwaitedTask> = tasks
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    AwaitedTask::new(*name, vec![FileSelector::including(["*.out"])]),
                )
            })
            .collect();
        AwaitedJob {
            job_id: job_id.to_string(),
            local_input_folder: None,
            local_output_folder: Some(PathBuf::from("/tmp/local_out")),
            input_space_url: None,
            output_space_url: None,
            push_url: scratch.map(|s| path_to_url(&s.join("input"))),
            pull_url: scratch.map(|s| path_to_url(&s.join("output"))),
            isolate_task_outputs: false,
            automatic_transfer: true,
            awaited_tasks,
        }
    }

    #[test]
    fn put_get_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = load(&dir);
        let job = awaited_job("1", &["A", "B"], None);
        store.put_job("1", &job).unwrap();

        assert!(store.exists("1").unwrap());
        assert!(!store.exists("2").unwrap());
        assert_eq!(store.get_job("1").unwrap(), Some(job));
        assert_eq!(store.list_ids().unwrap(), vec!["1".to_string()]);
    }

    #[test]
    fn entries_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = load(&dir);
            store
                .put_job("5", &awaited_job("5", &["A"], None))
                .unwrap();
        }
        let store = load(&dir);
        assert!(store.exists("5").unwrap());
    }

    #[tokio::test]
    async fn removing_last_task_removes_job_and_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(scratch.path().join("input")).unwrap();
        std::fs::create_dir_all(scratch.path().join("output")).unwrap();

        let store = load(&dir);
        store
            .put_job("1", &awaited_job("1", &["A", "B"], Some(scratch.path())))
            .unwrap();

        assert!(store.remove_task("1", "A").await.unwrap());
        assert!(store.exists("1").unwrap());
        assert!(scratch.path().join("output").exists());

        assert!(store.remove_task("1", "B").await.unwrap());
        assert!(!store.exists("1").unwrap());
        assert!(!scratch.path().join("input").exists());
        assert!(!scratch.path().join("output").exists());

        assert!(!store.remove_task("1", "B").await.unwrap());
    }

    #[tokio::test]
    async fn abandoned_last_task_keeps_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(scratch.path().join("output")).unwrap();

        let store = load(&dir);
        store
            .put_job("1", &awaited_job("1", &["A"], Some(scratch.path())))
            .unwrap();

        assert!(store.abandon_task("1", "A").await.unwrap());
        assert!(!store.exists("1").unwrap());
        assert!(scratch.path().join("output").exists());
    }

    /// Local storage whose parent of an isolated output URL is a fixed folder
    struct FlatParentStorage {
        inner: LocalFileStorage,
        parent: String,
    }

    #[async_trait::async_trait]
    impl StoragePort for FlatParentStorage {
        async fn resolve(&self, url: &str) -> ProxyResult<String> {
            self.inner.resolve(url).await
        }

        async fn create_folder(&self, url: &str) -> ProxyResult<()> {
            self.inner.create_folder(url).await
        }

        async fn copy(
            &self,
            source: &str,
            destination: &str,
            selector: &FileSelector,
        ) -> ProxyResult<usize> {
            self.inner.copy(source, destination, selector).await
        }

        async fn delete(&self, url: &str) -> ProxyResult<()> {
            self.inner.delete(url).await
        }

        fn parent(&self, _url: &str) -> Option<String> {
            Some(self.parent.clone())
        }
    }

    #[tokio::test]
    async fn isolated_output_root_comes_from_storage_parent() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let elsewhere = scratch.path().join("adapter_root");
        std::fs::create_dir_all(&elsewhere).unwrap();
        std::fs::create_dir_all(scratch.path().join("output")).unwrap();
        let storage = Arc::new(FlatParentStorage {
            inner: LocalFileStorage::new(),
            parent: path_to_url(&elsewhere),
        });
        let store = AwaitedJobStore::load(dir.path(), "TestSession", storage, true).unwrap();
        let mut job = awaited_job("1", &["A"], Some(scratch.path()));
        job.isolate_task_outputs = true;
        job.pull_url = job
            .pull_url
            .map(|url| crate::storage::join_url(&url, crate::constants::TASKID_PLACEHOLDER));
        store.put_job("1", &job).unwrap();

        assert!(store.remove_task("1", "A").await.unwrap());

        assert!(!elsewhere.exists());
        assert!(scratch.path().join("output").exists());
    }

    #[test]
    fn transfer_claim_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = load(&dir);
        store
            .put_job("1", &awaited_job("1", &["A"], None))
            .unwrap();

        assert_eq!(
            store.try_mark_transferring("1", "A").unwrap(),
            TransferClaim::Claimed
        );
        assert_eq!(
            store.try_mark_transferring("1", "A").unwrap(),
            TransferClaim::AlreadyTransferring
        );
        assert_eq!(
            store.try_mark_transferring("1", "Z").unwrap(),
            TransferClaim::Missing
        );
        assert!(store.set_task_transferring("1", "A", false).unwrap());
        assert_eq!(
            store.try_mark_transferring("1", "A").unwrap(),
            TransferClaim::Claimed
        );
    }

    #[test]
    fn interrupted_transfers_are_cleared_on_load() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = load(&dir);
            store
                .put_job("1", &awaited_job("1", &["A"], None))
                .unwrap();
            store.set_task_transferring("1", "A", true).unwrap();
        }
        {
            let kept = AwaitedJobStore::load(dir.path(), "TestSession", storage(), false).unwrap();
            assert!(kept.get_job("1").unwrap().unwrap().task("A").unwrap().transferring);
        }
        let store = load(&dir);
        assert!(!store.get_job("1").unwrap().unwrap().task("A").unwrap().transferring);
    }

    #[test]
    fn set_task_id_ignores_unknown_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = load(&dir);
        store
            .put_job("1", &awaited_job("1", &["A"], None))
            .unwrap();

        let updated = store.set_task_id("1", "A", "1001").unwrap().unwrap();
        assert_eq!(updated.task("A").unwrap().task_id.as_deref(), Some("1001"));
        assert!(store.set_task_id("1", "missing", "9").unwrap().is_none());
        assert!(store.set_task_id("2", "A", "9").unwrap().is_none());
        assert!(!store.exists("2").unwrap());
    }

    #[test]
    fn incompatible_schema_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = load(&dir);
            store
                .put_job("1", &awaited_job("1", &["A"], None))
                .unwrap();
        }
        {
            let db = sled::open(dir.path().join("TestSession")).unwrap();
            let metadata = db.open_tree(METADATA_TREE).unwrap();
            metadata
                .insert(SCHEMA_VERSION_KEY, serde_json::to_vec(&1u32).unwrap())
                .unwrap();
            db.flush().unwrap();
        }

        let store = load(&dir);
        assert_eq!(store.job_count(), 0);
        store
            .put_job("2", &awaited_job("2", &["A"], None))
            .unwrap();
        assert!(store.exists("2").unwrap());
    }

    #[test]
    fn unreadable_entry_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = load(&dir);
            store.jobs_tree.insert("broken", b"{not json".to_vec()).unwrap();
            store.commit().unwrap();
        }
        let store = load(&dir);
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discard_keeps_remote_data() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(scratch.path().join("output")).unwrap();

        let store = load(&dir);
        store
            .put_job("1", &awaited_job("1", &["A"], Some(scratch.path())))
            .unwrap();
        store
            .put_job("2", &awaited_job("2", &["A"], None))
            .unwrap();

        assert!(store.discard("1").unwrap());
        assert!(scratch.path().join("output").exists());
        store.discard_all().unwrap();
        assert_eq!(store.job_count(), 0);
    }

    #[test]
    fn rejects_invalid_session_name() {
        let dir = tempfile::tempdir().unwrap();
        let result = AwaitedJobStore::load(dir.path(), "bad/name", storage(), true);
        assert!(matches!(result, Err(ProxyError::InvalidArgument(_))));
    }
}
