//! RocksDB-backed state store: durable, crash-consistent record of sessions,
//! iterations, per-host outcomes, compressed log blobs, and metadata.
//!
//! Individual column-family `put`/`get` calls are safe to interleave across
//! threads (RocksDB handles are internally thread-safe); operations that
//! must be check-then-act atomic (get-or-create, log chunk append) take
//! `write_lock` to serialize the whole operation.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::compression;
use super::schema::{self, ALL_CFS};
use super::types::*;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type SharedStateStore = Arc<StateStore>;

pub struct StateStore {
    db: RwLock<DB>,
    path: PathBuf,
    /// Serializes compound check-then-act operations: `get_or_create_session`
    /// and per-log-id `append_build_log_chunk`.
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // ------------------------------------------------------------------
    // Generic column-family helpers
    // ------------------------------------------------------------------

    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => {
                let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_keys(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut keys = Vec::new();
        for result in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
            let (key, _) = result?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                if key_str.starts_with(prefix) {
                    keys.push(key_str);
                } else {
                    break;
                }
            }
        }
        Ok(keys)
    }

    fn list_values<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        self.list_keys(cf_name, prefix)?
            .iter()
            .map(|key| {
                self.get::<T>(cf_name, key)?
                    .ok_or_else(|| StoreError::NotFound(key.clone()))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// Atomic: if a `Running` session exists, return its id; else insert a
    /// new one and return its id. Two concurrent callers never produce two
    /// running sessions because the whole check-then-insert holds
    /// `write_lock`.
    pub fn get_or_create_session(
        &self,
        good: &str,
        bad: &str,
        config_blob: Vec<u8>,
    ) -> StoreResult<String> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;

        let sessions: Vec<Session> =
            self.list_values(schema::CF_SESSIONS, schema::keys::session_prefix())?;
        if let Some(running) = sessions
            .into_iter()
            .find(|s| s.status == SessionStatus::Running)
        {
            return Ok(running.id);
        }

        let id = Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            good_commit: good.to_string(),
            bad_commit: bad.to_string(),
            started_at: Utc::now().timestamp(),
            ended_at: None,
            status: SessionStatus::Running,
            result_commit: None,
            config_blob,
            state_blob: Vec::new(),
            error: None,
        };
        self.put(schema::CF_SESSIONS, &schema::keys::session(&id), &session)?;
        Ok(id)
    }

    pub fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.get(schema::CF_SESSIONS, &schema::keys::session(session_id))
    }

    /// Returns the most recently started `Halted` session, if any — used by
    /// the resume path.
    pub fn get_halted_session(&self) -> StoreResult<Option<Session>> {
        let mut sessions: Vec<Session> =
            self.list_values(schema::CF_SESSIONS, schema::keys::session_prefix())?;
        sessions.retain(|s| s.status == SessionStatus::Halted);
        sessions.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        Ok(sessions.into_iter().next())
    }

    /// Only the explicit field allow-list may be written: end-time, status,
    /// result-commit, state-blob, error.
    pub fn update_session(
        &self,
        session_id: &str,
        status: Option<SessionStatus>,
        ended_at: Option<Option<i64>>,
        result_commit: Option<Option<String>>,
        state_blob: Option<Vec<u8>>,
        error: Option<Option<String>>,
    ) -> StoreResult<()> {
        let key = schema::keys::session(session_id);
        let mut session: Session = self
            .get(schema::CF_SESSIONS, &key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if let Some(status) = status {
            session.status = status;
        }
        if let Some(ended_at) = ended_at {
            session.ended_at = ended_at;
        }
        if let Some(result_commit) = result_commit {
            session.result_commit = result_commit;
        }
        if let Some(state_blob) = state_blob {
            session.state_blob = state_blob;
        }
        if let Some(error) = error {
            session.error = error;
        }

        self.put(schema::CF_SESSIONS, &key, &session)
    }

    // ------------------------------------------------------------------
    // Host operations
    // ------------------------------------------------------------------

    pub fn create_host(&self, session_id: &str, attrs: Host) -> StoreResult<String> {
        let id = attrs.id.clone();
        let mut attrs = attrs;
        attrs.session_id = session_id.to_string();
        self.put(schema::CF_HOSTS, &schema::keys::host(&id), &attrs)?;
        Ok(id)
    }

    pub fn get_session_hosts(&self, session_id: &str) -> StoreResult<Vec<Host>> {
        let hosts: Vec<Host> = self.list_values(schema::CF_HOSTS, schema::keys::host_prefix())?;
        Ok(hosts
            .into_iter()
            .filter(|h| h.session_id == session_id)
            .collect())
    }

    // ------------------------------------------------------------------
    // Iteration operations
    // ------------------------------------------------------------------

    pub fn create_iteration(
        &self,
        session_id: &str,
        number: u32,
        sha: &str,
        message: &str,
    ) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let iteration = Iteration {
            id: id.clone(),
            session_id: session_id.to_string(),
            number,
            commit_sha: sha.to_string(),
            commit_message: message.to_string(),
            started_at: Utc::now().timestamp(),
            ended_at: None,
            duration_secs: None,
            verdict: None,
            error: None,
            kernel_version: None,
        };
        self.put(
            schema::CF_ITERATIONS,
            &schema::keys::iteration(session_id, number),
            &iteration,
        )?;
        Ok(id)
    }

    pub fn get_iteration(&self, session_id: &str, number: u32) -> StoreResult<Option<Iteration>> {
        self.get(
            schema::CF_ITERATIONS,
            &schema::keys::iteration(session_id, number),
        )
    }

    pub fn list_session_iterations(&self, session_id: &str) -> StoreResult<Vec<Iteration>> {
        self.list_values(
            schema::CF_ITERATIONS,
            &schema::keys::iteration_prefix(session_id),
        )
    }

    /// Field allow-list: build/boot/test/final result live on
    /// `IterationResult`, not here; this updates end-time, duration, verdict,
    /// error, kernel-version.
    #[allow(clippy::too_many_arguments)]
    pub fn update_iteration(
        &self,
        session_id: &str,
        number: u32,
        ended_at: Option<i64>,
        duration_secs: Option<f64>,
        verdict: Option<Verdict>,
        error: Option<String>,
        kernel_version: Option<String>,
    ) -> StoreResult<()> {
        let key = schema::keys::iteration(session_id, number);
        let mut iteration: Iteration = self
            .get(schema::CF_ITERATIONS, &key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if let Some(ended_at) = ended_at {
            iteration.ended_at = Some(ended_at);
        }
        if let Some(duration_secs) = duration_secs {
            iteration.duration_secs = Some(duration_secs);
        }
        if let Some(verdict) = verdict {
            iteration.verdict = Some(verdict);
        }
        if let Some(error) = error {
            iteration.error = Some(error);
        }
        if let Some(kernel_version) = kernel_version {
            iteration.kernel_version = Some(kernel_version);
        }

        self.put(schema::CF_ITERATIONS, &key, &iteration)
    }

    // ------------------------------------------------------------------
    // IterationResult operations
    // ------------------------------------------------------------------

    /// All N per-host results for an iteration persist in one transaction,
    /// or none do.
    pub fn create_iteration_results_bulk(
        &self,
        results: Vec<IterationResult>,
    ) -> StoreResult<Vec<String>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_ITERATION_RESULTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_ITERATION_RESULTS.to_string()))?;

        let mut batch = rocksdb::WriteBatch::default();
        let mut ids = Vec::with_capacity(results.len());
        for result in &results {
            let key = schema::keys::iteration_result(&result.iteration_id, &result.host_id);
            let bytes = bincode::serde::encode_to_vec(result, bincode::config::standard())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            batch.put_cf(&cf, key.as_bytes(), bytes);
            ids.push(result.id.clone());
        }
        db.write(batch)?;
        Ok(ids)
    }

    pub fn get_iteration_results(&self, iteration_id: &str) -> StoreResult<Vec<IterationResult>> {
        self.list_values(
            schema::CF_ITERATION_RESULTS,
            &schema::keys::iteration_result_prefix(iteration_id),
        )
    }

    // ------------------------------------------------------------------
    // BuildLog operations
    // ------------------------------------------------------------------

    /// Opens a streamed log with an initial header, exit-code null.
    pub fn create_build_log(
        &self,
        iteration_id: &str,
        host_id: &str,
        kind: LogKind,
        header: &[u8],
    ) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let compressed = compression::compress(header)?;
        let log = BuildLog {
            id: id.clone(),
            iteration_id: iteration_id.to_string(),
            host_id: host_id.to_string(),
            kind,
            created_at: Utc::now().timestamp(),
            compressed_content: compressed,
            uncompressed_size: header.len() as u64,
            exit_code: None,
        };
        self.put(schema::CF_BUILD_LOGS, &schema::keys::build_log(&id), &log)?;
        Ok(id)
    }

    /// Read current compressed content, decompress, concatenate, recompress,
    /// write back. Serialized per log-id via `write_lock` (shared globally;
    /// acceptable given MB-scale logs per the streaming-append design note).
    pub fn append_build_log_chunk(&self, log_id: &str, bytes: &[u8]) -> StoreResult<()> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)?;

        let key = schema::keys::build_log(log_id);
        let mut log: BuildLog = self
            .get(schema::CF_BUILD_LOGS, &key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        let mut current = compression::decompress(&log.compressed_content)?;
        current.extend_from_slice(bytes);
        log.uncompressed_size = current.len() as u64;
        log.compressed_content = compression::compress(&current)?;

        self.put(schema::CF_BUILD_LOGS, &key, &log)
    }

    /// Sets the terminal exit code; the log is immutable in practice after
    /// this call (callers are expected not to append further).
    pub fn finalize_build_log(&self, log_id: &str, exit_code: i32) -> StoreResult<()> {
        let key = schema::keys::build_log(log_id);
        let mut log: BuildLog = self
            .get(schema::CF_BUILD_LOGS, &key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        log.exit_code = Some(exit_code);
        self.put(schema::CF_BUILD_LOGS, &key, &log)
    }

    pub fn get_build_log(&self, log_id: &str) -> StoreResult<Option<BuildLog>> {
        self.get(schema::CF_BUILD_LOGS, &schema::keys::build_log(log_id))
    }

    /// Decompressed content, for callers that need to read back a finished
    /// log (e.g. rendering a failure report).
    pub fn read_build_log_content(&self, log_id: &str) -> StoreResult<Vec<u8>> {
        let key = schema::keys::build_log(log_id);
        let log: BuildLog = self
            .get(schema::CF_BUILD_LOGS, &key)?
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        compression::decompress(&log.compressed_content)
    }

    pub fn list_iteration_build_logs(&self, iteration_id: &str) -> StoreResult<Vec<BuildLog>> {
        let logs: Vec<BuildLog> =
            self.list_values(schema::CF_BUILD_LOGS, schema::keys::build_log_prefix())?;
        Ok(logs
            .into_iter()
            .filter(|l| l.iteration_id == iteration_id)
            .collect())
    }

    // ------------------------------------------------------------------
    // Metadata operations
    // ------------------------------------------------------------------

    pub fn store_metadata(
        &self,
        session_id: &str,
        kind: &str,
        payload: &str,
        iteration_id: Option<&str>,
        host_id: Option<&str>,
    ) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let meta = Metadata {
            id: id.clone(),
            session_id: session_id.to_string(),
            iteration_id: iteration_id.map(str::to_string),
            host_id: host_id.map(str::to_string),
            kind: kind.to_string(),
            collected_at: Utc::now().timestamp(),
            payload: payload.to_string(),
        };
        self.put(schema::CF_METADATA, &schema::keys::metadata(&id), &meta)?;
        Ok(id)
    }

    /// Specialization for file-shaped payloads (kernel `.config`).
    pub fn store_file_metadata(
        &self,
        session_id: &str,
        iteration_id: &str,
        kind: &str,
        text: &str,
    ) -> StoreResult<String> {
        self.store_metadata(session_id, kind, text, Some(iteration_id), None)
    }

    pub fn list_session_metadata(&self, session_id: &str) -> StoreResult<Vec<Metadata>> {
        let records: Vec<Metadata> =
            self.list_values(schema::CF_METADATA, schema::keys::metadata_prefix())?;
        Ok(records
            .into_iter()
            .filter(|m| m.session_id == session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn get_or_create_session_is_idempotent() {
        let (_dir, store) = open_temp();
        let id1 = store
            .get_or_create_session("a".repeat(40).as_str(), "b".repeat(40).as_str(), vec![])
            .unwrap();
        let id2 = store
            .get_or_create_session("a".repeat(40).as_str(), "b".repeat(40).as_str(), vec![])
            .unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn get_or_create_session_starts_new_after_completion() {
        let (_dir, store) = open_temp();
        let id1 = store.get_or_create_session("a", "b", vec![]).unwrap();
        store
            .update_session(
                &id1,
                Some(SessionStatus::Completed),
                Some(Some(Utc::now().timestamp())),
                Some(Some("c".to_string())),
                None,
                None,
            )
            .unwrap();
        let id2 = store.get_or_create_session("a", "b", vec![]).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn build_log_append_round_trips_content() {
        let (_dir, store) = open_temp();
        let log_id = store
            .create_build_log("iter-1", "host-1", LogKind::Build, b"header\n")
            .unwrap();
        store.append_build_log_chunk(&log_id, b"chunk one\n").unwrap();
        store.append_build_log_chunk(&log_id, b"chunk two\n").unwrap();
        store.finalize_build_log(&log_id, 0).unwrap();

        let content = store.read_build_log_content(&log_id).unwrap();
        assert_eq!(content, b"header\nchunk one\nchunk two\n");

        let log = store.get_build_log(&log_id).unwrap().unwrap();
        assert_eq!(log.exit_code, Some(0));
    }

    #[test]
    fn iteration_results_bulk_write_is_all_or_nothing() {
        let (_dir, store) = open_temp();
        let results = vec![
            IterationResult {
                id: "r1".into(),
                iteration_id: "it1".into(),
                host_id: "h1".into(),
                build_result: Some(BuildResult::Success),
                boot_result: Some(BootResult::Success),
                test_result: Some(TestResult::Pass),
                r#final: Verdict::Good,
                error: None,
                test_output: None,
                timestamp: Utc::now().timestamp(),
            },
            IterationResult {
                id: "r2".into(),
                iteration_id: "it1".into(),
                host_id: "h2".into(),
                build_result: Some(BuildResult::Success),
                boot_result: Some(BootResult::Success),
                test_result: Some(TestResult::Fail),
                r#final: Verdict::Bad,
                error: None,
                test_output: None,
                timestamp: Utc::now().timestamp(),
            },
        ];
        let ids = store.create_iteration_results_bulk(results).unwrap();
        assert_eq!(ids.len(), 2);
        let stored = store.get_iteration_results("it1").unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn iteration_numbers_unique_per_session_and_ordered() {
        let (_dir, store) = open_temp();
        store.create_iteration("s1", 1, &"a".repeat(40), "msg1").unwrap();
        store.create_iteration("s1", 2, &"b".repeat(40), "msg2").unwrap();
        let iterations = store.list_session_iterations("s1").unwrap();
        assert_eq!(iterations.len(), 2);
        assert_eq!(iterations[0].number, 1);
        assert_eq!(iterations[1].number, 2);
    }
}
