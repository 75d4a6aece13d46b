//! Shared application state for the evaluation service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use harness::io::dataset::DatasetRecord;
use harness::scheduler::Engine;
use tokio::sync::Semaphore;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Dataset records by instance id.
    pub records: Arc<HashMap<String, DatasetRecord>>,
    /// Bounds concurrent instance runs across all requests.
    pub gate: Arc<Semaphore>,
    pub max_workers: usize,
    pub timeout: Duration,
    /// Parent of the per-request log directories.
    pub log_root: PathBuf,
    next_request: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        engine: Engine,
        records: Vec<DatasetRecord>,
        max_workers: usize,
        timeout: Duration,
        log_root: PathBuf,
    ) -> Self {
        let max_workers = max_workers.max(1);
        let records = records
            .into_iter()
            .map(|r| (r.instance_id.clone(), r))
            .collect();
        Self {
            engine,
            records: Arc::new(records),
            gate: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            timeout,
            log_root,
            next_request: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Fresh log directory for one request.
    pub fn request_log_dir(&self) -> PathBuf {
        let n = self.next_request.fetch_add(1, Ordering::SeqCst);
        self.log_root
            .join(format!("request-{}-{n}", std::process::id()))
    }
}
