//! Concurrent evaluation of many instances.
//!
//! A fixed pool of workers drains a shared queue; every run additionally
//! holds a permit from a counting gate, which a long-lived service can share
//! across requests. Each instance's outcome, success or captured error, is
//! recorded under its id; a failure never reaches sibling instances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{Instance, InstanceResult, RunOptions};
use crate::error::HarnessError;
use crate::image::ImageOrchestrator;
use crate::instance::InstanceRunner;
use crate::io::config::RunConfig;
use crate::io::log_sink::{LogPaths, LogSink};

/// Shared pieces every round of a command needs.
#[derive(Clone)]
pub struct Engine {
    pub images: Arc<ImageOrchestrator>,
    pub run: RunConfig,
    pub cancel: CancelToken,
}

impl Engine {
    pub fn new(images: Arc<ImageOrchestrator>, run: RunConfig) -> Self {
        Self {
            images,
            run,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runner writing instance artifacts under `paths`.
    pub fn runner(&self, paths: LogPaths) -> InstanceRunner {
        InstanceRunner::new(Arc::clone(&self.images), self.run.clone(), paths)
            .with_cancel(self.cancel.clone())
    }

    pub fn scheduler(&self, paths: LogPaths) -> Scheduler {
        Scheduler::new(Arc::new(self.runner(paths)))
    }
}

/// How one scheduler round runs.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleOptions {
    pub max_workers: usize,
    /// Used for instances without their own timeout.
    pub timeout: Duration,
    /// Submit in chunks of `max_workers`, stopping after a chunk where every
    /// instance failed.
    pub batch_mode: bool,
    pub run: RunOptions,
}

pub struct Scheduler {
    runner: Arc<InstanceRunner>,
    gate: Option<Arc<Semaphore>>,
}

struct Progress {
    log: Option<LogSink>,
    done: AtomicUsize,
    total: usize,
}

impl Progress {
    fn record(&self, instance_id: &str, result: &InstanceResult) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let message = match result {
            InstanceResult::Completed { time, .. } => format!(
                "Evaluated instance {instance_id} in {time:.2} seconds. Resolved: {}",
                result.is_resolved()
            ),
            InstanceResult::Failed { error, kind } => {
                format!("Error evaluating instance {instance_id} ({kind:?}): {error}")
            }
        };
        let counter = format!("evaluated {done}/{}", self.total);
        match &self.log {
            Some(log) if result.is_error() => log.error(&message),
            Some(log) => log.info(&message),
            None => info!("{message}"),
        }
        match &self.log {
            Some(log) => log.info(&counter),
            None => info!("{counter}"),
        }
    }
}

impl Scheduler {
    pub fn new(runner: Arc<InstanceRunner>) -> Self {
        Self { runner, gate: None }
    }

    /// Share a concurrency gate with other schedulers.
    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Evaluate `instances`, returning one entry per evaluated instance id.
    ///
    /// In batch mode, instances of chunks that were never submitted are absent.
    #[instrument(skip_all, fields(instances = instances.len(), batch = opts.batch_mode))]
    pub async fn evaluate(
        &self,
        instances: Vec<Instance>,
        opts: ScheduleOptions,
    ) -> BTreeMap<String, InstanceResult> {
        let max_workers = opts.max_workers.max(1);
        let gate = self
            .gate
            .clone()
            .unwrap_or_else(|| Arc::new(Semaphore::new(max_workers)));
        let log = match LogSink::open(&self.runner.paths().evaluation_log(), "evaluation") {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(err = %e, "evaluation log unavailable");
                None
            }
        };
        let progress = Arc::new(Progress {
            log,
            done: AtomicUsize::new(0),
            total: instances.len(),
        });

        if !opts.batch_mode {
            return self.drain(instances, max_workers, &gate, &progress, opts).await;
        }

        let mut results = BTreeMap::new();
        let mut remaining = instances.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<Instance> = remaining.by_ref().take(max_workers).collect();
            let chunk_results = self.drain(chunk, max_workers, &gate, &progress, opts).await;
            let all_failed = chunk_results.values().all(InstanceResult::is_error);
            results.extend(chunk_results);
            if all_failed {
                let skipped = remaining.count();
                let message = format!(
                    "Every instance in the last batch failed; not submitting the remaining {skipped} instances."
                );
                match &progress.log {
                    Some(log) => log.error(&message),
                    None => warn!("{message}"),
                }
                break;
            }
        }
        results
    }

    /// Run `instances` on a pool of workers sharing one queue.
    async fn drain(
        &self,
        instances: Vec<Instance>,
        max_workers: usize,
        gate: &Arc<Semaphore>,
        progress: &Arc<Progress>,
        opts: ScheduleOptions,
    ) -> BTreeMap<String, InstanceResult> {
        let workers = max_workers.min(instances.len());
        let (tx, rx) = mpsc::unbounded_channel();
        for instance in instances {
            // The receiver is alive until the workers finish.
            let _ = tx.send(instance);
        }
        // Closing the sender lets workers stop once the queue is empty.
        drop(tx);
        let queue = Arc::new(Mutex::new(rx));

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let gate = Arc::clone(gate);
            let runner = Arc::clone(&self.runner);
            let progress = Arc::clone(progress);
            pool.spawn(async move {
                let mut done = Vec::new();
                loop {
                    let next = queue.lock().await.recv().await;
                    let Some(instance) = next else {
                        break;
                    };
                    let result = run_isolated(&runner, &gate, instance.clone(), opts).await;
                    progress.record(&instance.instance_id, &result);
                    done.push((instance.instance_id, result));
                }
                done
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(done) => results.extend(done),
                Err(e) => warn!(err = %e, "evaluation worker failed"),
            }
        }
        results
    }
}

/// Run one instance in its own task so a panic stays with that instance.
async fn run_isolated(
    runner: &Arc<InstanceRunner>,
    gate: &Arc<Semaphore>,
    instance: Instance,
    opts: ScheduleOptions,
) -> InstanceResult {
    let Ok(_permit) = Arc::clone(gate).acquire_owned().await else {
        return InstanceResult::failed(&HarnessError::Cancelled);
    };
    let timeout = instance.timeout.unwrap_or(opts.timeout);
    let runner = Arc::clone(runner);
    let task = tokio::spawn(async move {
        let started = Instant::now();
        runner
            .run(&instance, timeout, opts.run)
            .await
            .map(|output| (output, started.elapsed()))
    });
    match task.await {
        Ok(Ok((output, elapsed))) => InstanceResult::Completed {
            output,
            time: elapsed.as_secs_f64(),
        },
        Ok(Err(e)) => InstanceResult::failed(&e),
        Err(e) => InstanceResult::failed(&HarnessError::Other(anyhow::anyhow!(
            "instance task failed: {e}"
        ))),
    }
}
