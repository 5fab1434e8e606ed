//! Bounded worker pool for a batch of alignment tasks.
//!
//! Workers pull tasks from a shared queue and report back on a channel. The
//! dispatcher drains one event at a time, so task records, progress and the
//! cancel check are all handled on a single task. Failed tasks get a fresh pool
//! for every retry round.

mod runner;


pub use runner::{InProcessRunner, ProcessRunner};

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;

/// Why a task produced no output, with whatever the worker printed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl TaskFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} (exit code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Runs one task. Implementations must be safe to call from many workers at once.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    type Input: Send + Sync + 'static;
    type Output: Send + 'static;

    async fn run(&self, index: usize, input: &Self::Input) -> Result<Self::Output, TaskFailure>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    TaskError,
}

#[derive(Debug, Clone)]
pub struct TaskRecord<O> {
    pub index: usize,
    pub status: TaskStatus,
    pub attempts: u32,
    pub elapsed: Option<Duration>,
    pub output: Option<O>,
    pub failure: Option<TaskFailure>,
}

impl<O> TaskRecord<O> {
    fn queued(index: usize) -> Self {
        Self {
            index,
            status: TaskStatus::Queued,
            attempts: 0,
            elapsed: None,
            output: None,
            failure: None,
        }
    }
}

/// Outcome of [`TaskQueue::run`], one record per submitted task sorted by index.
#[derive(Debug, Clone)]
pub struct BatchReport<O> {
    pub records: Vec<TaskRecord<O>>,
    pub cancelled: bool,
    pub rounds: u32,
}

impl<O> BatchReport<O> {
    pub fn completed(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(TaskStatus::TaskError)
    }

    /// Tasks that never finished because the batch was cancelled.
    pub fn pending(&self) -> usize {
        self.count(TaskStatus::Queued)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

/// Cooperative cancellation shared between the caller and the dispatcher.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Called after every finished task with `(finished, total)`.
///
/// `finished` never decreases within a batch: a failed task that will be
/// retried is not counted until its last attempt ends.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, finished: usize, total: usize);
}

impl<F> ProgressSink for F
where
    F: Fn(usize, usize) + Send + Sync,
{
    fn progress(&self, finished: usize, total: usize) {
        self(finished, total)
    }
}

/// A sink that ignores progress.
pub fn no_progress() -> impl ProgressSink {
    |_: usize, _: usize| {}
}

enum WorkerEvent<O> {
    Started {
        index: usize,
        worker: usize,
    },
    Finished {
        index: usize,
        outcome: Result<O, TaskFailure>,
        elapsed: Duration,
    },
}

type WorkQueue<I> = Arc<Mutex<VecDeque<(usize, Arc<I>)>>>;

#[derive(Debug)]
pub struct TaskQueue<R: TaskRunner> {
    runner: Arc<R>,
    config: QueueConfig,
}

impl<R: TaskRunner> TaskQueue<R> {
    pub fn new(runner: R, config: QueueConfig) -> Self {
        config.validate();
        Self {
            runner: Arc::new(runner),
            config,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Runs every task, retrying failures for up to `config.retries` extra rounds.
    ///
    /// Never fails as a whole: per-task failures and cancellation are reported in
    /// the returned [`BatchReport`].
    pub async fn run(
        &self,
        tasks: Vec<(usize, R::Input)>,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> BatchReport<R::Output> {
        let total = tasks.len();
        let mut records: BTreeMap<usize, TaskRecord<R::Output>> = BTreeMap::new();
        let mut inputs: BTreeMap<usize, Arc<R::Input>> = BTreeMap::new();
        for (index, input) in tasks {
            records.insert(index, TaskRecord::queued(index));
            inputs.insert(index, Arc::new(input));
        }

        let mut pending: Vec<usize> = records.keys().copied().collect();
        let mut cancelled = false;
        let mut rounds = 0;

        while !pending.is_empty() && rounds <= self.config.retries {
            if rounds > 0 {
                info!(round = rounds, tasks = pending.len(), "restarting pool for failed tasks");
                for index in &pending {
                    if let Some(record) = records.get_mut(index) {
                        record.status = TaskStatus::Queued;
                    }
                }
            }
            rounds += 1;

            let work: VecDeque<(usize, Arc<R::Input>)> = pending
                .iter()
                .filter_map(|index| inputs.get(index).map(|input| (*index, input.clone())))
                .collect();
            cancelled = self
                .run_round(work, &mut records, total, cancel, progress)
                .await;
            if cancelled {
                break;
            }

            pending = records
                .values()
                .filter(|r| r.status == TaskStatus::TaskError)
                .map(|r| r.index)
                .collect();
        }

        let report = BatchReport {
            records: records.into_values().collect(),
            cancelled,
            rounds,
        };
        info!(
            total,
            completed = report.completed(),
            failed = report.failed(),
            cancelled,
            rounds,
            "batch finished"
        );
        report
    }

    /// Returns true if the round was cancelled.
    async fn run_round(
        &self,
        work: VecDeque<(usize, Arc<R::Input>)>,
        records: &mut BTreeMap<usize, TaskRecord<R::Output>>,
        total: usize,
        cancel: &CancelToken,
        progress: &dyn ProgressSink,
    ) -> bool {
        let mut remaining = work.len();
        let workers = self.config.worker_count(remaining);
        debug!(tasks = remaining, workers, "starting pool");

        let queue: WorkQueue<R::Input> = Arc::new(Mutex::new(work));
        let (tx, mut rx) = unbounded_channel::<WorkerEvent<R::Output>>();
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            pool.spawn(worker_loop(worker, self.runner.clone(), queue.clone(), tx.clone()));
        }
        drop(tx);

        let mut was_cancelled = cancel.is_cancelled();
        while remaining > 0 && !was_cancelled {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    was_cancelled = true;
                    continue;
                }
                event = rx.recv() => event,
            };
            // Every sender is gone: the remaining workers died without reporting.
            let Some(event) = event else { break };

            match event {
                WorkerEvent::Started { index, worker } => {
                    debug!(index, worker, "task started");
                    if let Some(record) = records.get_mut(&index) {
                        record.status = TaskStatus::Running;
                        record.attempts += 1;
                    }
                }
                WorkerEvent::Finished {
                    index,
                    outcome,
                    elapsed,
                } => {
                    remaining -= 1;
                    if let Some(record) = records.get_mut(&index) {
                        record.elapsed = Some(elapsed);
                        match outcome {
                            Ok(output) => {
                                record.status = TaskStatus::Completed;
                                record.output = Some(output);
                                record.failure = None;
                            }
                            Err(failure) => {
                                warn!(index, attempt = record.attempts, %failure, "task failed");
                                record.status = TaskStatus::TaskError;
                                record.failure = Some(failure);
                            }
                        }
                    }
                    // A failure only counts once no retry round is left for it.
                    let retries = self.config.retries;
                    let finished = records
                        .values()
                        .filter(|r| match r.status {
                            TaskStatus::Completed => true,
                            TaskStatus::TaskError => r.attempts > retries,
                            _ => false,
                        })
                        .count();
                    progress.progress(finished, total);
                }
            }
        }

        if was_cancelled {
            warn!(unfinished = remaining, "batch cancelled, stopping workers");
            pool.abort_all();
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(%err, "worker panicked");
                }
            }
        }

        for record in records.values_mut() {
            match record.status {
                TaskStatus::Running if was_cancelled => record.status = TaskStatus::Queued,
                TaskStatus::Running | TaskStatus::Queued if !was_cancelled => {
                    record.status = TaskStatus::TaskError;
                    record.failure = Some(TaskFailure::new("worker exited before finishing"));
                }
                _ => {}
            }
        }

        was_cancelled
    }
}

async fn worker_loop<R: TaskRunner>(
    worker: usize,
    runner: Arc<R>,
    queue: WorkQueue<R::Input>,
    tx: UnboundedSender<WorkerEvent<R::Output>>,
) {
    loop {
        let next = queue.lock().pop_front();
        let Some((index, input)) = next else {
            break;
        };
        if tx.send(WorkerEvent::Started { index, worker }).is_err() {
            break;
        }

        let start = Instant::now();
        let outcome = runner.run(index, &input).await;
        let event = WorkerEvent::Finished {
            index,
            outcome,
            elapsed: start.elapsed(),
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}
