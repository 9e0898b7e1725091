//! Execution engine for planned download tasks.
//!
//! The engine takes a [`Plan`] and either hands it back untouched (the
//! non-blocking mode, for callers that drive tasks themselves) or runs every
//! task, in parallel under a semaphore or strictly in order, collecting a
//! [`BatchReport`]. One task failing never stops its siblings.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use datasync::download::{Dispatcher, ExecutionEngine, FetchClient, Plan, RunOutcome};
//!
//! # async fn example(plan: Plan) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ExecutionEngine::with_available_parallelism();
//! let runner = Arc::new(Dispatcher::new(FetchClient::new("api-key")));
//! if let RunOutcome::Completed(report) = engine.run(runner, plan, true, true).await? {
//!     println!("{} ok, {} failed", report.responses.len(), report.error_count());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::task::{DownloadTask, TaskError, TaskOutcome, TaskRunner};
use crate::progress::{NoProgress, ProgressSink};

/// Minimum allowed worker count.
const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
const MAX_WORKERS: usize = 256;

/// Error type for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid worker count provided.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// An ordered, finite, restartable list of download tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    tasks: Vec<DownloadTask>,
}

impl Plan {
    /// Wraps `tasks` in planning order.
    #[must_use]
    pub fn new(tasks: Vec<DownloadTask>) -> Self {
        Self { tasks }
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the plan has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterates the tasks in order. Can be called any number of times.
    pub fn iter(&self) -> std::slice::Iter<'_, DownloadTask> {
        self.tasks.iter()
    }

    /// The tasks as a slice.
    #[must_use]
    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    /// Appends the tasks of `other`.
    pub fn extend(&mut self, other: Plan) {
        self.tasks.extend(other.tasks);
    }

    /// Keeps only the tasks for which `keep` returns true.
    pub fn retain(&mut self, keep: impl FnMut(&DownloadTask) -> bool) {
        self.tasks.retain(keep);
    }

    /// Whether any task needs a frame extractor.
    #[must_use]
    pub fn requires_frame_extraction(&self) -> bool {
        self.tasks.iter().any(DownloadTask::requires_frame_extraction)
    }
}

impl FromIterator<DownloadTask> for Plan {
    fn from_iter<I: IntoIterator<Item = DownloadTask>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for Plan {
    type Item = DownloadTask;
    type IntoIter = std::vec::IntoIter<DownloadTask>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a DownloadTask;
    type IntoIter = std::slice::Iter<'a, DownloadTask>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.iter()
    }
}

/// Result of running a whole plan.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Outcomes of successful tasks, in plan order.
    pub responses: Vec<TaskOutcome>,
    /// Failed tasks with their errors, in plan order.
    pub failures: Vec<(DownloadTask, TaskError)>,
    /// Tasks executed.
    pub total: usize,
}

impl BatchReport {
    /// Number of failed tasks.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    /// Number of successful tasks.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.responses.len()
    }
}

/// What [`ExecutionEngine::run`] did with a plan.
#[derive(Debug)]
pub enum RunOutcome {
    /// Nothing ran; the caller owns the plan.
    Deferred(Plan),
    /// Every task ran.
    Completed(BatchReport),
}

impl RunOutcome {
    /// The deferred plan, if any, and the task count.
    #[must_use]
    pub fn into_parts(self) -> (Option<Plan>, usize) {
        match self {
            Self::Deferred(plan) => {
                let count = plan.len();
                (Some(plan), count)
            }
            Self::Completed(report) => (None, report.total),
        }
    }
}

/// Runs download tasks with bounded concurrency.
///
/// # Concurrency Model
///
/// - Each task runs in its own Tokio task
/// - A semaphore permit is acquired before starting each task
/// - Permits are released when tasks complete (RAII)
/// - Every finished task advances the shared progress counter once
pub struct ExecutionEngine {
    semaphore: Arc<Semaphore>,
    workers: usize,
    progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl ExecutionEngine {
    /// Creates an engine running at most `workers` tasks at once.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if the value is outside
    /// the valid range.
    #[instrument(level = "debug")]
    pub fn new(workers: usize) -> Result<Self, EngineError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(EngineError::InvalidConcurrency { value: workers });
        }
        debug!(workers, "creating execution engine");
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            progress: Arc::new(NoProgress),
        })
    }

    /// Creates an engine sized to the host's available parallelism.
    #[must_use]
    pub fn with_available_parallelism() -> Self {
        let workers = std::thread::available_parallelism()
            .map_or(MIN_WORKERS, std::num::NonZeroUsize::get)
            .clamp(MIN_WORKERS, MAX_WORKERS);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            workers,
            progress: Arc::new(NoProgress),
        }
    }

    /// Reports task completion to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `plan` with `runner`.
    ///
    /// - `blocking = false`: nothing runs; the plan is returned.
    /// - `parallel = true`: tasks run concurrently, up to the worker count.
    /// - `parallel = false`: tasks run one after another, in plan order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SemaphoreClosed`] if the semaphore is closed.
    /// Individual task failures do NOT cause this method to error; they are
    /// collected in the [`BatchReport`].
    #[instrument(skip(self, runner, plan), fields(tasks = plan.len()))]
    pub async fn run(
        &self,
        runner: Arc<dyn TaskRunner>,
        plan: Plan,
        blocking: bool,
        parallel: bool,
    ) -> Result<RunOutcome, EngineError> {
        if !blocking {
            debug!("non-blocking run, returning plan to caller");
            return Ok(RunOutcome::Deferred(plan));
        }

        let total = plan.len();
        info!(total, parallel, workers = self.workers, "starting batch");
        let results = if parallel {
            self.run_parallel(runner, plan).await?
        } else {
            self.run_sequential(runner.as_ref(), plan).await
        };

        let mut report = BatchReport {
            total,
            ..BatchReport::default()
        };
        for (task, result) in results {
            match result {
                Ok(outcome) => report.responses.push(outcome),
                Err(error) => {
                    warn!(url = %task.url(), error = %error, "task failed");
                    report.failures.push((task, error));
                }
            }
        }

        info!(
            succeeded = report.success_count(),
            failed = report.error_count(),
            total,
            "batch complete"
        );
        Ok(RunOutcome::Completed(report))
    }

    async fn run_parallel(
        &self,
        runner: Arc<dyn TaskRunner>,
        plan: Plan,
    ) -> Result<Vec<(DownloadTask, Result<TaskOutcome, TaskError>)>, EngineError> {
        let total = plan.len();
        let finished = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(total);

        for task in plan {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::SemaphoreClosed)?;

            let runner = Arc::clone(&runner);
            let progress = Arc::clone(&self.progress);
            let finished = Arc::clone(&finished);
            let spawned = task.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let result = runner.run_task(&spawned).await;
                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                progress.advance_total(total, 1);
                debug!(done, total, ok = result.is_ok(), "task finished");
                result
            });
            handles.push((task, handle));
        }

        let mut results = Vec::with_capacity(total);
        for (task, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(error = %join_error, "task panicked");
                    self.progress.advance_total(total, 1);
                    Err(TaskError::panicked(&join_error))
                }
            };
            results.push((task, result));
        }
        Ok(results)
    }

    async fn run_sequential(
        &self,
        runner: &dyn TaskRunner,
        plan: Plan,
    ) -> Vec<(DownloadTask, Result<TaskOutcome, TaskError>)> {
        let total = plan.len();
        let mut results = Vec::with_capacity(total);
        for (index, task) in plan.into_iter().enumerate() {
            let result = runner.run_task(&task).await;
            self.progress.advance_total(total, 1);
            debug!(done = index + 1, total, ok = result.is_ok(), "task finished");
            results.push((task, result));
        }
        results
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;

    use super::*;
    use crate::download::{DownloadError, FetchOutcome};

    fn task(n: usize) -> DownloadTask {
        DownloadTask::SingleFile {
            url: format!("https://x/{n}.png"),
            destination: PathBuf::from(format!("{n}.png")),
            transform: None,
            trace: None,
        }
    }

    /// Fails the task whose URL ends in `/3.png`; records call order.
    #[derive(Default)]
    struct FlakyRunner {
        calls: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn run_task(&self, task: &DownloadTask) -> Result<TaskOutcome, TaskError> {
            self.calls.lock().unwrap().push(task.url().to_string());
            if task.url().ends_with("/3.png") {
                return Err(DownloadError::http_status(task.url(), 404).into());
            }
            Ok(TaskOutcome::Fetched(FetchOutcome::Skipped {
                path: task.outputs().remove(0),
            }))
        }
    }

    #[derive(Default)]
    struct CountingProgress {
        advanced: AtomicUsize,
    }

    impl ProgressSink for CountingProgress {
        fn advance_total(&self, _total: usize, advance_by: usize) {
            self.advanced.fetch_add(advance_by, Ordering::SeqCst);
        }

        fn file_progress(
            &self,
            _destination: &std::path::Path,
            _total_bytes: Option<u64>,
            _bytes_sent: u64,
        ) {
        }
    }

    #[test]
    fn test_engine_new_valid_workers() {
        assert_eq!(ExecutionEngine::new(1).unwrap().workers(), 1);
        assert_eq!(ExecutionEngine::new(256).unwrap().workers(), 256);
    }

    #[test]
    fn test_engine_new_invalid_workers() {
        assert!(matches!(
            ExecutionEngine::new(0),
            Err(EngineError::InvalidConcurrency { value: 0 })
        ));
        assert!(matches!(
            ExecutionEngine::new(257),
            Err(EngineError::InvalidConcurrency { value: 257 })
        ));
    }

    #[test]
    fn test_available_parallelism_is_at_least_one() {
        assert!(ExecutionEngine::with_available_parallelism().workers() >= 1);
    }

    #[tokio::test]
    async fn test_non_blocking_returns_plan_untouched() {
        let runner = Arc::new(FlakyRunner::default());
        let plan: Plan = (1..=3).map(task).collect();
        let engine = ExecutionEngine::new(2).unwrap();

        let outcome = engine
            .run(runner.clone(), plan.clone(), false, true)
            .await
            .unwrap();
        let (deferred, count) = outcome.into_parts();

        assert_eq!(count, 3);
        assert_eq!(deferred.unwrap(), plan);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_plan_is_restartable() {
        let plan: Plan = (1..=2).map(task).collect();
        assert_eq!(plan.iter().count(), 2);
        assert_eq!(plan.iter().count(), 2);
        assert_eq!((&plan).into_iter().count(), 2);
    }

    #[tokio::test]
    async fn test_parallel_batch_isolates_failure() {
        let runner = Arc::new(FlakyRunner::default());
        let progress = Arc::new(CountingProgress::default());
        let engine = ExecutionEngine::new(4)
            .unwrap()
            .with_progress(progress.clone());

        let outcome = engine
            .run(runner.clone(), (1..=5).map(task).collect(), true, true)
            .await
            .unwrap();
        let RunOutcome::Completed(report) = outcome else {
            panic!("expected completed run");
        };

        assert_eq!(report.total, 5);
        assert_eq!(report.success_count(), 4);
        assert_eq!(report.error_count(), 1);
        assert_eq!(report.failures[0].0.url(), "https://x/3.png");
        assert_eq!(runner.calls.lock().unwrap().len(), 5);
        assert_eq!(progress.advanced.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_sequential_runs_in_order() {
        let runner = Arc::new(FlakyRunner::default());
        let engine = ExecutionEngine::new(1).unwrap();

        let outcome = engine
            .run(runner.clone(), (1..=5).map(task).collect(), true, false)
            .await
            .unwrap();
        let (deferred, count) = outcome.into_parts();

        assert!(deferred.is_none());
        assert_eq!(count, 5);
        let calls = runner.calls.lock().unwrap().clone();
        let expected: Vec<String> = (1..=5).map(|n| format!("https://x/{n}.png")).collect();
        assert_eq!(calls, expected);
    }

    #[test]
    fn test_plan_retain_and_extraction_flag() {
        let mut plan: Plan = (1..=4).map(task).collect();
        plan.retain(|t| !t.url().ends_with("/2.png"));
        assert_eq!(plan.len(), 3);
        assert!(!plan.requires_frame_extraction());
    }

    #[test]
    fn test_engine_error_display() {
        let msg = EngineError::InvalidConcurrency { value: 0 }.to_string();
        assert!(msg.contains("invalid worker count 0"));
        assert!(msg.contains("256"));
    }
}
