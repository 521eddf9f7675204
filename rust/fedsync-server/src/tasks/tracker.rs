use std::{
    collections::HashMap,
    fmt::Display,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{Future, FutureExt};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::tasks::{Task, TaskError, TaskId, TaskKind};

type TaskCell = Arc<watch::Sender<Task>>;

/// A registry of tasks.
///
/// The registry map is only locked to look up or insert a task. The state of each task lives in
/// its own watch channel, which makes every mutation of a task atomic with respect to other
/// mutations and readers of the same task, without blocking unrelated tasks.
///
/// The tracker is cheap to clone. All clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    tasks: Arc<RwLock<HashMap<TaskId, TaskCell>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `queued` task.
    pub fn create(&self, kind: TaskKind) -> Task {
        let task = Task::new(kind);
        let (sender, _) = watch::channel(task.clone());
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id, Arc::new(sender));
        task
    }

    /// Transitions the task from `queued` to `running`.
    pub fn begin(&self, id: TaskId) -> Result<Task, TaskError> {
        self.transition(id, Task::begin)
    }

    /// Sets the progress of a `running` task.
    ///
    /// # Errors
    /// Fails if the task isn't running or if `value` is less than the current progress or greater
    /// than `100`.
    pub fn report_progress(&self, id: TaskId, value: u8) -> Result<Task, TaskError> {
        self.transition(id, |task| task.report_progress(value))
    }

    /// Completes a `running` task and sets its progress to `100`.
    ///
    /// Completing a completed task is a no-op which returns the unchanged snapshot.
    pub fn complete(&self, id: TaskId) -> Result<Task, TaskError> {
        self.transition(id, Task::complete)
    }

    /// Fails a `queued` or `running` task. The progress is frozen at its last value.
    ///
    /// Failing a failed task is a no-op which returns the unchanged snapshot, i.e. the first
    /// error is kept.
    pub fn fail(&self, id: TaskId, error: impl Into<String>) -> Result<Task, TaskError> {
        let error = error.into();
        self.transition(id, move |task| task.fail(error))
    }

    /// Gets a snapshot of the task.
    pub fn query(&self, id: TaskId) -> Result<Task, TaskError> {
        Ok(self.cell(id)?.borrow().clone())
    }

    /// Gets a listener which observes every future state of the task.
    pub fn subscribe(&self, id: TaskId) -> Result<TaskListener, TaskError> {
        Ok(TaskListener(self.cell(id)?.subscribe()))
    }

    /// Gets the number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creates a task and runs `work` for it on a new tokio task.
    ///
    /// The task is returned right away in its `queued` state. The worker begins the task, runs
    /// the work and then completes the task if the work succeeded or fails it with the error
    /// message otherwise. A panicking work fails the task as well.
    pub fn spawn<F, Fut, E>(&self, kind: TaskKind, work: F) -> Task
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.spawn_holding(kind, (), work)
    }

    /// Like [`spawn()`](Self::spawn), but keeps `resource` alive until the task is terminal.
    ///
    /// The resource is dropped only after the task was completed or failed, so whatever it
    /// guards is never released while the task still reports to be running.
    pub fn spawn_holding<R, F, Fut, E>(&self, kind: TaskKind, resource: R, work: F) -> Task
    where
        R: Send + 'static,
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let task = self.create(kind);
        let id = task.id;
        let tracker = self.clone();
        let handle = TaskHandle {
            id,
            tracker: self.clone(),
        };
        let span = info_span!("task", task_id = %id, kind = %kind);

        tokio::spawn(
            async move {
                if let Err(err) = tracker.begin(id) {
                    error!("failed to start task: {}", err);
                    return;
                }
                info!("task started");

                let outcome = match AssertUnwindSafe(work(handle)).catch_unwind().await {
                    Ok(Ok(())) => tracker.complete(id),
                    Ok(Err(err)) => {
                        warn!("task failed: {}", err);
                        tracker.fail(id, err.to_string())
                    }
                    Err(_) => {
                        error!("task worker panicked");
                        tracker.fail(id, "worker panicked")
                    }
                };
                match outcome {
                    Ok(task) => info!("task finished as {}", task.status),
                    Err(err) => error!("failed to finish task: {}", err),
                }
                drop(resource);
            }
            .instrument(span),
        );

        task
    }

    fn cell(&self, id: TaskId) -> Result<TaskCell, TaskError> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))
    }

    fn transition<F>(&self, id: TaskId, f: F) -> Result<Task, TaskError>
    where
        F: FnOnce(&mut Task) -> Result<bool, TaskError>,
    {
        let cell = self.cell(id)?;
        let mut outcome = None;
        cell.send_if_modified(|task| {
            let result = f(task);
            let modified = matches!(result, Ok(true));
            outcome = Some(result.map(|_| task.clone()));
            modified
        });
        outcome.unwrap_or(Err(TaskError::NotFound(id)))
    }
}

/// A handle given to the work of a spawned task to report its progress.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    tracker: TaskTracker,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// See [`TaskTracker::report_progress()`].
    pub fn report_progress(&self, value: u8) -> Result<(), TaskError> {
        self.tracker.report_progress(self.id, value).map(|_| ())
    }
}

/// A listener for the state changes of a single task.
#[derive(Debug, Clone)]
pub struct TaskListener(watch::Receiver<Task>);

impl TaskListener {
    /// Gets the latest snapshot.
    pub fn get_latest(&self) -> Task {
        self.0.borrow().clone()
    }

    /// Waits until the task reaches a terminal state and returns the terminal snapshot.
    pub async fn terminal(&mut self) -> Task {
        loop {
            let task = self.0.borrow_and_update().clone();
            if task.status.is_terminal() || self.0.changed().await.is_err() {
                return task;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::tasks::TaskStatus;

    fn running_task(tracker: &TaskTracker) -> TaskId {
        let id = tracker.create(TaskKind::Sync).id;
        assert_ok!(tracker.begin(id));
        id
    }

    #[test]
    fn test_create() {
        let tracker = TaskTracker::new();
        let task = tracker.create(TaskKind::Download);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.progress, 0);
        assert_eq!(task.kind, TaskKind::Download);
        assert!(task.started_at.is_none());
        assert_eq!(tracker.query(task.id).unwrap(), task);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_unknown_task() {
        let tracker = TaskTracker::new();
        let id = TaskId::new();
        assert_eq!(tracker.query(id), Err(TaskError::NotFound(id)));
        assert_eq!(tracker.begin(id), Err(TaskError::NotFound(id)));
        assert!(tracker.subscribe(id).is_err());
    }

    #[test]
    fn test_begin_only_once() {
        let tracker = TaskTracker::new();
        let id = running_task(&tracker);
        let task = tracker.query(id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        assert_eq!(
            tracker.begin(id),
            Err(TaskError::InvalidTransition {
                id,
                from: TaskStatus::Running,
                to: TaskStatus::Running
            })
        );
    }

    #[test]
    fn test_report_progress() {
        let tracker = TaskTracker::new();
        let queued = tracker.create(TaskKind::Training).id;
        assert!(matches!(
            tracker.report_progress(queued, 10),
            Err(TaskError::InvalidTransition { .. })
        ));

        let id = running_task(&tracker);
        assert_eq!(tracker.report_progress(id, 30).unwrap().progress, 30);
        // reporting the same value again is fine
        assert_ok!(tracker.report_progress(id, 30));
        assert_eq!(
            tracker.report_progress(id, 20),
            Err(TaskError::InvalidProgress {
                id,
                current: 30,
                value: 20
            })
        );
        assert_err!(tracker.report_progress(id, 101));
        assert_eq!(tracker.query(id).unwrap().progress, 30);
    }

    #[test]
    fn test_complete() {
        let tracker = TaskTracker::new();
        let queued = tracker.create(TaskKind::Sync).id;
        assert_err!(tracker.complete(queued));

        let id = running_task(&tracker);
        assert_ok!(tracker.report_progress(id, 60));
        let completed = tracker.complete(id).unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert_eq!(completed.progress, 100);
        assert!(completed.completed_at.is_some());

        // completing twice is a no-op
        assert_eq!(tracker.complete(id).unwrap(), completed);
        assert_eq!(
            tracker.fail(id, "too late"),
            Err(TaskError::InvalidTransition {
                id,
                from: TaskStatus::Completed,
                to: TaskStatus::Failed
            })
        );
        assert_err!(tracker.report_progress(id, 100));
        assert_eq!(tracker.query(id).unwrap(), completed);
    }

    #[test]
    fn test_fail() {
        let tracker = TaskTracker::new();
        let id = running_task(&tracker);
        assert_ok!(tracker.report_progress(id, 40));

        let failed = tracker.fail(id, "remote exchange failed").unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.progress, 40);
        assert_eq!(failed.error.as_deref(), Some("remote exchange failed"));

        // failing twice is a no-op and keeps the first error
        assert_eq!(tracker.fail(id, "other").unwrap(), failed);
        assert!(matches!(
            tracker.complete(id),
            Err(TaskError::InvalidTransition { .. })
        ));

        // a queued task can fail right away
        let queued = tracker.create(TaskKind::Download).id;
        assert_eq!(tracker.fail(queued, "x").unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_spawn_completes() {
        let tracker = TaskTracker::new();
        let task = tracker.spawn(TaskKind::Download, |handle| async move {
            handle.report_progress(50)?;
            Ok::<_, TaskError>(())
        });
        assert_eq!(task.status, TaskStatus::Queued);

        let done = tracker.subscribe(task.id).unwrap().terminal().await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
    }

    /// Records the status of a task at the moment it is dropped.
    struct StatusOnDrop {
        tracker: TaskTracker,
        id: Arc<Mutex<Option<TaskId>>>,
        seen: Arc<Mutex<Option<TaskStatus>>>,
    }

    impl Drop for StatusOnDrop {
        fn drop(&mut self) {
            if let Some(id) = *self.id.lock().unwrap() {
                *self.seen.lock().unwrap() = self.tracker.query(id).ok().map(|task| task.status);
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_holding_releases_after_terminal() {
        let tracker = TaskTracker::new();
        let id = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(None));
        let resource = StatusOnDrop {
            tracker: tracker.clone(),
            id: id.clone(),
            seen: seen.clone(),
        };

        let task = tracker.spawn_holding(TaskKind::Sync, resource, |handle| async move {
            handle.report_progress(80)?;
            Ok::<_, TaskError>(())
        });
        *id.lock().unwrap() = Some(task.id);

        let done = tracker.subscribe(task.id).unwrap().terminal().await;
        assert_eq!(done.status, TaskStatus::Completed);
        tokio::task::yield_now().await;
        assert_eq!(*seen.lock().unwrap(), Some(TaskStatus::Completed));
    }

    #[tokio::test]
    async fn test_spawn_fails_with_message() {
        let tracker = TaskTracker::new();
        let task = tracker.spawn(TaskKind::Training, |handle| async move {
            handle.report_progress(25).map_err(|e| e.to_string())?;
            Err("no training data available".to_string())
        });

        let done = tracker.subscribe(task.id).unwrap().terminal().await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.progress, 25);
        assert_eq!(done.error.as_deref(), Some("no training data available"));
    }

    #[tokio::test]
    async fn test_spawn_survives_panicking_work() {
        let tracker = TaskTracker::new();
        let task = tracker.spawn(TaskKind::Sync, |_| async move {
            if true {
                panic!("worker bug");
            }
            Ok::<_, TaskError>(())
        });

        let done = tracker.subscribe(task.id).unwrap().terminal().await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("worker panicked"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pollers_observe_monotonic_progress() {
        let tracker = TaskTracker::new();
        let task = tracker.spawn(TaskKind::Sync, |handle| async move {
            for value in 1..100 {
                handle.report_progress(value)?;
                tokio::task::yield_now().await;
            }
            Ok::<_, TaskError>(())
        });
        let id = task.id;

        let pollers = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let mut last = 0;
                    loop {
                        let snapshot = tracker.query(id).unwrap();
                        assert!(snapshot.progress >= last);
                        last = snapshot.progress;
                        if snapshot.status.is_terminal() {
                            return snapshot;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect::<Vec<_>>();

        for poller in pollers {
            let snapshot = poller.await.unwrap();
            assert_eq!(snapshot.status, TaskStatus::Completed);
            assert_eq!(snapshot.progress, 100);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_tasks() {
        let tracker = TaskTracker::new();
        let tasks = (0..50)
            .map(|i| {
                tracker.spawn(TaskKind::Training, move |handle| async move {
                    tokio::time::sleep(Duration::from_millis(i % 5)).await;
                    handle.report_progress(50)?;
                    if i % 10 == 0 {
                        Err(TaskError::NotFound(handle.id()))
                    } else {
                        Ok(())
                    }
                })
            })
            .collect::<Vec<_>>();
        assert_eq!(tracker.len(), 50);

        for (i, task) in tasks.into_iter().enumerate() {
            let done = tracker.subscribe(task.id).unwrap().terminal().await;
            let expected = if i % 10 == 0 {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            assert_eq!(done.status, expected);
        }
    }
}
