//! Task manager: identified, cancellable work with optional delay, distinct
//! from the anonymous callables [`crate::worker_pool::WorkerPool`] runs. The
//! id index holds weak references only, so a task released elsewhere never
//! leaks through the index; a task that fails is removed from the index
//! explicitly as soon as its worker observes the failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::DockRpcError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    None = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
    Cancelled = 4,
    Released = 5,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TaskStatus::Running,
            2 => TaskStatus::Success,
            3 => TaskStatus::Failed,
            4 => TaskStatus::Cancelled,
            5 => TaskStatus::Released,
            _ => TaskStatus::None,
        }
    }
}

/// Handle passed to a running task's `on_run` so it can cooperatively observe
/// cancellation; cancellation is cooperative, never forcibly interrupted.
#[derive(Clone)]
pub struct TaskContext {
    cancel_flag: Arc<AtomicBool>,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

type OnRun = Arc<dyn Fn(TaskContext) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>> + Send + Sync>;
type OnError = Arc<dyn Fn(i32, &str) + Send + Sync>;
type OnHook = Arc<dyn Fn() + Send + Sync>;

fn default_on_run() -> OnRun {
    Arc::new(|_ctx| Box::pin(async { Ok(()) }))
}

/// Builds the capability set `{on_run, on_error, on_release, on_cancel}` for
/// one task. Each hook is optional; unset hooks are no-ops.
pub struct TaskBuilder {
    tag: i64,
    retry_interval: Duration,
    on_run: OnRun,
    on_error: OnError,
    on_release: OnHook,
    on_cancel: OnHook,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self {
            tag: 0,
            retry_interval: Duration::ZERO,
            on_run: default_on_run(),
            on_error: Arc::new(|_code, _message| {}),
            on_release: Arc::new(|| {}),
            on_cancel: Arc::new(|| {}),
        }
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: i64) -> Self {
        self.tag = tag;
        self
    }

    /// A task-level contract surfaced to higher-level retry logic; the
    /// manager itself never retries.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn on_run<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.on_run = Arc::new(move |ctx| Box::pin(f(ctx)));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(f);
        self
    }

    pub fn on_release<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_release = Arc::new(f);
        self
    }

    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_cancel = Arc::new(f);
        self
    }

    fn build(self, id: i64) -> Arc<Task> {
        Arc::new(Task {
            id,
            tag: self.tag,
            status: AtomicU8::new(TaskStatus::None as u8),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            retry_interval: self.retry_interval,
            on_run: self.on_run,
            on_error: self.on_error,
            on_release: self.on_release,
            on_cancel: self.on_cancel,
        })
    }
}

/// An identified, cancellable unit of work. `id` is the primary key and
/// unique per process lifetime.
pub struct Task {
    pub id: i64,
    pub tag: i64,
    status: AtomicU8,
    cancel_flag: Arc<AtomicBool>,
    pub retry_interval: Duration,
    on_run: OnRun,
    on_error: OnError,
    on_release: OnHook,
    on_cancel: OnHook,
}

impl Task {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Compare-and-set from `None` to `Running`; returns
    /// [`DockRpcError::ErrorStatus`] without invoking `on_run` if the task
    /// was already started, cancelled, or released.
    async fn run(self: Arc<Self>) -> Result<(), DockRpcError> {
        if self
            .status
            .compare_exchange(
                TaskStatus::None as u8,
                TaskStatus::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(DockRpcError::ErrorStatus);
        }

        let ctx = TaskContext {
            cancel_flag: self.cancel_flag.clone(),
        };
        match (self.on_run)(ctx).await {
            Ok(()) => {
                let final_status = if self.is_cancelled() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Success
                };
                self.status.store(final_status as u8, Ordering::SeqCst);
            }
            Err(message) => {
                self.status.store(TaskStatus::Failed as u8, Ordering::SeqCst);
                (self.on_error)(500, &message);
            }
        }
        Ok(())
    }

    /// Sets status to `Cancelled` unconditionally and sets the cancel flag;
    /// `on_run` is not forcibly interrupted, it is expected to observe
    /// [`TaskContext::is_cancelled`] at its own checkpoints.
    fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.status.store(TaskStatus::Cancelled as u8, Ordering::SeqCst);
        (self.on_cancel)();
    }

    /// `Released` is reachable only from `None`. It is treated as terminal: a
    /// task that reached `Released` is never re-run. Since every
    /// `enqueue`/`delayed_enqueue` call builds a brand-new `Task`, a task
    /// cannot be silently re-enqueued after release through this API.
    fn release(&self) {
        if self
            .status
            .compare_exchange(
                TaskStatus::None as u8,
                TaskStatus::Released as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            (self.on_release)();
        }
    }
}

/// Which queues a manager services. `Normal`: workers consume the immediate
/// queue. `Delayed`: a timer thread promotes due tasks. `Both` enables both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Normal,
    Delayed,
    Both,
}

struct DelayedEntry {
    task: Arc<Task>,
    remaining_ms: i64,
}

const TIMER_TICK: Duration = Duration::from_millis(100);

pub struct TaskManager {
    mode: TaskMode,
    next_id: AtomicI64,
    immediate_tx: mpsc::UnboundedSender<Arc<Task>>,
    immediate_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Task>>>>,
    delayed: Arc<Mutex<Vec<DelayedEntry>>>,
    index: Arc<Mutex<HashMap<i64, Weak<Task>>>>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl TaskManager {
    pub fn new(mode: TaskMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        TaskManager {
            mode,
            next_id: AtomicI64::new(1),
            immediate_tx: tx,
            immediate_rx: Arc::new(tokio::sync::Mutex::new(rx)),
            delayed: Arc::new(Mutex::new(Vec::new())),
            index: Arc::new(Mutex::new(HashMap::new())),
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Adds to the immediate queue; records `id -> task` weakly.
    pub fn enqueue(&self, builder: TaskBuilder) -> Result<i64, DockRpcError> {
        if !self.is_running() {
            return Err(DockRpcError::ErrorManager);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = builder.build(id);
        self.index.lock().unwrap().insert(id, Arc::downgrade(&task));
        self.immediate_tx
            .send(task)
            .map_err(|_| DockRpcError::ErrorManager)?;
        Ok(id)
    }

    /// Adds to the delayed list with a millisecond countdown.
    pub fn delayed_enqueue(&self, builder: TaskBuilder, delay_ms: i64) -> Result<i64, DockRpcError> {
        if !self.is_running() {
            return Err(DockRpcError::ErrorManager);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let task = builder.build(id);
        self.index.lock().unwrap().insert(id, Arc::downgrade(&task));
        self.delayed.lock().unwrap().push(DelayedEntry {
            task,
            remaining_ms: delay_ms,
        });
        Ok(id)
    }

    /// Looks up `id`; if present and alive, sets the cancel flag, invokes
    /// `on_cancel`, and removes it from the id index.
    pub fn cancel(&self, id: i64) -> bool {
        let task = self
            .index
            .lock()
            .unwrap()
            .get(&id)
            .and_then(Weak::upgrade);
        self.index.lock().unwrap().remove(&id);
        match task {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every live task sharing `tag`; a natural extension of
    /// `cancel(id)` grounded in the `tag` field the original's
    /// `task_data.h` already carries (see SPEC_FULL.md supplemental features).
    pub fn cancel_tag(&self, tag: i64) -> usize {
        let matching: Vec<Arc<Task>> = self
            .index
            .lock()
            .unwrap()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|t| t.tag == tag)
            .collect();
        for task in &matching {
            task.cancel();
        }
        self.index
            .lock()
            .unwrap()
            .retain(|_, w| w.upgrade().map(|t| t.tag != tag).unwrap_or(false));
        matching.len()
    }

    pub fn task_status(&self, id: i64) -> Option<TaskStatus> {
        self.index
            .lock()
            .unwrap()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|t| t.status())
    }

    /// Transitions to running if currently stopped; spawns `n` workers and
    /// (if `Delayed` is enabled) the timer thread.
    pub fn start(&self, n: usize) {
        let mut stop_guard = self.stop_tx.lock().unwrap();
        if stop_guard.is_some() {
            return; // already running
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *stop_guard = Some(stop_tx);
        drop(stop_guard);
        self.running.store(true, Ordering::SeqCst);

        let mut workers = self.workers.lock().unwrap();
        for _ in 0..n {
            let immediate_rx = self.immediate_rx.clone();
            let index = self.index.clone();
            let mut stop_rx = stop_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut guard = immediate_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = stop_rx.changed() => None,
                            item = guard.recv() => item,
                        }
                    };
                    match item {
                        Some(task) => {
                            let _ = task.run().await;
                            if task.status() == TaskStatus::Failed {
                                index.lock().unwrap().remove(&task.id);
                            }
                        }
                        None => break,
                    }
                }
            }));
        }
        drop(workers);

        if matches!(self.mode, TaskMode::Delayed | TaskMode::Both) {
            let delayed = self.delayed.clone();
            let tx = self.immediate_tx.clone();
            let mut stop_rx = stop_rx.clone();
            let timer = tokio::spawn(async move {
                let mut interval = tokio::time::interval(TIMER_TICK);
                loop {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        _ = interval.tick() => {
                            let mut due = Vec::new();
                            {
                                let mut list = delayed.lock().unwrap();
                                list.retain_mut(|entry| {
                                    entry.remaining_ms -= TIMER_TICK.as_millis() as i64;
                                    if entry.remaining_ms <= 0 {
                                        due.push(entry.task.clone());
                                        false
                                    } else {
                                        true
                                    }
                                });
                            }
                            for task in due {
                                let _ = tx.send(task);
                            }
                        }
                    }
                }
            });
            *self.timer.lock().unwrap() = Some(timer);
        }
    }

    /// Idempotent. Sets the stop flag, wakes workers, joins threads, then
    /// releases every task still sitting in either queue.
    pub async fn stop(&self) {
        let sent = {
            let mut guard = self.stop_tx.lock().unwrap();
            match guard.take() {
                Some(tx) => {
                    let _ = tx.send(true);
                    true
                }
                None => false,
            }
        };
        if !sent {
            return;
        }

        if let Some(timer) = self.timer.lock().unwrap().take() {
            let _ = timer.await;
        }

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }

        {
            let mut rx = self.immediate_rx.lock().await;
            while let Ok(task) = rx.try_recv() {
                task.release();
            }
        }
        for entry in self.delayed.lock().unwrap().drain(..) {
            entry.task.release();
        }

        self.running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[tokio::test]
    async fn task_runs_to_success() {
        let mgr = TaskManager::new(TaskMode::Normal);
        mgr.start(2);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let id = mgr
            .enqueue(TaskBuilder::new().on_run(move |_ctx| {
                let ran2 = ran2.clone();
                async move {
                    ran2.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(mgr.task_status(id), Some(TaskStatus::Success));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn cancel_mid_flight_observed_cooperatively() {
        let mgr = TaskManager::new(TaskMode::Normal);
        mgr.start(1);
        let cancel_seen = Arc::new(AtomicBool::new(false));
        let on_cancel_calls = Arc::new(AtomicUsize::new(0));
        let cancel_seen2 = cancel_seen.clone();
        let on_cancel_calls2 = on_cancel_calls.clone();
        let id = mgr
            .enqueue(
                TaskBuilder::new()
                    .on_run(move |ctx| {
                        let cancel_seen2 = cancel_seen2.clone();
                        async move {
                            for _ in 0..20 {
                                if ctx.is_cancelled() {
                                    cancel_seen2.store(true, Ordering::SeqCst);
                                    return Ok(());
                                }
                                sleep(Duration::from_millis(10)).await;
                            }
                            Ok(())
                        }
                    })
                    .on_cancel(move || {
                        on_cancel_calls2.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        sleep(Duration::from_millis(50)).await;
        assert!(mgr.cancel(id));
        sleep(Duration::from_millis(100)).await;

        assert!(cancel_seen.load(Ordering::SeqCst));
        assert_eq!(on_cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.task_status(id), Some(TaskStatus::Cancelled));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn run_from_non_none_status_errors_without_running_again() {
        let mgr = TaskManager::new(TaskMode::Normal);
        mgr.start(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let id = mgr
            .enqueue(TaskBuilder::new().on_run(move |_ctx| {
                let runs2 = runs2.clone();
                async move {
                    runs2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }))
            .unwrap();
        sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.task_status(id), Some(TaskStatus::Success));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn delayed_task_promotes_after_delay() {
        let mgr = TaskManager::new(TaskMode::Both);
        mgr.start(1);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        mgr.delayed_enqueue(
            TaskBuilder::new().on_run(move |_ctx| {
                let ran2 = ran2.clone();
                async move {
                    ran2.store(true, Ordering::SeqCst);
                    Ok(())
                }
            }),
            150,
        )
        .unwrap();
        sleep(Duration::from_millis(60)).await;
        assert!(!ran.load(Ordering::SeqCst));
        sleep(Duration::from_millis(250)).await;
        assert!(ran.load(Ordering::SeqCst));
        mgr.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_pending_tasks() {
        let mgr = TaskManager::new(TaskMode::Normal);
        mgr.start(0); // no workers draining the immediate queue
        let released = Arc::new(AtomicBool::new(false));
        let released2 = released.clone();
        mgr.enqueue(TaskBuilder::new().on_release(move || {
            released2.store(true, Ordering::SeqCst);
        }))
        .unwrap();
        mgr.stop().await;
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn enqueue_against_stopped_manager_errors() {
        let mgr = TaskManager::new(TaskMode::Normal);
        let err = mgr.enqueue(TaskBuilder::new()).unwrap_err();
        assert!(matches!(err, DockRpcError::ErrorManager));
    }
}
