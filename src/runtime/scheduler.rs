/// Deferred task scheduler
///
/// One background loop owns a min-heap of due times. Tasks are addressable by
/// id and grouped by owning workflow instance. Cancelling an instance both drops
/// its pending tasks and cancels that instance's token, which aborts any of its
/// callbacks already in flight at their next await point.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Work run when a task fires
pub type TaskCallback = Box<dyn FnOnce() -> TaskFuture + Send>;

/// Wrap an async closure as a `TaskCallback`
pub fn task_callback<F, Fut>(callback: F) -> TaskCallback
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move || Box::pin(callback()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Delay,
    Timeout,
    Retry,
    Scheduled,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Delay => "delay",
            TaskKind::Timeout => "timeout",
            TaskKind::Retry => "retry",
            TaskKind::Scheduled => "scheduled",
        };
        f.write_str(name)
    }
}

/// A deferred callback owned by one workflow instance
pub struct ScheduledTask {
    pub id: String,
    pub workflow_instance_id: String,
    pub node_id: String,
    pub execute_at: DateTime<Utc>,
    pub kind: TaskKind,
    pub callback: TaskCallback,
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("workflow_instance_id", &self.workflow_instance_id)
            .field("node_id", &self.node_id)
            .field("execute_at", &self.execute_at)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Inspection view of a task that has not fired yet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub id: String,
    pub workflow_instance_id: String,
    pub node_id: String,
    pub execute_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: TaskKind,
}

struct Entry {
    task: ScheduledTask,
    generation: u64,
    epoch: u64,
}

/// Heap key: earliest deadline first, then scheduling order
type QueueKey = Reverse<(Instant, u64, String)>;

/// Deadlines further out than this are clamped, like `tokio::time::sleep`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Stale heap keys tolerated before the heap is rebuilt
const COMPACT_SLACK: usize = 32;

/// Cancellation token of one instance, alive while it has pending or running tasks
struct InstanceToken {
    token: CancellationToken,
    epoch: u64,
    refs: usize,
}

#[derive(Default)]
struct State {
    tasks: HashMap<String, Entry>,
    queue: BinaryHeap<QueueKey>,
    tokens: HashMap<String, InstanceToken>,
    paused: bool,
    next_generation: u64,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Take a reference on the instance's token, returning its epoch
    fn acquire(&mut self, instance_id: &str) -> u64 {
        if let Some(entry) = self.tokens.get_mut(instance_id) {
            entry.refs += 1;
            return entry.epoch;
        }
        let epoch = self.next_generation();
        self.tokens.insert(
            instance_id.to_string(),
            InstanceToken { token: CancellationToken::new(), epoch, refs: 1 },
        );
        epoch
    }

    /// Drop a reference; the token goes once nothing of the instance is left
    fn release(&mut self, instance_id: &str, epoch: u64) {
        let Some(entry) = self.tokens.get_mut(instance_id) else {
            return;
        };
        if entry.epoch != epoch {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.tokens.remove(instance_id);
        }
    }

    fn token(&self, instance_id: &str, epoch: u64) -> CancellationToken {
        match self.tokens.get(instance_id) {
            Some(entry) if entry.epoch == epoch => entry.token.clone(),
            _ => CancellationToken::new(),
        }
    }

    fn is_live(&self, id: &str, generation: u64) -> bool {
        self.tasks.get(id).is_some_and(|entry| entry.generation == generation)
    }

    /// Rebuild the heap once stale keys clearly outnumber live tasks
    fn compact(&mut self) {
        if self.queue.len() <= self.tasks.len() * 2 + COMPACT_SLACK {
            return;
        }
        let State { tasks, queue, .. } = self;
        queue.retain(|Reverse((_, generation, id))| {
            tasks.get(id).is_some_and(|entry| entry.generation == *generation)
        });
    }

    fn remove_task(&mut self, id: &str) -> bool {
        match self.tasks.remove(id) {
            Some(entry) => {
                self.release(&entry.task.workflow_instance_id, entry.epoch);
                self.compact();
                true
            }
            None => false,
        }
    }

    /// Pop every live task whose deadline has passed, discarding stale heap keys
    fn take_due(&mut self, now: Instant) -> Vec<(ScheduledTask, CancellationToken, u64)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, generation, id))) = self.queue.peek().cloned() {
            if !self.is_live(&id, generation) {
                self.queue.pop();
                continue;
            }
            if deadline > now {
                break;
            }
            self.queue.pop();
            if let Some(entry) = self.tasks.remove(&id) {
                // The pending reference carries over to the running callback.
                let token = self.token(&entry.task.workflow_instance_id, entry.epoch);
                due.push((entry.task, token, entry.epoch));
            }
        }
        due
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse((deadline, _, _))| *deadline)
    }
}

/// Wall-clock and monotonic deadlines `after` from now, clamped to `FAR_FUTURE`
fn deadlines_after(after: Duration) -> (DateTime<Utc>, Instant) {
    let after = after.min(FAR_FUTURE);
    let now = Instant::now();
    let deadline = now
        .checked_add(after)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now);
    let execute_at = chrono::Duration::from_std(after)
        .ok()
        .and_then(|offset| Utc::now().checked_add_signed(offset))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (execute_at, deadline)
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of timer-backed deferred callbacks
///
/// Must be created inside a Tokio runtime; the firing loop is spawned on
/// construction and aborted on drop.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: JoinHandle<()>,
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("TaskScheduler")
            .field("pending", &state.tasks.len())
            .field("paused", &state.paused)
            .finish()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Notify::new(),
        });
        let worker = tokio::spawn(run_loop(Arc::clone(&shared)));
        Self { shared, worker }
    }

    /// Register a task; a task already due fires on the next loop turn
    ///
    /// Returns the task id. Scheduling an id that is already pending replaces
    /// the earlier task.
    pub fn schedule(&self, mut task: ScheduledTask) -> String {
        let delay = (task.execute_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let (clamped_at, deadline) = deadlines_after(delay);
        if delay > FAR_FUTURE {
            task.execute_at = clamped_at;
        }
        self.insert(task, deadline, false)
    }

    /// Queue a task. With `unique_id`, a colliding id gets the generation appended
    /// instead of replacing the pending task.
    fn insert(&self, mut task: ScheduledTask, deadline: Instant, unique_id: bool) -> String {
        let id = {
            let mut state = self.shared.lock();
            let generation = state.next_generation();
            if unique_id {
                let base = task.id.clone();
                let mut suffix = generation;
                while state.tasks.contains_key(&task.id) {
                    task.id = format!("{}-{}", base, suffix);
                    suffix += 1;
                }
            } else if state.remove_task(&task.id) {
                tracing::warn!("⚠️ Replacing pending task with the same id: {}", task.id);
            }

            let id = task.id.clone();
            let epoch = state.acquire(&task.workflow_instance_id);
            tracing::debug!("⏰ Scheduled {} task {} for instance {} (node {})",
                task.kind, id, task.workflow_instance_id, task.node_id);
            state.queue.push(Reverse((deadline, generation, id.clone())));
            state.tasks.insert(id.clone(), Entry { task, generation, epoch });
            id
        };
        self.shared.wake.notify_one();
        id
    }

    fn schedule_kind<F, Fut>(
        &self,
        kind: TaskKind,
        instance_id: &str,
        node_id: &str,
        after: Duration,
        suffix: Option<u32>,
        callback: F,
    ) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // `<kind>-<instance>-<node>-<millis>[-<suffix>]`
        let millis = Utc::now().timestamp_millis();
        let id = match suffix {
            Some(suffix) => format!("{}-{}-{}-{}-{}", kind, instance_id, node_id, millis, suffix),
            None => format!("{}-{}-{}-{}", kind, instance_id, node_id, millis),
        };
        let (execute_at, deadline) = deadlines_after(after);
        let task = ScheduledTask {
            id,
            workflow_instance_id: instance_id.to_string(),
            node_id: node_id.to_string(),
            execute_at,
            kind,
            callback: task_callback(callback),
        };
        self.insert(task, deadline, true)
    }

    /// Run `callback` after `delay`
    pub fn schedule_delay<F, Fut>(&self, instance_id: &str, node_id: &str, delay: Duration, callback: F) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.schedule_kind(TaskKind::Delay, instance_id, node_id, delay, None, callback)
    }

    /// Run `callback` once `timeout` has elapsed unless cancelled first
    pub fn schedule_timeout<F, Fut>(&self, instance_id: &str, node_id: &str, timeout: Duration, callback: F) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.schedule_kind(TaskKind::Timeout, instance_id, node_id, timeout, None, callback)
    }

    /// Run attempt number `retry_count` of some work after `delay`
    pub fn schedule_retry<F, Fut>(
        &self,
        instance_id: &str,
        node_id: &str,
        retry_count: u32,
        delay: Duration,
        callback: F,
    ) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.schedule_kind(TaskKind::Retry, instance_id, node_id, delay, Some(retry_count), callback)
    }

    /// Cancel one pending task, returning whether it existed
    pub fn cancel(&self, task_id: &str) -> bool {
        let removed = self.shared.lock().remove_task(task_id);
        if removed {
            tracing::debug!("🛑 Cancelled task {}", task_id);
            self.shared.wake.notify_one();
        }
        removed
    }

    /// Cancel every task of an instance and abort its in-flight callbacks
    ///
    /// Returns the number of pending tasks removed.
    pub fn cancel_workflow(&self, instance_id: &str) -> usize {
        let cancelled = {
            let mut state = self.shared.lock();
            let before = state.tasks.len();
            state.tasks.retain(|_, entry| entry.task.workflow_instance_id != instance_id);
            let cancelled = before - state.tasks.len();
            if cancelled > 0 {
                let State { tasks, queue, .. } = &mut *state;
                queue.retain(|Reverse((_, generation, id))| {
                    tasks.get(id).is_some_and(|entry| entry.generation == *generation)
                });
            }
            if let Some(entry) = state.tokens.remove(instance_id) {
                entry.token.cancel();
            }
            cancelled
        };

        if cancelled > 0 {
            tracing::debug!("🛑 Cancelled {} tasks for instance {}", cancelled, instance_id);
            self.shared.wake.notify_one();
        }
        cancelled
    }

    /// Stop firing without discarding tasks
    pub fn pause(&self) {
        self.shared.lock().paused = true;
        self.shared.wake.notify_one();
        tracing::info!("⏸️ Scheduler paused");
    }

    /// Resume firing; tasks that came due while paused fire immediately
    pub fn resume(&self) {
        self.shared.lock().paused = false;
        self.shared.wake.notify_one();
        tracing::info!("▶️ Scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// Cancel everything, including in-flight callbacks
    pub fn clear(&self) {
        {
            let mut state = self.shared.lock();
            state.tasks.clear();
            state.queue.clear();
            for (_, entry) in state.tokens.drain() {
                entry.token.cancel();
            }
        }
        self.shared.wake.notify_one();
        tracing::info!("🧹 Scheduler cleared");
    }

    /// Outstanding tasks, optionally for one instance, earliest first
    pub fn pending_tasks(&self, instance_id: Option<&str>) -> Vec<PendingTask> {
        let state = self.shared.lock();
        let mut pending: Vec<PendingTask> = state
            .tasks
            .values()
            .map(|entry| &entry.task)
            .filter(|task| instance_id.map_or(true, |id| task.workflow_instance_id == id))
            .map(|task| PendingTask {
                id: task.id.clone(),
                workflow_instance_id: task.workflow_instance_id.clone(),
                node_id: task.node_id.clone(),
                execute_at: task.execute_at,
                kind: task.kind,
            })
            .collect();
        pending.sort_by(|a, b| a.execute_at.cmp(&b.execute_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }
}

/// Firing loop: sleep until the earliest deadline or a wake-up, then fire what is due
async fn run_loop(shared: Arc<Shared>) {
    loop {
        let (due, next_deadline) = {
            let mut state = shared.lock();
            if state.paused {
                (Vec::new(), None)
            } else {
                let due = state.take_due(Instant::now());
                (due, state.next_deadline())
            }
        };

        for (task, token, epoch) in due {
            fire(Arc::clone(&shared), task, token, epoch);
        }

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = shared.wake.notified() => {}
                }
            }
            None => shared.wake.notified().await,
        }
    }
}

/// Run one task's callback on its own Tokio task under its instance token
fn fire(shared: Arc<Shared>, task: ScheduledTask, token: CancellationToken, epoch: u64) {
    let ScheduledTask { id, workflow_instance_id, callback, kind, .. } = task;
    tracing::debug!("🔔 Firing {} task {} for instance {}", kind, id, workflow_instance_id);

    tokio::spawn(async move {
        let run = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("⏹️ Task callback interrupted by cancellation");
                    Ok(())
                }
                result = callback() => result,
            }
        });

        match run.await {
            Ok(Ok(())) => tracing::debug!("✅ Task {} finished", id),
            Ok(Err(e)) => tracing::error!("❌ Scheduled task {} failed: {:#}", id, e),
            Err(e) => tracing::error!("❌ Scheduled task {} panicked: {}", id, e),
        }
        shared.lock().release(&workflow_instance_id, epoch);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn bump(count: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<Result<()>> + Send + 'static {
        let count = Arc::clone(count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delay_fires_once_after_its_deadline() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        let id = scheduler.schedule_delay("inst-1", "a", Duration::from_millis(100), bump(&fired));
        assert!(id.starts_with("delay-inst-1-a-"));
        assert_eq!(scheduler.pending_tasks(None).len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.pending_tasks(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_instance_never_fires() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        scheduler.schedule_delay("inst-1", "a", Duration::from_millis(100), bump(&fired));
        scheduler.schedule_timeout("inst-1", "b", Duration::from_millis(200), bump(&fired));
        scheduler.schedule_delay("inst-2", "a", Duration::from_millis(100), bump(&fired));

        assert_eq!(scheduler.cancel_workflow("inst-1"), 2);
        assert_eq!(scheduler.pending_tasks(Some("inst-1")).len(), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_single_task() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        let id = scheduler.schedule_retry("inst-1", "a", 2, Duration::from_millis(10), bump(&fired));
        assert!(id.ends_with("-2"));
        assert!(scheduler.cancel(&id));
        assert!(!scheduler.cancel(&id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_scheduler_holds_tasks_until_resumed() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        scheduler.pause();
        scheduler.schedule_delay("inst-1", "a", Duration::from_millis(10), bump(&fired));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending_tasks(None).len(), 1);

        scheduler.resume();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_callback_is_interrupted() {
        let scheduler = TaskScheduler::new();
        let finished = counter();
        let flag = Arc::clone(&finished);

        scheduler.schedule_delay("inst-1", "a", Duration::from_millis(10), move || async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            flag.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.cancel_workflow("inst-1"), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_panicking_callbacks_do_not_stop_the_loop() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        scheduler.schedule_delay("inst-1", "a", Duration::from_millis(10), || async {
            Result::<()>::Err(anyhow::anyhow!("callback failed"))
        });
        scheduler.schedule_delay("inst-1", "b", Duration::from_millis(20), || async {
            let outcome: Result<()> = Err(anyhow::anyhow!("callback panicked"));
            outcome.unwrap();
            Ok(())
        });
        scheduler.schedule_delay("inst-1", "c", Duration::from_millis(30), bump(&fired));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_tasks_are_sorted_and_filtered() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        scheduler.schedule_delay("inst-1", "late", Duration::from_secs(30), bump(&fired));
        scheduler.schedule_delay("inst-1", "early", Duration::from_secs(10), bump(&fired));
        scheduler.schedule_delay("inst-2", "other", Duration::from_secs(20), bump(&fired));

        let all = scheduler.pending_tasks(None);
        assert_eq!(all.len(), 3);
        let nodes: Vec<&str> = all.iter().map(|task| task.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["early", "other", "late"]);

        let mine = scheduler.pending_tasks(Some("inst-2"));
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].kind, TaskKind::Delay);

        scheduler.clear();
        assert!(scheduler.pending_tasks(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_task_with_same_id_replaces_earlier() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        for node in ["first", "second"] {
            let callback = bump(&fired);
            scheduler.schedule(ScheduledTask {
                id: "fixed".to_string(),
                workflow_instance_id: "inst-1".to_string(),
                node_id: node.to_string(),
                execute_at: Utc::now() + chrono::Duration::milliseconds(10),
                kind: TaskKind::Scheduled,
                callback: task_callback(callback),
            });
        }

        let pending = scheduler.pending_tasks(None);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].node_id, "second");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn task_already_due_fires_immediately() {
        let scheduler = TaskScheduler::new();
        let fired = counter();
        let started = Instant::now();

        scheduler.schedule(ScheduledTask {
            id: "overdue".to_string(),
            workflow_instance_id: "inst-1".to_string(),
            node_id: "a".to_string(),
            execute_at: Utc::now() - chrono::Duration::seconds(5),
            kind: TaskKind::Scheduled,
            callback: task_callback(bump(&fired)),
        });

        for _ in 0..20 {
            if fired.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(1));
        assert!(scheduler.pending_tasks(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_delays_are_clamped_instead_of_overflowing() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        let forever = scheduler.schedule_timeout("inst-1", "a", Duration::MAX, bump(&fired));
        scheduler.schedule_delay("inst-1", "b", Duration::from_millis(u64::MAX / 4), bump(&fired));
        scheduler.schedule(ScheduledTask {
            id: "far".to_string(),
            workflow_instance_id: "inst-1".to_string(),
            node_id: "c".to_string(),
            execute_at: DateTime::<Utc>::MAX_UTC,
            kind: TaskKind::Scheduled,
            callback: task_callback(bump(&fired)),
        });

        let pending = scheduler.pending_tasks(Some("inst-1"));
        assert_eq!(pending.len(), 3);
        let horizon = Utc::now() + chrono::Duration::days(365 * 29);
        assert!(pending.iter().all(|task| task.execute_at > horizon));
        assert!(pending.iter().all(|task| task.execute_at < DateTime::<Utc>::MAX_UTC));

        tokio::time::sleep(Duration::from_secs(86_400)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.cancel(&forever));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timeouts_do_not_accumulate() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        scheduler.schedule_delay("live", "a", Duration::from_secs(1), bump(&fired));
        for i in 0..2_000 {
            let instance = format!("inst-{}", i);
            let id = scheduler.schedule_timeout(&instance, "wait", Duration::from_secs(3_600), bump(&fired));
            assert!(scheduler.cancel(&id));
        }

        {
            let state = scheduler.shared.lock();
            assert_eq!(state.tasks.len(), 1);
            assert!(state.queue.len() <= state.tasks.len() * 2 + COMPACT_SLACK + 1);
            assert_eq!(state.tokens.len(), 1);
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        let state = scheduler.shared.lock();
        assert!(state.tasks.is_empty());
        assert!(state.queue.is_empty());
        assert!(state.tokens.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_workflow_drops_heap_keys() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        for node in ["a", "b", "c"] {
            scheduler.schedule_timeout("inst-1", node, Duration::from_secs(60), bump(&fired));
        }
        scheduler.schedule_timeout("inst-2", "a", Duration::from_secs(60), bump(&fired));

        assert_eq!(scheduler.cancel_workflow("inst-1"), 3);
        let state = scheduler.shared.lock();
        assert_eq!(state.queue.len(), 1);
        assert!(!state.tokens.contains_key("inst-1"));
        assert!(state.tokens.contains_key("inst-2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_generated_ids_never_collide() {
        let scheduler = TaskScheduler::new();
        let fired = counter();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        scheduler.schedule_delay("inst-1", "a", Duration::from_secs(3_600), bump(&fired));
                    }
                });
            }
        });

        assert_eq!(scheduler.pending_tasks(Some("inst-1")).len(), 1_000);
        scheduler.clear();
    }
}
