use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, broadcast};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::capacity::CapacityProvider;

/// Outcome of one execution slot: whether the user still has queued work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueState {
    Empty,
    NotEmpty,
}

/// Work executed while a user holds a slot on a host.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, user: &str) -> Result<QueueState>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SchedulerEvent {
    Dispatched { host: String, user: String },
    Released { host: String, user: String },
    TaskFailed { host: String, user: String, error: String },
}

/// Per-host view returned by [`HostScheduler::snapshot`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

#[derive(Default)]
struct HostState {
    running: HashSet<String>,
    pending: VecDeque<String>,
    /// Users either pending or running on this host.
    tracked: HashSet<String>,
}

impl HostState {
    /// Moves pending users into running while the host has free slots.
    fn grant(&mut self, capacity: usize) -> Vec<String> {
        let mut granted = Vec::new();
        while self.running.len() < capacity {
            let Some(user) = self.pending.pop_front() else {
                break;
            };
            self.running.insert(user.clone());
            granted.push(user);
        }
        granted
    }

    fn is_idle(&self) -> bool {
        self.tracked.is_empty()
    }
}

impl fmt::Debug for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostState")
            .field("running", &self.running.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[derive(Default)]
struct SchedulerState {
    hosts: HashMap<String, HostState>,
    closed: bool,
}

struct Inner {
    name: String,
    runner: Arc<dyn TaskRunner>,
    capacity: Arc<dyn CapacityProvider>,
    state: Mutex<SchedulerState>,
    tracker: TaskTracker,
    events: broadcast::Sender<SchedulerEvent>,
}

/// Bounded-concurrency dispatcher keyed by database host.
///
/// A user is tracked from the first `add` until its runner reports an empty
/// queue (or fails). While tracked, further `add` calls for the same user are
/// no-ops, so a user never holds more than one slot. A host never runs more
/// users than the capacity provider reports for it at grant time.
#[derive(Clone)]
pub struct HostScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for HostScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("HostScheduler");
        debug
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("tasks", &self.inner.tracker.len());

        match self.inner.state.try_lock() {
            Ok(state) => {
                debug
                    .field("host_count", &state.hosts.len())
                    .field("closed", &state.closed);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }

        debug.finish()
    }
}

impl HostScheduler {
    pub fn new(
        name: impl Into<String>,
        runner: Arc<dyn TaskRunner>,
        capacity: Arc<dyn CapacityProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                runner,
                capacity,
                state: Mutex::new(SchedulerState::default()),
                tracker: TaskTracker::new(),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Signals that `user` has work on `host`. Returns `false` when the
    /// signal was ignored (user already tracked or scheduler closed).
    pub async fn add(&self, host: &str, user: &str) -> bool {
        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                debug!(target: "batch::scheduler", host = %host, user = %user, "scheduler closed; ignoring");
                return false;
            }
            let entry = state.hosts.entry(host.to_string()).or_default();
            if !entry.tracked.insert(user.to_string()) {
                return false;
            }
            entry.pending.push_back(user.to_string());
        }

        let capacity = self.inner.capacity.capacity(host).await;
        let granted = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                Vec::new()
            } else {
                state
                    .hosts
                    .get_mut(host)
                    .map(|entry| entry.grant(capacity))
                    .unwrap_or_default()
            }
        };

        for next in granted {
            self.spawn_slot(host.to_string(), next);
        }
        true
    }

    /// Stops dispatching. Pending users are forgotten; running slots finish
    /// their current task and are then released.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        for entry in state.hosts.values_mut() {
            for user in entry.pending.drain(..) {
                entry.tracked.remove(&user);
            }
        }
        state.hosts.retain(|_, entry| !entry.is_idle());
        self.inner.tracker.close();
        info!(target: "batch::scheduler", name = %self.inner.name, "host scheduler closed");
    }

    /// Resolves once every slot task has finished. Only meaningful after
    /// [`HostScheduler::close`].
    pub async fn wait_idle(&self) {
        self.inner.tracker.wait().await;
    }

    pub async fn snapshot(&self) -> BTreeMap<String, HostSnapshot> {
        let state = self.inner.state.lock().await;
        state
            .hosts
            .iter()
            .map(|(host, entry)| {
                let mut running: Vec<String> = entry.running.iter().cloned().collect();
                running.sort();
                (
                    host.clone(),
                    HostSnapshot {
                        running,
                        pending: entry.pending.iter().cloned().collect(),
                    },
                )
            })
            .collect()
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.inner.events.send(event);
    }

    fn spawn_slot(&self, host: String, user: String) {
        debug!(target: "batch::scheduler", host = %host, user = %user, "slot granted");
        self.emit(SchedulerEvent::Dispatched {
            host: host.clone(),
            user: user.clone(),
        });
        let scheduler = self.clone();
        self.inner
            .tracker
            .spawn(async move { scheduler.run_slot(host, user).await });
    }

    /// Drives one slot. When the user still has work it goes to the back of
    /// the host's pending line, and the slot continues with whoever is next.
    async fn run_slot(self, host: String, mut user: String) {
        loop {
            let outcome = AssertUnwindSafe(self.inner.runner.run(&user))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(crate::error::BatchError::Internal(
                        "task runner panicked".to_string(),
                    ))
                });

            let mut released = None;
            let wants_grant = {
                let mut state = self.inner.state.lock().await;
                let closed = state.closed;
                let Some(entry) = state.hosts.get_mut(&host) else {
                    return;
                };
                entry.running.remove(&user);

                match &outcome {
                    Ok(QueueState::NotEmpty) if !closed => {
                        entry.pending.push_back(user.clone());
                    }
                    _ => {
                        entry.tracked.remove(&user);
                        released = Some(user.clone());
                    }
                }

                let wants_grant = !closed && !entry.pending.is_empty();
                if entry.is_idle() {
                    state.hosts.remove(&host);
                }
                wants_grant
            };

            if let Err(err) = &outcome {
                warn!(
                    target: "batch::scheduler",
                    host = %host,
                    user = %user,
                    error = %err,
                    "task failed; releasing slot"
                );
                self.emit(SchedulerEvent::TaskFailed {
                    host: host.clone(),
                    user: user.clone(),
                    error: err.to_string(),
                });
            }
            if let Some(user) = released {
                debug!(target: "batch::scheduler", host = %host, user = %user, "slot released");
                self.emit(SchedulerEvent::Released {
                    host: host.clone(),
                    user,
                });
            }

            if !wants_grant {
                return;
            }

            // Probed without the lock; `add` may fill the slot meanwhile.
            let capacity = self.inner.capacity.capacity(&host).await;
            let granted = {
                let mut state = self.inner.state.lock().await;
                if state.closed {
                    Vec::new()
                } else {
                    state
                        .hosts
                        .get_mut(&host)
                        .map(|entry| entry.grant(capacity))
                        .unwrap_or_default()
                }
            };

            let mut granted = granted.into_iter();
            let Some(next) = granted.next() else {
                return;
            };
            for other in granted {
                self.spawn_slot(host.clone(), other);
            }
            if next != user {
                self.emit(SchedulerEvent::Dispatched {
                    host: host.clone(),
                    user: next.clone(),
                });
            }
            user = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::capacity::FixedCapacity;
    use crate::error::BatchError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};

    /// Runs `remaining[user]` tasks per user and records peak concurrency.
    #[derive(Default)]
    struct CountingRunner {
        remaining: std::sync::Mutex<HashMap<String, usize>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        runs: AtomicUsize,
        active_users: std::sync::Mutex<HashSet<String>>,
    }

    impl CountingRunner {
        fn with_jobs(jobs: &[(&str, usize)]) -> Self {
            let runner = Self::default();
            {
                let mut remaining = runner.remaining.lock().unwrap();
                for (user, count) in jobs {
                    remaining.insert(user.to_string(), *count);
                }
            }
            runner
        }
    }

    #[async_trait]
    impl TaskRunner for CountingRunner {
        async fn run(&self, user: &str) -> Result<QueueState> {
            assert!(
                self.active_users.lock().unwrap().insert(user.to_string()),
                "user {user} ran twice concurrently"
            );
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;

            let state = {
                let mut remaining = self.remaining.lock().unwrap();
                let left = remaining.entry(user.to_string()).or_default();
                if *left == 0 {
                    QueueState::Empty
                } else {
                    *left -= 1;
                    self.runs.fetch_add(1, Ordering::SeqCst);
                    QueueState::NotEmpty
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.active_users.lock().unwrap().remove(user);
            Ok(state)
        }
    }

    async fn wait_released(
        rx: &mut broadcast::Receiver<SchedulerEvent>,
        mut users: HashSet<&str>,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !users.is_empty() {
                if let SchedulerEvent::Released { user, .. } = rx.recv().await.unwrap() {
                    assert!(users.remove(user.as_str()), "{user} released twice");
                }
            }
        })
        .await
        .expect("users were not released in time");
    }

    #[tokio::test]
    async fn capacity_one_runs_users_one_at_a_time() {
        let runner = Arc::new(CountingRunner::with_jobs(&[("alice", 3), ("bob", 2)]));
        let scheduler =
            HostScheduler::new("test", runner.clone(), Arc::new(FixedCapacity::new(1)));
        let mut rx = scheduler.subscribe();

        assert!(scheduler.add("h1", "alice").await);
        assert!(scheduler.add("h1", "bob").await);
        wait_released(&mut rx, HashSet::from(["alice", "bob"])).await;

        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 5);
        assert!(scheduler.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn hosts_are_bounded_independently() {
        let runner = Arc::new(CountingRunner::with_jobs(&[
            ("a", 2),
            ("b", 2),
            ("c", 2),
            ("d", 2),
        ]));
        let scheduler =
            HostScheduler::new("test", runner.clone(), Arc::new(FixedCapacity::new(2)));
        let mut rx = scheduler.subscribe();

        for user in ["a", "b", "c"] {
            scheduler.add("h1", user).await;
        }
        scheduler.add("h2", "d").await;
        wait_released(&mut rx, HashSet::from(["a", "b", "c", "d"])).await;

        assert!(runner.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(runner.runs.load(Ordering::SeqCst), 8);
    }

    struct BarrierRunner {
        barrier: Barrier,
    }

    #[async_trait]
    impl TaskRunner for BarrierRunner {
        async fn run(&self, _user: &str) -> Result<QueueState> {
            self.barrier.wait().await;
            Ok(QueueState::Empty)
        }
    }

    #[tokio::test]
    async fn two_users_share_a_host_with_capacity_two() {
        let runner = Arc::new(BarrierRunner {
            barrier: Barrier::new(2),
        });
        let scheduler = HostScheduler::new("test", runner, Arc::new(FixedCapacity::new(2)));
        let mut rx = scheduler.subscribe();

        scheduler.add("h1", "alice").await;
        scheduler.add("h1", "bob").await;
        wait_released(&mut rx, HashSet::from(["alice", "bob"])).await;
    }

    struct GatedRunner {
        gate: Notify,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TaskRunner for GatedRunner {
        async fn run(&self, _user: &str) -> Result<QueueState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                Err(BatchError::Queue("store unreachable".to_string()))
            } else {
                Ok(QueueState::Empty)
            }
        }
    }

    #[tokio::test]
    async fn repeated_add_for_tracked_user_is_ignored() {
        let runner = Arc::new(GatedRunner {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let scheduler =
            HostScheduler::new("test", runner.clone(), Arc::new(FixedCapacity::new(4)));
        let mut rx = scheduler.subscribe();

        assert!(scheduler.add("h1", "alice").await);
        assert!(!scheduler.add("h1", "alice").await);
        tokio::task::yield_now().await;

        let snapshot = scheduler.snapshot().await;
        assert_eq!(snapshot["h1"].running, vec!["alice".to_string()]);

        runner.gate.notify_one();
        wait_released(&mut rx, HashSet::from(["alice"])).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_release_the_slot_and_are_reported() {
        let runner = Arc::new(GatedRunner {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let scheduler =
            HostScheduler::new("test", runner.clone(), Arc::new(FixedCapacity::new(1)));
        let mut rx = scheduler.subscribe();

        scheduler.add("h1", "alice").await;
        runner.gate.notify_one();

        let mut failed = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    SchedulerEvent::TaskFailed { user, .. } => {
                        assert_eq!(user, "alice");
                        failed = true;
                    }
                    SchedulerEvent::Released { user, .. } => {
                        assert_eq!(user, "alice");
                        break;
                    }
                    SchedulerEvent::Dispatched { .. } => {}
                }
            }
        })
        .await
        .unwrap();
        assert!(failed);

        // The user can be scheduled again after a failure.
        assert!(scheduler.add("h1", "alice").await);
        runner.gate.notify_one();
        wait_released(&mut rx, HashSet::from(["alice"])).await;
    }

    #[tokio::test]
    async fn close_stops_dispatch_and_wait_idle_returns() {
        let runner = Arc::new(GatedRunner {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let scheduler =
            HostScheduler::new("test", runner.clone(), Arc::new(FixedCapacity::new(1)));

        scheduler.add("h1", "alice").await;
        scheduler.add("h1", "bob").await;
        tokio::task::yield_now().await;
        scheduler.close().await;

        assert!(!scheduler.add("h1", "carol").await);
        assert!(scheduler.snapshot().await["h1"].pending.is_empty());

        runner.gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.snapshot().await.is_empty());
    }

    /// Probes block while `stalled` is set, until `open` is notified.
    #[derive(Debug, Default)]
    struct StalledCapacity {
        calls: AtomicUsize,
        stalled: AtomicBool,
        open: Notify,
    }

    #[async_trait]
    impl CapacityProvider for StalledCapacity {
        async fn capacity(&self, _host: &str) -> usize {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stalled.load(Ordering::SeqCst) {
                self.open.notified().await;
            }
            1
        }
    }

    #[tokio::test]
    async fn slot_is_released_before_capacity_is_probed_again() {
        let runner = Arc::new(GatedRunner {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let capacity = Arc::new(StalledCapacity::default());
        let scheduler = HostScheduler::new("test", runner.clone(), capacity.clone());
        let mut rx = scheduler.subscribe();

        // Nobody waiting: the release needs no probe at all.
        scheduler.add("h1", "alice").await;
        runner.gate.notify_one();
        wait_released(&mut rx, HashSet::from(["alice"])).await;
        assert_eq!(capacity.calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.snapshot().await.is_empty());

        // With bob waiting, alice is released while the next probe stalls.
        scheduler.add("h1", "alice").await;
        scheduler.add("h1", "bob").await;
        capacity.stalled.store(true, Ordering::SeqCst);
        runner.gate.notify_one();
        wait_released(&mut rx, HashSet::from(["alice"])).await;

        let snapshot = scheduler.snapshot().await;
        assert!(snapshot["h1"].running.is_empty());
        assert_eq!(snapshot["h1"].pending, vec!["bob".to_string()]);

        capacity.stalled.store(false, Ordering::SeqCst);
        capacity.open.notify_one();
        runner.gate.notify_one();
        wait_released(&mut rx, HashSet::from(["bob"])).await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    }
}
