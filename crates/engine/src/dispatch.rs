//! Reconcile dispatcher.
//!
//! Notifications and requeues are coalesced per identity in FIFO order and
//! handed to a bounded set of workers. An identity is never run twice at the
//! same time: a notification that arrives mid-run marks it dirty and it runs
//! again once the current run finishes. Kinds that name an exclusive resource
//! hold its mutex for the whole run. When the queue is at capacity the feed
//! is simply not read, so producers see back-pressure and nothing is dropped.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_core::prelude::*;
use berth_store::Coalescer;
use futures::FutureExt;
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::EngineConfig;

/// Re-check interval while queued keys wait on a lock held outside the dispatcher.
const BLOCKED_POLL: Duration = Duration::from_millis(50);

/// Entry point the dispatcher drives, one identity at a time.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, target: &ObjectRef) -> EngineResult<Action>;

    /// Named resource the kind's runs must hold exclusively.
    fn exclusive(&self, kind: Kind) -> Option<&'static str>;

    fn config(&self) -> &EngineConfig;

    /// Registry the exclusive-resource mutexes come from. Handlers that touch
    /// an exclusive resource outside an exclusive run share it.
    fn locks(&self) -> NamedLocks { NamedLocks::default() }
}

/// Async mutexes keyed by resource name, created on first use.
#[derive(Clone, Default)]
pub struct NamedLocks {
    inner: Arc<std::sync::Mutex<FxHashMap<&'static str, Arc<Mutex<()>>>>>,
}

impl NamedLocks {
    pub fn get(&self, name: &'static str) -> Arc<Mutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.entry(name).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub runs: u64,
    pub errors: u64,
}

/// When to run a key again after a run finished.
fn next_run(cfg: &EngineConfig, res: &EngineResult<Action>) -> Option<Duration> {
    match res {
        Ok(Action::Done) => None,
        Ok(Action::RequeueNow) => Some(Duration::ZERO),
        Ok(Action::RequeueAfter(d)) => Some(cfg.jittered(*d)),
        Err(EngineError::Conflict(_)) => Some(Duration::ZERO),
        Err(e) if e.is_permanent() => None,
        Err(e) if e.is_waiting() => Some(cfg.jittered(cfg.dependency_retry)),
        Err(_) => Some(cfg.jittered(cfg.error_retry)),
    }
}

/// Timed requeues, keeping only the earliest deadline per key.
#[derive(Default)]
struct Timers {
    by_deadline: BTreeMap<(Instant, u64), ObjectRef>,
    by_key: FxHashMap<ObjectRef, (Instant, u64)>,
    seq: u64,
}

impl Timers {
    fn schedule(&mut self, key: ObjectRef, at: Instant) {
        if let Some(&cur) = self.by_key.get(&key) {
            if cur.0 <= at {
                return;
            }
            self.by_deadline.remove(&cur);
        }
        self.seq += 1;
        let slot = (at, self.seq);
        self.by_deadline.insert(slot, key.clone());
        self.by_key.insert(key, slot);
    }

    fn cancel(&mut self, key: &ObjectRef) {
        if let Some(slot) = self.by_key.remove(key) {
            self.by_deadline.remove(&slot);
        }
    }

    fn next(&self) -> Option<Instant> { self.by_deadline.keys().next().map(|(at, _)| *at) }

    fn pop_due(&mut self, now: Instant) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        while let Some((&slot, _)) = self.by_deadline.iter().next() {
            if slot.0 > now {
                break;
            }
            if let Some(key) = self.by_deadline.remove(&slot) {
                self.by_key.remove(&key);
                out.push(key);
            }
        }
        out
    }

    fn is_empty(&self) -> bool { self.by_deadline.is_empty() }
}

type RunResult = (ObjectRef, EngineResult<Action>);

pub struct Dispatcher {
    reconciler: Arc<dyn Reconciler>,
    locks: NamedLocks,
    queue: Coalescer<ObjectRef>,
    running: FxHashSet<ObjectRef>,
    dirty: FxHashSet<ObjectRef>,
    timers: Timers,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(reconciler: Arc<dyn Reconciler>) -> Self {
        let cap = reconciler.config().queue_capacity;
        Self {
            locks: reconciler.locks(),
            reconciler,
            queue: Coalescer::with_capacity(cap),
            running: FxHashSet::default(),
            dirty: FxHashSet::default(),
            timers: Timers::default(),
            stats: DispatchStats::default(),
        }
    }

    fn enqueue(&mut self, key: ObjectRef) {
        if self.running.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        self.timers.cancel(&key);
        self.queue.push(key);
    }

    fn lock_for(&self, key: &ObjectRef) -> Option<Arc<Mutex<()>>> {
        self.reconciler.exclusive(key.kind).map(|name| self.locks.get(name))
    }

    /// Oldest queued key that is not running and whose exclusive resource is free.
    fn next_ready(&mut self) -> Option<(ObjectRef, Option<OwnedMutexGuard<()>>)> {
        let reconciler = self.reconciler.clone();
        let locks = &self.locks;
        let running = &self.running;
        let key = self.queue.pop_where(|k| {
            if running.contains(k) {
                return false;
            }
            match reconciler.exclusive(k.kind) {
                Some(name) => locks.get(name).try_lock().is_ok(),
                None => true,
            }
        })?;
        let guard = match self.lock_for(&key) {
            Some(m) => match m.try_lock_owned() {
                Ok(g) => Some(g),
                Err(_) => {
                    self.queue.push(key);
                    return None;
                }
            },
            None => None,
        };
        Some((key, guard))
    }

    fn finish(&mut self, key: ObjectRef, res: EngineResult<Action>) {
        self.running.remove(&key);
        self.stats.runs += 1;
        counter!("dispatch_runs_total", 1u64, "kind" => key.kind.as_str());
        if let Err(e) = &res {
            self.stats.errors += 1;
            if e.is_permanent() {
                info!(target = %key, error = %e, "not retrying until the record changes");
            }
        }
        let cfg = self.reconciler.config().clone();
        if self.dirty.remove(&key) {
            self.enqueue(key);
            return;
        }
        match next_run(&cfg, &res) {
            None => {}
            Some(d) if d.is_zero() => self.enqueue(key),
            Some(d) => self.timers.schedule(key, Instant::now() + d),
        }
        gauge!("dispatch_queue_depth", self.queue.len() as f64);
    }

    /// Drive runs until `shutdown` resolves, or until the feed closed and no work is left.
    /// In-flight runs are awaited before returning.
    pub async fn run<S>(mut self, mut feed: mpsc::UnboundedReceiver<Notification>, shutdown: S) -> DispatchStats
    where
        S: Future<Output = ()> + Send,
    {
        let workers = self.reconciler.config().workers.max(1);
        let mut join: JoinSet<RunResult> = JoinSet::new();
        let mut feed_open = true;
        let mut stopping = false;
        tokio::pin!(shutdown);
        info!(workers, "dispatcher started");

        loop {
            while !stopping && join.len() < workers {
                let Some((key, guard)) = self.next_ready() else { break };
                self.running.insert(key.clone());
                let r = self.reconciler.clone();
                join.spawn(async move {
                    let _guard = guard;
                    let res = AssertUnwindSafe(r.reconcile(&key)).catch_unwind().await.unwrap_or_else(|_| {
                        Err(EngineError::Internal(format!("{}: reconcile panicked", key)))
                    });
                    (key, res)
                });
            }

            if stopping && join.is_empty() {
                break;
            }
            if !feed_open && join.is_empty() && self.queue.is_empty() && self.timers.is_empty() {
                break;
            }
            let next_timer = self.timers.next();
            let accept = feed_open && !stopping && !self.queue.is_full();
            // free workers but nothing dispatched: every queued key waits on a lock
            let blocked = !stopping && join.len() < workers && !self.queue.is_empty();

            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    info!(in_flight = join.len(), "dispatcher stopping");
                    stopping = true;
                }
                n = feed.recv(), if accept => match n {
                    Some(n) => {
                        debug!(target = %n.target, change = ?n.change, "notified");
                        self.enqueue(n.target);
                    }
                    None => feed_open = false,
                },
                Some(done) = join.join_next(), if !join.is_empty() => match done {
                    Ok((key, res)) => self.finish(key, res),
                    Err(e) => {
                        counter!("dispatch_task_failures_total", 1u64);
                        warn!(error = %e, "reconcile task failed");
                    }
                },
                _ = sleep_until(next_timer.unwrap_or_else(Instant::now)), if next_timer.is_some() && !stopping => {
                    for key in self.timers.pop_due(Instant::now()) {
                        self.enqueue(key);
                    }
                }
                _ = tokio::time::sleep(BLOCKED_POLL), if blocked => {}
            }
        }
        info!(runs = self.stats.runs, errors = self.stats.errors, "dispatcher stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(name: &str) -> ObjectRef { ObjectRef::new(Kind::Registry, "ns", name) }

    #[test]
    fn outcomes_map_to_retry_intervals() {
        let cfg = EngineConfig { jitter: 0.0, ..EngineConfig::default() };
        assert_eq!(next_run(&cfg, &Ok(Action::Done)), None);
        assert_eq!(next_run(&cfg, &Ok(Action::RequeueNow)), Some(Duration::ZERO));
        assert_eq!(next_run(&cfg, &Err(EngineError::Conflict("rv".into()))), Some(Duration::ZERO));
        assert_eq!(next_run(&cfg, &Err(EngineError::Validation("bad".into()))), None);
        assert_eq!(next_run(&cfg, &Err(EngineError::NotReady("p".into()))), Some(cfg.dependency_retry));
        assert_eq!(next_run(&cfg, &Err(EngineError::Transient("503".into()))), Some(cfg.error_retry));
    }

    #[test]
    fn timers_keep_earliest_deadline_per_key() {
        let mut t = Timers::default();
        let now = Instant::now();
        t.schedule(key("a"), now + Duration::from_secs(10));
        t.schedule(key("a"), now + Duration::from_secs(5));
        t.schedule(key("a"), now + Duration::from_secs(20));
        t.schedule(key("b"), now + Duration::from_secs(1));
        assert_eq!(t.next(), Some(now + Duration::from_secs(1)));
        assert_eq!(t.pop_due(now + Duration::from_secs(6)), vec![key("b"), key("a")]);
        assert!(t.is_empty());
    }

    /// Counts concurrent runs per key and overall.
    struct Counter {
        cfg: EngineConfig,
        active: std::sync::Mutex<FxHashMap<ObjectRef, usize>>,
        overlap: AtomicUsize,
        exclusive_active: AtomicUsize,
        exclusive_overlap: AtomicUsize,
        runs: AtomicUsize,
        locks: NamedLocks,
    }

    fn counter(cfg: EngineConfig) -> Arc<Counter> {
        Arc::new(Counter {
            cfg,
            active: Default::default(),
            overlap: AtomicUsize::new(0),
            exclusive_active: AtomicUsize::new(0),
            exclusive_overlap: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            locks: NamedLocks::default(),
        })
    }

    #[async_trait]
    impl Reconciler for Counter {
        async fn reconcile(&self, target: &ObjectRef) -> EngineResult<Action> {
            {
                let mut a = self.active.lock().unwrap();
                let n = a.entry(target.clone()).or_default();
                *n += 1;
                if *n > 1 {
                    self.overlap.fetch_add(1, Ordering::SeqCst);
                }
            }
            if target.kind == Kind::User && self.exclusive_active.fetch_add(1, Ordering::SeqCst) > 0 {
                self.exclusive_overlap.fetch_add(1, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            if target.kind == Kind::User {
                self.exclusive_active.fetch_sub(1, Ordering::SeqCst);
            }
            *self.active.lock().unwrap().get_mut(target).unwrap() -= 1;
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(Action::Done)
        }

        fn exclusive(&self, kind: Kind) -> Option<&'static str> {
            (kind == Kind::User).then_some("helm-repository-cache")
        }

        fn config(&self) -> &EngineConfig { &self.cfg }

        fn locks(&self) -> NamedLocks { self.locks.clone() }
    }

    #[tokio::test]
    async fn identities_never_overlap_and_exclusive_kinds_serialize() {
        let seen = counter(EngineConfig { workers: 8, ..EngineConfig::default() });
        let (tx, rx) = mpsc::unbounded_channel();
        for round in 0..20 {
            for name in ["a", "b", "c"] {
                tx.send(Notification { target: key(name), change: ChangeKind::Applied }).unwrap();
            }
            let user = ObjectRef::new(Kind::User, "ns", format!("u{}", round % 4));
            tx.send(Notification { target: user, change: ChangeKind::Applied }).unwrap();
        }
        drop(tx);
        let stats = Dispatcher::new(seen.clone()).run(rx, std::future::pending()).await;
        assert_eq!(seen.overlap.load(Ordering::SeqCst), 0);
        assert_eq!(seen.exclusive_overlap.load(Ordering::SeqCst), 0);
        assert_eq!(stats.errors, 0);
        // coalescing: far fewer runs than notifications
        assert!(stats.runs < 80, "runs = {}", stats.runs);
        assert!(seen.runs.load(Ordering::SeqCst) >= 7);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_runs() {
        let seen = counter(EngineConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Notification { target: key("a"), change: ChangeKind::Applied }).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(Dispatcher::new(seen.clone()).run(rx, async move {
            let _ = stop_rx.await;
        }));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let _ = stop_tx.send(());
        let stats = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats.runs as usize, seen.runs.load(Ordering::SeqCst));
        drop(tx);
    }

    #[tokio::test]
    async fn exclusive_runs_wait_for_an_outside_holder() {
        let seen = counter(EngineConfig::default());
        let held = seen.locks.get("helm-repository-cache").lock_owned().await;
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Notification { target: ObjectRef::new(Kind::User, "ns", "u0"), change: ChangeKind::Applied }).unwrap();
        tx.send(Notification { target: key("a"), change: ChangeKind::Applied }).unwrap();
        drop(tx);
        let handle = tokio::spawn(Dispatcher::new(seen.clone()).run(rx, std::future::pending()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        // the registry key is not held back by the locked user key
        assert_eq!(seen.runs.load(Ordering::SeqCst), 1);
        drop(held);
        let stats = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(stats.runs, 2);
    }
}
