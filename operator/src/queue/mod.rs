//! Deduplicating, rate limited queue of keys.
//!
//! A key is in at most one of three places at a time: waiting in the queue,
//! being processed by a worker, or both "processing" and "dirty" when it was
//! added again while a worker held it. A dirty key is put back in the queue
//! once the worker calls [`WorkQueue::done`], so no two workers ever see the
//! same key concurrently and no add is lost.

pub mod rate_limiter;

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::Debug,
    hash::Hash,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc},
    time::Instant,
};
use tokio_util::{
    sync::CancellationToken,
    time::{DelayQueue, delay_queue},
};

use self::rate_limiter::RateLimiter;

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Core<K> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> Core<K> {
    fn add(&self, key: K) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }
}

pub struct WorkQueue<K> {
    core: Arc<Core<K>>,
    limiter: Box<dyn RateLimiter<K>>,
    delayed: mpsc::UnboundedSender<(K, Duration)>,
    shutdown: CancellationToken,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Creates the queue and spawns the task that releases delayed keys.
    /// Must be called from within a tokio runtime.
    pub fn new(limiter: impl RateLimiter<K> + 'static) -> Self {
        let core = Arc::new(Core {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        });
        let (delayed, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(release_delayed(core.clone(), rx, shutdown.clone()));

        Self {
            core,
            limiter: Box::new(limiter),
            delayed,
            shutdown,
        }
    }

    /// Marks `key` as needing work. Idempotent while the key is pending.
    pub fn add(&self, key: K) {
        self.core.add(key);
    }

    /// Adds `key` once `delay` has elapsed. A key already waiting keeps the
    /// earlier of the two deadlines.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        // the receiver only goes away after shutdown
        let _ = self.delayed.send((key, delay));
    }

    /// Re-adds a key that failed, after its backoff delay.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.limiter.when(&key);
        tracing::debug!(?key, ?delay, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key` after it was processed successfully.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Waits for the next key. Returns `None` once the queue shuts down.
    ///
    /// The caller owns the key until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let mut notified = pin!(self.core.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.core.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Ends processing of `key`; requeues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.core.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.core.notify.notify_one();
        }
    }

    /// Stops accepting keys and wakes every waiting [`get`](Self::get).
    pub fn shut_down(&self) {
        self.core.state.lock().shutting_down = true;
        self.shutdown.cancel();
        self.core.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.core.state.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Drop for WorkQueue<K> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn release_delayed<K>(
    core: Arc<Core<K>>,
    mut rx: mpsc::UnboundedReceiver<(K, Duration)>,
    shutdown: CancellationToken,
) where
    K: Clone + Eq + Hash,
{
    let mut delayed = DelayQueue::new();
    let mut waiting: HashMap<K, (delay_queue::Key, Instant)> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => {
                let Some((key, delay)) = msg else { break };
                let ready_at = Instant::now() + delay;
                match waiting.get_mut(&key) {
                    Some((_, existing)) if *existing <= ready_at => {}
                    Some((entry, existing)) => {
                        delayed.reset_at(entry, ready_at);
                        *existing = ready_at;
                    }
                    None => {
                        let entry = delayed.insert_at(key.clone(), ready_at);
                        waiting.insert(key, (entry, ready_at));
                    }
                }
            }
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                let key = expired.into_inner();
                waiting.remove(&key);
                core.add(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{rate_limiter::ExponentialBackoff, *};

    fn queue() -> Arc<WorkQueue<&'static str>> {
        Arc::new(WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
        )))
    }

    #[tokio::test]
    async fn repeated_adds_coalesce() {
        let q = queue();
        for _ in 0..10 {
            q.add("a");
        }
        q.add("b");

        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_during_processing_reruns_after_done() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        q.add("a");
        assert!(q.is_empty(), "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn get_waits_for_add() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        q.add("a");
        assert_eq!(waiter.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn shut_down_releases_waiters_and_drops_adds() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shut_down();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }

        q.add("a");
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = queue();
        let start = Instant::now();

        q.add_rate_limited("a");
        assert!(q.is_empty());
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(100));
        q.done(&"a");

        let start = Instant::now();
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(q.num_requeues(&"a"), 2);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_key_keeps_earliest_deadline() {
        let q = queue();
        let start = Instant::now();

        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(1));
        q.add_after("a", Duration::from_secs(5));

        assert_eq!(q.get().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(5));
        q.done(&"a");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(q.is_empty(), "coalesced delays must release the key once");
    }
}
