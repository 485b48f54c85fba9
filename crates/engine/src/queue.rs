//! Coalescing work queue. Pending keys dedup, in-flight keys re-dirty instead
//! of running twice, failed keys come back on a capped exponential backoff.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use speil_core::ObjectRef;

use crate::RetryConfig;

/// What became of a failed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Comes back after the given delay (zero when a fresh event superseded
    /// the failing pass).
    Scheduled { attempt: u32, delay: Duration },
    /// Attempts exhausted; forgotten until a new event arrives.
    Dropped { attempts: u32 },
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    retry: RetryConfig,
}

#[derive(Default)]
struct State {
    ready: VecDeque<ObjectRef>,
    pending: FxHashSet<ObjectRef>,
    processing: FxHashSet<ObjectRef>,
    redirty: FxHashSet<ObjectRef>,
    failures: FxHashMap<ObjectRef, u32>,
    delayed: FxHashMap<ObjectRef, JoinHandle<()>>,
    closed: bool,
}

impl State {
    fn push_ready(&mut self, key: ObjectRef) -> bool {
        if self.closed || !self.pending.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(key);
        true
    }
}

impl WorkQueue {
    pub fn new(retry: RetryConfig) -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(State::default()), notify: Notify::new(), retry })
    }

    /// Enqueue a key. Pending keys coalesce; in-flight keys are marked dirty
    /// and run again after the current pass; keys waiting out a backoff run
    /// right away, since the event carries fresh state.
    pub fn add(&self, key: ObjectRef) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if state.processing.contains(&key) {
            state.redirty.insert(key);
            return;
        }
        if let Some(timer) = state.delayed.remove(&key) {
            timer.abort();
        }
        if state.push_ready(key) {
            self.notify.notify_one();
        }
    }

    /// Next key to work on, `None` once the queue is closed. The key stays
    /// marked in-flight until `done` or `fail`; no two workers ever hold the
    /// same key.
    pub async fn next(&self) -> Option<ObjectRef> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.ready.pop_front() {
                    state.pending.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish an in-flight key. Success and terminal failure both land here;
    /// the attempt counter resets either way, and a key dirtied mid-flight
    /// goes straight back in.
    pub fn done(&self, key: &ObjectRef) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        state.failures.remove(key);
        if state.redirty.remove(key) && state.push_ready(key.clone()) {
            self.notify.notify_one();
        }
    }

    /// Fail an in-flight key. A key dirtied mid-flight runs again right away;
    /// otherwise it comes back after a capped exponential backoff, until the
    /// attempt budget runs out.
    pub fn fail(self: &Arc<Self>, key: ObjectRef) -> RetryDecision {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(&key);
        let attempt = state.failures.get(&key).copied().unwrap_or(0) + 1;

        if state.redirty.remove(&key) {
            state.failures.insert(key.clone(), attempt);
            if state.push_ready(key) {
                self.notify.notify_one();
            }
            return RetryDecision::Scheduled { attempt, delay: Duration::ZERO };
        }

        if attempt > self.retry.max_attempts {
            state.failures.remove(&key);
            return RetryDecision::Dropped { attempts: attempt - 1 };
        }

        state.failures.insert(key.clone(), attempt);
        let delay = self.retry.delay(attempt);
        if !state.closed {
            let queue = Arc::clone(self);
            let timer_key = key.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.requeue(timer_key);
            });
            state.delayed.insert(key, timer);
        }
        RetryDecision::Scheduled { attempt, delay }
    }

    fn requeue(&self, key: ObjectRef) {
        let mut state = self.state.lock().unwrap();
        state.delayed.remove(&key);
        if state.closed {
            return;
        }
        if state.processing.contains(&key) {
            // A fresh event got there first; rerun after the current pass.
            state.redirty.insert(key);
            return;
        }
        if state.push_ready(key) {
            self.notify.notify_one();
        }
    }

    /// Forget every key of `namespace` that is not currently in flight.
    pub fn purge(&self, namespace: &str) {
        let mut state = self.state.lock().unwrap();
        state.ready.retain(|k| k.namespace != namespace);
        state.pending.retain(|k| k.namespace != namespace);
        state.redirty.retain(|k| k.namespace != namespace);
        state.failures.retain(|k, _| k.namespace != namespace);
        let stale: Vec<ObjectRef> = state
            .delayed
            .keys()
            .filter(|k| k.namespace == namespace)
            .cloned()
            .collect();
        for key in stale {
            if let Some(timer) = state.delayed.remove(&key) {
                timer.abort();
            }
        }
    }

    /// True while any key of `namespace` is being worked on.
    pub fn has_active(&self, namespace: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .processing
            .iter()
            .any(|k| k.namespace == namespace)
    }

    /// Keys waiting to be handed out.
    pub fn depth(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    /// True when no key is pending, in flight, or waiting out a backoff.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.ready.is_empty()
            && state.processing.is_empty()
            && state.redirty.is_empty()
            && state.delayed.is_empty()
    }

    /// Stop handing out keys, drop pending ones, cancel scheduled retries and
    /// wake every parked worker.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.ready.clear();
        state.pending.clear();
        state.redirty.clear();
        for (_, timer) in state.delayed.drain() {
            timer.abort();
        }
        drop(state);
        self.notify.notify_waiters();
    }
}
