//! Per-kind reflection driver: namespace pair lifecycle, change-event pumps,
//! and the worker pool draining the shared queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::{counter, gauge, histogram};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use speil_core::{meta, ChangeEvent, Error, NamespaceMapping, ObjectRef, Outcome, Result};
use speil_store::{CancelHandle, EventStream, MutableStore, ObjectStore};

use crate::namespaced::NamespacedReflector;
use crate::queue::{RetryDecision, WorkQueue};
use crate::{forge, EngineConfig, FallbackPolicy, ReflectedKind};

struct PairState {
    nsr: Arc<NamespacedReflector>,
    pumps: Mutex<Vec<CancelHandle>>,
}

/// Drives reflection of one kind across any number of namespace pairs.
///
/// All pairs share one queue and one worker pool; keys are always filed under
/// the local namespace, whichever side the change came from.
pub struct Reflector {
    kind: Arc<dyn ReflectedKind>,
    kind_label: String,
    local: Arc<dyn ObjectStore>,
    remote: Arc<dyn MutableStore>,
    queue: Arc<WorkQueue>,
    pairs: ArcSwap<FxHashMap<String, Arc<PairState>>>,
    pairs_write: Mutex<()>,
    stopped: Mutex<FxHashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop_grace: Duration,
}

impl Reflector {
    pub fn new(
        kind: Arc<dyn ReflectedKind>,
        local: Arc<dyn ObjectStore>,
        remote: Arc<dyn MutableStore>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let reflector = Arc::new(Self {
            kind_label: kind.id().to_string(),
            kind,
            local,
            remote,
            queue: WorkQueue::new(config.retry.clone()),
            pairs: ArcSwap::from_pointee(FxHashMap::default()),
            pairs_write: Mutex::new(()),
            stopped: Mutex::new(FxHashSet::default()),
            workers: Mutex::new(Vec::new()),
            stop_grace: config.stop_grace,
        });
        reflector.spawn_workers(config.workers.max(1));
        reflector
    }

    fn spawn_workers(self: &Arc<Self>, count: usize) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..count {
            let reflector = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                while let Some(key) = reflector.queue.next().await {
                    reflector.dispatch(key).await;
                }
            }));
        }
    }

    /// Manually enqueue a key, as if a change event had arrived for it.
    pub fn enqueue(&self, key: ObjectRef) {
        self.queue.add(key);
    }

    /// Local namespaces with an active pair.
    pub fn active_pairs(&self) -> Vec<NamespaceMapping> {
        self.pairs
            .load()
            .values()
            .map(|p| p.nsr.mapping().clone())
            .collect()
    }

    /// Start reflecting a namespace pair: subscribe to both sides, then prime
    /// the queue with every local object and every marked remote one, so
    /// missed history converges too. Idempotent for an identical mapping.
    pub async fn start_pair(self: &Arc<Self>, mapping: NamespaceMapping) -> Result<()> {
        let kind_id = self.kind.id();
        let nsr = Arc::new(NamespacedReflector::new(
            Arc::clone(&self.kind),
            mapping.clone(),
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
        ));
        let state = Arc::new(PairState { nsr, pumps: Mutex::new(Vec::new()) });

        // Publish before wiring, so the first event already finds its pair.
        if !self.insert_pair(&mapping, Arc::clone(&state))? {
            debug!(kind = %kind_id, mapping = %mapping, "reflection pair already running");
            return Ok(());
        }
        self.stopped.lock().unwrap().remove(&mapping.local);
        if let Err(e) = self.wire_pair(&state, &mapping).await {
            self.remove_pair(&mapping.local);
            for pump in state.pumps.lock().unwrap().drain(..) {
                pump.cancel();
            }
            return Err(e);
        }

        info!(kind = %kind_id, mapping = %mapping, "reflection pair started");
        Ok(())
    }

    async fn wire_pair(&self, state: &Arc<PairState>, mapping: &NamespaceMapping) -> Result<()> {
        let kind_id = self.kind.id();

        let EventStream { rx, cancel } = self.local.subscribe(&kind_id, &mapping.local).await?;
        let pump = self.spawn_pump(rx, mapping.local.clone());
        {
            let mut pumps = state.pumps.lock().unwrap();
            pumps.push(cancel);
            pumps.push(pump);
        }

        let EventStream { rx, cancel } = self.remote.subscribe(&kind_id, &mapping.remote).await?;
        let pump = self.spawn_pump(rx, mapping.local.clone());
        {
            let mut pumps = state.pumps.lock().unwrap();
            pumps.push(cancel);
            pumps.push(pump);
        }

        let mut primed = 0usize;
        for obj in self.local.list(&kind_id, &mapping.local, None).await? {
            if let Some(name) = meta::name(&obj) {
                self.queue.add(ObjectRef::new(mapping.local.clone(), name));
                primed += 1;
            }
        }
        // Marked remote objects too, so orphans left from a previous run
        // converge to deletion even without a local event.
        let marker = format!("{}={}", forge::MANAGED_BY_LABEL, forge::MANAGED_BY_VALUE);
        for obj in self
            .remote
            .list(&kind_id, &mapping.remote, Some(&marker))
            .await?
        {
            if let Some(name) = meta::name(&obj) {
                self.queue.add(ObjectRef::new(mapping.local.clone(), name));
                primed += 1;
            }
        }
        debug!(kind = %kind_id, mapping = %mapping, primed, "reflection pair primed");
        Ok(())
    }

    /// All change events, local or remote, key under the LOCAL namespace:
    /// that is the identity a reconcile pass starts from. The subscription's
    /// own [`CancelHandle`] is kept alongside the pump's in [`PairState`], so
    /// stopping a pair tears down the upstream watch too.
    fn spawn_pump(&self, mut rx: mpsc::Receiver<ChangeEvent>, local_ns: String) -> CancelHandle {
        let queue = Arc::clone(&self.queue);
        let task = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                queue.add(ObjectRef::new(local_ns.clone(), ev.name));
            }
        });
        CancelHandle::for_task(task)
    }

    /// Stop a namespace pair: cancel its pumps, purge its queued keys, and
    /// wait out in-flight ones up to the stop grace. Idempotent.
    pub async fn stop_pair(&self, local_ns: &str) {
        let Some(state) = self.remove_pair(local_ns) else {
            return;
        };
        self.stopped.lock().unwrap().insert(local_ns.to_string());
        for pump in state.pumps.lock().unwrap().drain(..) {
            pump.cancel();
        }
        self.queue.purge(local_ns);

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while self.queue.has_active(local_ns) {
            if tokio::time::Instant::now() >= deadline {
                warn!(kind = %self.kind_label, ns = %local_ns,
                      "stop grace expired with keys still in flight");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        info!(kind = %self.kind_label, ns = %local_ns, "reflection pair stopped");
    }

    /// Stop every pair, close the queue and wait for the workers.
    pub async fn shutdown(&self) {
        let locals: Vec<String> = self.pairs.load().keys().cloned().collect();
        for ns in locals {
            self.stop_pair(&ns).await;
        }
        self.queue.close();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap();
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Publish a pair unless its local namespace is taken. `Ok(false)` means
    /// the identical mapping is already running.
    fn insert_pair(&self, mapping: &NamespaceMapping, state: Arc<PairState>) -> Result<bool> {
        let _guard = self.pairs_write.lock().unwrap();
        let current = self.pairs.load();
        if let Some(existing) = current.get(&mapping.local) {
            let active = existing.nsr.mapping();
            if active.remote == mapping.remote {
                return Ok(false);
            }
            return Err(Error::configuration(format!(
                "namespace {} already reflects into {}, cannot also reflect into {}",
                mapping.local, active.remote, mapping.remote
            )));
        }
        let mut next = (**current).clone();
        next.insert(mapping.local.clone(), state);
        self.pairs.store(Arc::new(next));
        Ok(true)
    }

    fn remove_pair(&self, local_ns: &str) -> Option<Arc<PairState>> {
        let _guard = self.pairs_write.lock().unwrap();
        let mut next = (**self.pairs.load()).clone();
        let removed = next.remove(local_ns);
        self.pairs.store(Arc::new(next));
        removed
    }

    /// Run one key to a terminal outcome or a retry decision. A panic-free
    /// error path: faults touch only this key.
    async fn dispatch(&self, key: ObjectRef) {
        let t0 = std::time::Instant::now();
        let pair = {
            let pairs = self.pairs.load();
            pairs.get(&key.namespace).cloned()
        };

        let (result, remote) = match &pair {
            Some(pair) => (
                pair.nsr.handle(&key.name).await,
                pair.nsr.remote_ref(&key.name).to_string(),
            ),
            None => {
                // Keys caught in flight when their pair stopped drain as
                // deferred; only a namespace that never had a mapping is
                // subject to the kind's fallback policy.
                let result = if self.stopped.lock().unwrap().contains(&key.namespace) {
                    Ok(Outcome::Deferred)
                } else {
                    match self.kind.fallback() {
                        FallbackPolicy::Tolerant => Ok(Outcome::Deferred),
                        FallbackPolicy::RequireMapping => Err(Error::transient(format!(
                            "no remote mapping for namespace {}",
                            key.namespace
                        ))),
                    }
                };
                (result, "-".to_string())
            }
        };

        match result {
            Ok(outcome) => {
                counter!("reflect_handle_total", 1u64,
                         "kind" => self.kind_label.clone(), "outcome" => outcome.as_str());
                histogram!("reflect_handle_ms", t0.elapsed().as_secs_f64() * 1000.0,
                           "kind" => self.kind_label.clone());
                match outcome {
                    Outcome::Created
                    | Outcome::Updated
                    | Outcome::Deleted
                    | Outcome::SkippedUnowned => {
                        info!(kind = %self.kind_label, local = %key, remote = %remote,
                              outcome = %outcome, took_ms = %t0.elapsed().as_millis(),
                              "reflected");
                    }
                    Outcome::Noop | Outcome::Deferred => {
                        debug!(kind = %self.kind_label, local = %key, remote = %remote,
                               outcome = %outcome, took_ms = %t0.elapsed().as_millis(),
                               "reflected");
                    }
                }
                self.queue.done(&key);
            }
            Err(e) if e.is_retryable() => match self.queue.fail(key.clone()) {
                RetryDecision::Scheduled { attempt, delay } => {
                    counter!("reflect_retry_total", 1u64, "kind" => self.kind_label.clone());
                    warn!(kind = %self.kind_label, local = %key, attempt,
                          delay_ms = %delay.as_millis(), error = %e,
                          "reconcile failed, will retry");
                }
                RetryDecision::Dropped { attempts } => {
                    counter!("reflect_handle_total", 1u64,
                             "kind" => self.kind_label.clone(), "outcome" => "failed");
                    counter!("reflect_drop_total", 1u64, "kind" => self.kind_label.clone());
                    error!(kind = %self.kind_label, local = %key, attempts, error = %e,
                           "reconcile failed too many times, dropping key until the next event");
                }
            },
            Err(e) => {
                counter!("reflect_handle_total", 1u64,
                         "kind" => self.kind_label.clone(), "outcome" => "failed");
                error!(kind = %self.kind_label, local = %key, error = %e,
                       "reconcile failed terminally");
                self.queue.done(&key);
            }
        }
        gauge!("reflect_queue_depth", self.queue.depth() as f64,
               "kind" => self.kind_label.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::Secrets;
    use speil_store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn stopped_pair_keys_drain_without_retries() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        let mut config = EngineConfig::default();
        config.retry.base = Duration::from_secs(1);
        let reflector = Reflector::new(Arc::new(Secrets), local, remote, &config);
        reflector
            .start_pair(NamespaceMapping::new("demo", "demo-remote"))
            .await
            .unwrap();
        reflector.stop_pair("demo").await;

        // A key caught behind the purge drains as deferred, never landing on
        // the retry track of its require-mapping kind.
        reflector.enqueue(ObjectRef::new("demo", "late"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reflector.queue.is_idle(), "stopped-pair key kept a retry alive");

        // A namespace that never had a mapping still follows the kind policy.
        reflector.enqueue(ObjectRef::new("unmapped", "creds"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reflector.queue.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_clears_the_stopped_mark() {
        let local = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryStore::new());
        let reflector = Reflector::new(
            Arc::new(Secrets),
            local,
            remote,
            &EngineConfig::default(),
        );
        let mapping = NamespaceMapping::new("demo", "demo-remote");
        reflector.start_pair(mapping.clone()).await.unwrap();
        reflector.stop_pair("demo").await;
        assert!(reflector.stopped.lock().unwrap().contains("demo"));

        reflector.start_pair(mapping).await.unwrap();
        assert!(!reflector.stopped.lock().unwrap().contains("demo"));
    }
}
