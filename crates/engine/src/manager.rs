//! Reflection manager: one reflector per registered kind, with lifecycle
//! fan-out and per-kind fault isolation.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use speil_core::{Error, KindId, NamespaceMapping};
use speil_store::{MutableStore, ObjectStore};

use crate::reflector::Reflector;
use crate::{EngineConfig, KindRegistry, ReflectedKind};

/// What happened when a mapping was fanned out across the registered kinds.
#[derive(Debug)]
pub struct MappingReport {
    pub mapping: NamespaceMapping,
    pub started: Vec<KindId>,
    pub failed: Vec<(KindId, Error)>,
}

impl MappingReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the per-kind reflectors and fans namespace lifecycle out to them.
///
/// Reflectors spin up lazily on the first mapping that needs them. A kind
/// that fails to start a pair never stops the other kinds from reflecting.
pub struct ReflectionManager {
    registry: KindRegistry,
    local: Arc<dyn ObjectStore>,
    remote: Arc<dyn MutableStore>,
    config: EngineConfig,
    reflectors: Mutex<FxHashMap<KindId, Arc<Reflector>>>,
}

impl ReflectionManager {
    pub fn new(
        registry: KindRegistry,
        local: Arc<dyn ObjectStore>,
        remote: Arc<dyn MutableStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            local,
            remote,
            config,
            reflectors: Mutex::new(FxHashMap::default()),
        }
    }

    /// Start reflecting `mapping` for every registered kind.
    pub async fn start_mapping(&self, mapping: &NamespaceMapping) -> MappingReport {
        let mut report = MappingReport {
            mapping: mapping.clone(),
            started: Vec::new(),
            failed: Vec::new(),
        };
        for kind in self.registry.iter() {
            let id = kind.id();
            let reflector = self.reflector_for(kind);
            match reflector.start_pair(mapping.clone()).await {
                Ok(()) => report.started.push(id),
                Err(e) => {
                    warn!(kind = %id, mapping = %mapping, error = %e,
                          "kind failed to start, continuing with the others");
                    report.failed.push((id, e));
                }
            }
        }
        info!(mapping = %mapping, started = report.started.len(),
              failed = report.failed.len(), "mapping started");
        report
    }

    /// Stop reflecting the pair rooted at `local_ns` on every kind.
    pub async fn stop_mapping(&self, local_ns: &str) {
        let reflectors: Vec<Arc<Reflector>> = {
            let guard = self.reflectors.lock().unwrap();
            guard.values().cloned().collect()
        };
        for reflector in reflectors {
            reflector.stop_pair(local_ns).await;
        }
        info!(ns = %local_ns, "mapping stopped");
    }

    /// Stop everything: every pair of every kind, then the workers.
    pub async fn shutdown(&self) {
        let reflectors: Vec<Arc<Reflector>> = {
            let mut guard = self.reflectors.lock().unwrap();
            guard.drain().map(|(_, r)| r).collect()
        };
        for reflector in reflectors {
            reflector.shutdown().await;
        }
        info!("reflection manager stopped");
    }

    pub fn kind_ids(&self) -> Vec<KindId> {
        self.registry.ids()
    }

    /// The reflector for `id`, when one has been started.
    pub fn reflector(&self, id: &KindId) -> Option<Arc<Reflector>> {
        self.reflectors.lock().unwrap().get(id).cloned()
    }

    fn reflector_for(&self, kind: &Arc<dyn ReflectedKind>) -> Arc<Reflector> {
        let mut reflectors = self.reflectors.lock().unwrap();
        reflectors
            .entry(kind.id())
            .or_insert_with(|| {
                Reflector::new(
                    Arc::clone(kind),
                    Arc::clone(&self.local),
                    Arc::clone(&self.remote),
                    &self.config,
                )
            })
            .clone()
    }
}
