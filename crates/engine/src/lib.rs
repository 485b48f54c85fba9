//! Reflection engine: one reflector per resource kind, fed by change events
//! through a coalescing work queue, reconciling local objects into remote
//! siblings.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use speil_core::{Error, KindId, Result};

mod forge;
mod kinds;
mod manager;
mod namespaced;
mod queue;
mod reflector;

pub use forge::{
    converged, is_managed, remote_sibling, source_uid, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
    SOURCE_UID_ANNOTATION,
};
pub use kinds::{builtin_kinds, ConfigMaps, Ingresses, Secrets, Services};
pub use manager::{MappingReport, ReflectionManager};
pub use namespaced::NamespacedReflector;
pub use queue::{RetryDecision, WorkQueue};
pub use reflector::Reflector;

/// What a kind does with events for a namespace that has no active remote
/// mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Record the event as deferred and move on; reconciliation happens when
    /// a mapping starts and priming re-walks the namespace.
    Tolerant,
    /// Treat the missing mapping as a transient fault and keep the key on the
    /// retry track until a mapping shows up or attempts run out.
    RequireMapping,
}

/// A resource kind the engine knows how to mirror.
pub trait ReflectedKind: Send + Sync {
    fn id(&self) -> KindId;

    fn fallback(&self) -> FallbackPolicy;

    /// Sections of the remote sibling this engine is the sole writer of.
    /// Owned sections converge on exact equality; any other asserted section
    /// converges on its asserted keys only, since the remote control plane
    /// co-owns the rest (assigned addresses, ports and the like).
    fn owned_sections(&self) -> &'static [&'static str] {
        &[]
    }

    /// Project the payload sections of a local object into the shape its
    /// remote sibling should hold. Identity and marker metadata are stamped
    /// by the caller.
    fn translate(&self, local: &Value) -> Result<Value>;
}

/// The set of reflected kinds, fixed at startup.
#[derive(Default)]
pub struct KindRegistry {
    kinds: Vec<Arc<dyn ReflectedKind>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        for kind in kinds::builtin_kinds() {
            // Built-ins carry distinct ids by construction.
            let _ = reg.register(kind);
        }
        reg
    }

    pub fn register(&mut self, kind: Arc<dyn ReflectedKind>) -> Result<()> {
        let id = kind.id();
        if self.kinds.iter().any(|k| k.id() == id) {
            return Err(Error::configuration(format!("duplicate reflected kind: {id}")));
        }
        self.kinds.push(kind);
        Ok(())
    }

    pub fn get(&self, id: &KindId) -> Option<Arc<dyn ReflectedKind>> {
        self.kinds.iter().find(|k| &k.id() == id).cloned()
    }

    pub fn ids(&self) -> Vec<KindId> {
        self.kinds.iter().map(|k| k.id()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ReflectedKind>> {
        self.kinds.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Backoff tuning for failed reconcile keys.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { base: Duration::from_millis(100), max: Duration::from_secs(30), max_attempts: 10 }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): base doubled per
    /// attempt, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }
}

/// Engine-wide tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workers per kind reflector.
    pub workers: usize,
    pub retry: RetryConfig,
    /// How long a stopping namespace pair waits for in-flight keys.
    pub stop_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 2, retry: RetryConfig::default(), stop_grace: Duration::from_secs(10) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rejects_duplicate_kinds() {
        let mut reg = KindRegistry::new();
        reg.register(Arc::new(kinds::ConfigMaps::default())).unwrap();
        let err = reg
            .register(Arc::new(kinds::ConfigMaps::new(FallbackPolicy::RequireMapping)))
            .unwrap_err();
        assert!(err.to_string().contains("duplicate reflected kind"));
        assert_eq!(reg.ids().len(), 1);
    }

    #[test]
    fn builtins_registry_is_populated() {
        let reg = KindRegistry::with_builtins();
        assert!(reg.get(&KindId::builtin("v1", "ConfigMap")).is_some());
        assert!(reg.get(&KindId::new("networking.k8s.io", "v1", "Ingress")).is_some());
        assert!(!reg.is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            max_attempts: 10,
        };
        assert_eq!(retry.delay(1), Duration::from_millis(100));
        assert_eq!(retry.delay(2), Duration::from_millis(200));
        assert_eq!(retry.delay(5), Duration::from_millis(1600));
        assert_eq!(retry.delay(10), Duration::from_secs(30));
        assert_eq!(retry.delay(u32::MAX), Duration::from_secs(30));
    }
}
