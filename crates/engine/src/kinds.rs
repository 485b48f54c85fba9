//! Built-in kind translations.

use std::sync::Arc;

use serde_json::{Map, Value};

use speil_core::{KindId, Result};

use crate::{FallbackPolicy, ReflectedKind};

/// The kinds the engine mirrors out of the box.
pub fn builtin_kinds() -> Vec<Arc<dyn ReflectedKind>> {
    vec![
        Arc::new(ConfigMaps::default()),
        Arc::new(Secrets),
        Arc::new(Services),
        Arc::new(Ingresses::default()),
    ]
}

fn section(local: &Value, key: &str) -> Value {
    local
        .get(key)
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// ConfigMaps mirror their payload as-is. Tolerant of unmapped namespaces by
/// default; construct with [`ConfigMaps::new`] to require a mapping instead.
pub struct ConfigMaps {
    fallback: FallbackPolicy,
}

impl ConfigMaps {
    pub fn new(fallback: FallbackPolicy) -> Self {
        Self { fallback }
    }
}

impl Default for ConfigMaps {
    fn default() -> Self {
        Self::new(FallbackPolicy::Tolerant)
    }
}

impl ReflectedKind for ConfigMaps {
    fn id(&self) -> KindId {
        KindId::builtin("v1", "ConfigMap")
    }

    fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    fn owned_sections(&self) -> &'static [&'static str] {
        &["data", "binaryData"]
    }

    fn translate(&self, local: &Value) -> Result<Value> {
        let mut out = Map::new();
        out.insert("data".into(), section(local, "data"));
        out.insert("binaryData".into(), section(local, "binaryData"));
        if let Some(immutable) = local.get("immutable") {
            out.insert("immutable".into(), immutable.clone());
        }
        Ok(Value::Object(out))
    }
}

const SA_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";

/// Secrets mirror their payload. Service-account tokens become plain opaque
/// secrets, since the token only authenticates against the local cluster.
pub struct Secrets;

impl ReflectedKind for Secrets {
    fn id(&self) -> KindId {
        KindId::builtin("v1", "Secret")
    }

    fn fallback(&self) -> FallbackPolicy {
        FallbackPolicy::RequireMapping
    }

    fn owned_sections(&self) -> &'static [&'static str] {
        &["data"]
    }

    fn translate(&self, local: &Value) -> Result<Value> {
        let mut out = Map::new();
        out.insert("data".into(), section(local, "data"));
        let ty = local.get("type").and_then(|t| t.as_str()).unwrap_or("Opaque");
        let ty = if ty == SA_TOKEN_TYPE { "Opaque" } else { ty };
        out.insert("type".into(), Value::String(ty.to_string()));
        Ok(Value::Object(out))
    }
}

/// Services mirror their spec with cluster-local addressing cleared, so the
/// remote control plane assigns its own.
pub struct Services;

impl ReflectedKind for Services {
    fn id(&self) -> KindId {
        KindId::builtin("v1", "Service")
    }

    fn fallback(&self) -> FallbackPolicy {
        FallbackPolicy::RequireMapping
    }

    fn translate(&self, local: &Value) -> Result<Value> {
        let mut spec = local
            .get("spec")
            .and_then(|s| s.as_object())
            .cloned()
            .unwrap_or_default();
        spec.remove("clusterIP");
        spec.remove("clusterIPs");
        spec.remove("healthCheckNodePort");
        if let Some(ports) = spec.get_mut("ports").and_then(|p| p.as_array_mut()) {
            for port in ports.iter_mut() {
                if let Some(p) = port.as_object_mut() {
                    p.remove("nodePort");
                }
            }
        }
        let mut out = Map::new();
        out.insert("spec".into(), Value::Object(spec));
        Ok(Value::Object(out))
    }
}

/// Ingresses mirror their spec untouched. Fallback policy is chosen at
/// construction like [`ConfigMaps`].
pub struct Ingresses {
    fallback: FallbackPolicy,
}

impl Ingresses {
    pub fn new(fallback: FallbackPolicy) -> Self {
        Self { fallback }
    }
}

impl Default for Ingresses {
    fn default() -> Self {
        Self::new(FallbackPolicy::Tolerant)
    }
}

impl ReflectedKind for Ingresses {
    fn id(&self) -> KindId {
        KindId::new("networking.k8s.io", "v1", "Ingress")
    }

    fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    fn owned_sections(&self) -> &'static [&'static str] {
        &["spec"]
    }

    fn translate(&self, local: &Value) -> Result<Value> {
        let mut out = Map::new();
        out.insert("spec".into(), section(local, "spec"));
        Ok(Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn configmap_payload_passes_through() {
        let local = json!({ "data": { "k": "v" }, "immutable": true });
        let out = ConfigMaps::default().translate(&local).unwrap();
        assert_eq!(out["data"], json!({ "k": "v" }));
        assert_eq!(out["binaryData"], json!({}));
        assert_eq!(out["immutable"], true);
    }

    #[test]
    fn service_account_tokens_become_opaque() {
        let token = json!({
            "type": "kubernetes.io/service-account-token",
            "data": { "token": "zzz" }
        });
        let out = Secrets.translate(&token).unwrap();
        assert_eq!(out["type"], "Opaque");
        assert_eq!(out["data"]["token"], "zzz");

        let tls = json!({ "type": "kubernetes.io/tls", "data": {} });
        assert_eq!(Secrets.translate(&tls).unwrap()["type"], "kubernetes.io/tls");

        let untyped = json!({ "data": {} });
        assert_eq!(Secrets.translate(&untyped).unwrap()["type"], "Opaque");
    }

    #[test]
    fn service_addressing_is_cleared() {
        let local = json!({
            "spec": {
                "type": "LoadBalancer",
                "clusterIP": "10.0.0.7",
                "clusterIPs": ["10.0.0.7"],
                "healthCheckNodePort": 30001,
                "selector": { "app": "web" },
                "ports": [
                    { "port": 80, "protocol": "TCP", "nodePort": 31234 },
                    { "port": 443, "protocol": "TCP", "nodePort": 31235 }
                ]
            }
        });
        let out = Services.translate(&local).unwrap();
        let spec = &out["spec"];
        assert!(spec.get("clusterIP").is_none());
        assert!(spec.get("clusterIPs").is_none());
        assert!(spec.get("healthCheckNodePort").is_none());
        assert_eq!(spec["type"], "LoadBalancer");
        assert_eq!(spec["selector"]["app"], "web");
        for port in spec["ports"].as_array().unwrap() {
            assert!(port.get("nodePort").is_none());
        }
    }

    #[test]
    fn fallback_assignments() {
        assert_eq!(ConfigMaps::default().fallback(), FallbackPolicy::Tolerant);
        assert_eq!(Ingresses::default().fallback(), FallbackPolicy::Tolerant);
        assert_eq!(
            ConfigMaps::new(FallbackPolicy::RequireMapping).fallback(),
            FallbackPolicy::RequireMapping
        );
        assert_eq!(Secrets.fallback(), FallbackPolicy::RequireMapping);
        assert_eq!(Services.fallback(), FallbackPolicy::RequireMapping);
    }
}
