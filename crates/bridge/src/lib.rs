//! Kubernetes-backed store views: discovery-resolved dynamic APIs, watch
//! subscriptions, server-side apply under the `speil` field manager, and
//! uid-preconditioned deletes.

#![forbid(unsafe_code)]

use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions},
    config::KubeConfigOptions,
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client, Config,
};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use speil_core::{format_uid, meta, ChangeEvent, Error, EventKind, KindId, Result, Uid};
use speil_store::{CancelHandle, DeleteStatus, EventStream, MutableStore, ObjectStore};

/// Field manager for server-side apply. One manager name on both clusters
/// keeps ownership of every asserted field with the engine.
pub const FIELD_MANAGER: &str = "speil";

const EVENT_BUFFER: usize = 256;

/// Store view over one cluster, addressed through a kube client.
///
/// Kind resolution runs API discovery once per kind and caches the result;
/// a kind that disappears from the cluster mid-run surfaces as API errors on
/// the calls themselves, not as a stale cache problem.
pub struct KubeStore {
    client: Client,
    resources: Mutex<FxHashMap<KindId, ApiResource>>,
}

impl KubeStore {
    /// Connect using ambient resolution (kubeconfig current context, or
    /// in-cluster service account).
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::configuration(format!("kube client bootstrap failed: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Connect to a named kubeconfig context.
    pub async fn connect_to_context(context: &str) -> Result<Self> {
        let opts = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
        let config = Config::from_kubeconfig(&opts)
            .await
            .map_err(|e| Error::configuration(format!("loading kubeconfig context {context:?}: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| Error::configuration(format!("kube client for context {context:?}: {e}")))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client, resources: Mutex::new(FxHashMap::default()) }
    }

    async fn resolve(&self, kind: &KindId) -> Result<ApiResource> {
        {
            let cache = self.resources.lock().unwrap();
            if let Some(ar) = cache.get(kind) {
                return Ok(ar.clone());
            }
        }
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::transient(format!("api discovery: {e}")))?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == kind.group && ar.version == kind.version && ar.kind == kind.kind {
                    if !matches!(caps.scope, Scope::Namespaced) {
                        return Err(Error::configuration(format!(
                            "{kind} is cluster-scoped; only namespaced kinds reflect"
                        )));
                    }
                    self.resources.lock().unwrap().insert(kind.clone(), ar.clone());
                    return Ok(ar);
                }
            }
        }
        Err(Error::configuration(format!("kind not served by cluster: {kind}")))
    }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, kind: &KindId, namespace: &str, name: &str) -> Result<Option<Value>> {
        let ar = self.resolve(kind).await?;
        let api = self.api(&ar, namespace);
        match api.get_opt(name).await.map_err(|e| classify("get", e))? {
            Some(o) => Ok(Some(to_json(&o)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        kind: &KindId,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>> {
        let ar = self.resolve(kind).await?;
        let api = self.api(&ar, namespace);
        let mut lp = ListParams::default();
        if let Some(sel) = label_selector {
            lp = lp.labels(sel);
        }
        let objs = api.list(&lp).await.map_err(|e| classify("list", e))?;
        objs.items.iter().map(to_json).collect()
    }

    async fn subscribe(&self, kind: &KindId, namespace: &str) -> Result<EventStream> {
        let ar = self.resolve(kind).await?;
        let api = self.api(&ar, namespace);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let key = kind.to_string();
        let ns = namespace.to_string();
        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default());
            futures::pin_mut!(stream);
            info!(kind = %key, ns = %ns, "watch started");
            while let Some(ev) = stream.next().await {
                let alive = match ev {
                    Ok(Event::Applied(o)) => forward(&tx, &ns, EventKind::Applied, &o).await,
                    Ok(Event::Deleted(o)) => forward(&tx, &ns, EventKind::Deleted, &o).await,
                    Ok(Event::Restarted(list)) => {
                        debug!(kind = %key, ns = %ns, count = list.len(), "watch restart");
                        let mut alive = true;
                        for o in list.iter() {
                            if !forward(&tx, &ns, EventKind::Applied, o).await {
                                alive = false;
                                break;
                            }
                        }
                        alive
                    }
                    Err(e) => {
                        warn!(kind = %key, ns = %ns, error = %e, "watch error, stream resumes");
                        true
                    }
                };
                if !alive {
                    break;
                }
            }
            debug!(kind = %key, ns = %ns, "watch stopped");
        });
        Ok(EventStream { rx, cancel: CancelHandle::for_task(task) })
    }
}

#[async_trait]
impl MutableStore for KubeStore {
    async fn apply(&self, kind: &KindId, namespace: &str, desired: &Value) -> Result<Value> {
        let name = meta::name(desired)
            .ok_or_else(|| Error::validation("apply object missing metadata.name"))?
            .to_string();
        let ar = self.resolve(kind).await?;
        let api = self.api(&ar, namespace);
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = api
            .patch(&name, &pp, &Patch::Apply(desired))
            .await
            .map_err(|e| classify("apply", e))?;
        to_json(&obj)
    }

    async fn delete(
        &self,
        kind: &KindId,
        namespace: &str,
        name: &str,
        expected_uid: Uid,
    ) -> Result<DeleteStatus> {
        let ar = self.resolve(kind).await?;
        let api = self.api(&ar, namespace);
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(format_uid(expected_uid)),
                resource_version: None,
            }),
            ..Default::default()
        };
        match api.delete(name, &dp).await {
            Ok(_) => Ok(DeleteStatus::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteStatus::AlreadyGone),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(DeleteStatus::UidMismatch),
            Err(e) => Err(classify("delete", e)),
        }
    }
}

async fn forward(
    tx: &mpsc::Sender<ChangeEvent>,
    namespace: &str,
    kind: EventKind,
    obj: &DynamicObject,
) -> bool {
    let Some(name) = obj.metadata.name.clone() else {
        return true;
    };
    tx.send(ChangeEvent { kind, namespace: namespace.to_string(), name })
        .await
        .is_ok()
}

/// Map a kube API failure onto the engine's taxonomy. 404, 409 and 422 carry
/// meaning for reconcile decisions; everything else is assumed transient.
fn classify(op: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) => match ae.code {
            404 => Error::not_found(format!("{op}: {}", ae.message)),
            409 => Error::conflict(format!("{op}: {}", ae.message)),
            422 => Error::validation(format!("{op}: {}", ae.message)),
            _ => Error::transient(format!("{op}: {err}")),
        },
        _ => Error::transient(format!("{op}: {err}")),
    }
}

fn to_json(obj: &DynamicObject) -> Result<Value> {
    let mut v = serde_json::to_value(obj)
        .map_err(|e| Error::validation(format!("serializing api object: {e}")))?;
    strip_managed_fields(&mut v);
    Ok(v)
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(obj) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        obj.remove("managedFields");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "boom".into(),
            reason: "TestReason".into(),
            code,
        })
    }

    #[test]
    fn api_codes_map_to_taxonomy() {
        assert!(matches!(classify("get", api_err(404)), Error::NotFound(_)));
        assert!(matches!(classify("apply", api_err(409)), Error::Conflict(_)));
        assert!(matches!(classify("apply", api_err(422)), Error::Validation(_)));
        assert!(matches!(classify("get", api_err(500)), Error::Transient(_)));
        assert!(classify("apply", api_err(409)).is_retryable());
        assert!(!classify("apply", api_err(422)).is_retryable());
    }

    #[test]
    fn managed_fields_are_stripped() {
        let mut v = serde_json::json!({
            "metadata": { "name": "x", "managedFields": [ { "manager": "speil" } ] }
        });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
    }
}
