//! The reconcile step for one kind under one namespace mapping.

use std::sync::Arc;

use tracing::{debug, info};

use speil_core::{meta, parse_uid, Error, NamespaceMapping, ObjectRef, Outcome, Result};
use speil_store::{DeleteStatus, MutableStore, ObjectStore};

use crate::{forge, ReflectedKind};

/// Reconciles single objects of one kind between a local namespace and its
/// remote counterpart. Stateless between calls: every pass re-reads both
/// sides and converges on what it finds.
pub struct NamespacedReflector {
    kind: Arc<dyn ReflectedKind>,
    mapping: NamespaceMapping,
    local: Arc<dyn ObjectStore>,
    remote: Arc<dyn MutableStore>,
}

impl NamespacedReflector {
    pub fn new(
        kind: Arc<dyn ReflectedKind>,
        mapping: NamespaceMapping,
        local: Arc<dyn ObjectStore>,
        remote: Arc<dyn MutableStore>,
    ) -> Self {
        Self { kind, mapping, local, remote }
    }

    pub fn mapping(&self) -> &NamespaceMapping {
        &self.mapping
    }

    fn local_ref(&self, name: &str) -> ObjectRef {
        ObjectRef::new(self.mapping.local.clone(), name)
    }

    /// Where `name`'s sibling lives on the remote side.
    pub fn remote_ref(&self, name: &str) -> ObjectRef {
        ObjectRef::new(self.mapping.remote.clone(), name)
    }

    /// One level-triggered reconcile of `name`. Reads both sides fresh and
    /// either enforces the remote sibling, removes it, or leaves the world
    /// alone.
    pub async fn handle(&self, name: &str) -> Result<Outcome> {
        let kind_id = self.kind.id();
        debug!(kind = %kind_id, local = %self.local_ref(name), remote = %self.remote_ref(name),
               "handling reflection");

        let local = self.local.get(&kind_id, &self.mapping.local, name).await?;
        let remote = self.remote.get(&kind_id, &self.mapping.remote, name).await?;

        // Never mutate a remote object this engine does not own.
        if let Some(remote_obj) = &remote {
            if !forge::is_managed(remote_obj) {
                if local.is_some() {
                    info!(kind = %kind_id, remote = %self.remote_ref(name),
                          "remote object exists and is not managed by us, skipping reflection");
                }
                return Ok(Outcome::SkippedUnowned);
            }
        }

        // Local object gone: ensure its sibling is too, pinned to the exact
        // instance we observed.
        let Some(local_obj) = local else {
            let Some(remote_obj) = remote else {
                return Ok(Outcome::Noop);
            };
            let uid_str = meta::uid(&remote_obj).ok_or_else(|| {
                Error::validation(format!(
                    "remote object {} has no uid",
                    self.remote_ref(name)
                ))
            })?;
            let uid = parse_uid(uid_str)?;
            return match self
                .remote
                .delete(&kind_id, &self.mapping.remote, name, uid)
                .await?
            {
                DeleteStatus::Deleted => Ok(Outcome::Deleted),
                DeleteStatus::AlreadyGone => Ok(Outcome::Noop),
                DeleteStatus::UidMismatch => {
                    debug!(kind = %kind_id, remote = %self.remote_ref(name),
                           "remote object was replaced since we read it, leaving it alone");
                    Ok(Outcome::Noop)
                }
            };
        };

        let translated = self.kind.translate(&local_obj)?;
        let desired = forge::remote_sibling(&local_obj, translated, &self.mapping.remote)?;

        match &remote {
            Some(current) if forge::converged(&desired, current, self.kind.owned_sections()) => {
                Ok(Outcome::Noop)
            }
            Some(_) => {
                self.remote
                    .apply(&kind_id, &self.mapping.remote, &desired)
                    .await?;
                Ok(Outcome::Updated)
            }
            None => {
                self.remote
                    .apply(&kind_id, &self.mapping.remote, &desired)
                    .await?;
                Ok(Outcome::Created)
            }
        }
    }
}
