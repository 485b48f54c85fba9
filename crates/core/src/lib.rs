//! Speil core types: kind identities, object references, namespace mappings,
//! change events, and reconcile outcomes.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod error;
pub mod meta;

pub use error::{Error, Result};

/// Object UID in binary form. The API server hands out UUIDs in practice.
pub type Uid = [u8; 16];

/// Parse a `metadata.uid` string. A live object with a malformed UID is a
/// malformed object, so failures classify as validation errors.
pub fn parse_uid(s: &str) -> Result<Uid> {
    let u = uuid::Uuid::parse_str(s)
        .map_err(|e| Error::validation(format!("invalid metadata.uid {s:?}: {e}")))?;
    Ok(*u.as_bytes())
}

/// Render a binary UID back into the hyphenated form the API expects.
pub fn format_uid(uid: Uid) -> String {
    uuid::Uuid::from_bytes(uid).hyphenated().to_string()
}

/// Identity of a reflected resource kind.
///
/// The canonical rendering is the kind key used everywhere in logs and
/// configuration: `v1/ConfigMap` for core kinds, `group/v1/Kind` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindId {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl KindId {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Core-group kind (empty API group), e.g. `v1/ConfigMap`.
    pub fn builtin(version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::new("", version, kind)
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.kind)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl FromStr for KindId {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => {
                Ok(Self::builtin(*version, *kind))
            }
            [group, version, kind] if !group.is_empty() && !version.is_empty() && !kind.is_empty() => {
                Ok(Self::new(*group, *version, *kind))
            }
            _ => Err(Error::configuration(format!(
                "invalid kind key: {key} (expect v1/Kind or group/v1/Kind)"
            ))),
        }
    }
}

/// Namespaced object reference. Work queue keys always carry the LOCAL
/// namespace, regardless of which side produced the notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One reconciliation domain: a local namespace paired with a remote one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceMapping {
    pub local: String,
    pub remote: String,
}

impl NamespaceMapping {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self { local: local.into(), remote: remote.into() }
    }
}

impl fmt::Display for NamespaceMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Applied,
    Deleted,
}

/// Change notification emitted by an object store view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub namespace: String,
    pub name: String,
}

/// Terminal outcome of one reconcile step. The display form is the wire form
/// used in logs and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated,
    Noop,
    SkippedUnowned,
    Deleted,
    Deferred,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::Updated => "updated",
            Outcome::Noop => "no-op",
            Outcome::SkippedUnowned => "skipped-unowned",
            Outcome::Deleted => "deleted",
            Outcome::Deferred => "deferred",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_key_roundtrip() {
        let cm: KindId = "v1/ConfigMap".parse().unwrap();
        assert_eq!(cm, KindId::builtin("v1", "ConfigMap"));
        assert_eq!(cm.to_string(), "v1/ConfigMap");

        let ing: KindId = "networking.k8s.io/v1/Ingress".parse().unwrap();
        assert_eq!(ing.group, "networking.k8s.io");
        assert_eq!(ing.to_string(), "networking.k8s.io/v1/Ingress");

        assert!("ConfigMap".parse::<KindId>().is_err());
        assert!("a/b/c/d".parse::<KindId>().is_err());
        assert!("/v1/Kind".parse::<KindId>().is_err());
    }

    #[test]
    fn uid_roundtrip() {
        let s = "8c2f0a1e-13d4-4b7e-9a0a-1f2e3d4c5b6a";
        let uid = parse_uid(s).unwrap();
        assert_eq!(format_uid(uid), s);
        assert!(parse_uid("not-a-uuid").is_err());
    }

    #[test]
    fn outcome_wire_form() {
        assert_eq!(Outcome::SkippedUnowned.to_string(), "skipped-unowned");
        assert_eq!(Outcome::Noop.as_str(), "no-op");
    }

    #[test]
    fn object_ref_display() {
        assert_eq!(ObjectRef::new("demo", "cfg").to_string(), "demo/cfg");
    }
}
