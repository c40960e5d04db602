//! Resource identity
//!
//! `ResourceRef` names one object on the cluster and is the dedup key of an
//! apply batch. Its `Display` form is what appears in logs and aggregate
//! errors: `apps/v1/Deployment default/web`, or `v1/Namespace kyma-system`
//! for cluster-scoped objects.

use std::fmt;

use kube::api::DynamicObject;

use crate::kube_utils::parse_api_version;
use crate::{Error, Result};

/// Identity of a single cluster object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceRef {
    /// API group ("" for the core group)
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Resource kind
    pub kind: String,
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceRef {
    /// Build a reference from its parts
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Identify a decoded object.
    ///
    /// Fails when the object lacks `apiVersion`, `kind` or `metadata.name`.
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::validation_for_field("apiVersion", "object is missing apiVersion and kind")
        })?;
        if types.api_version.is_empty() {
            return Err(Error::validation_for_field(
                "apiVersion",
                "object is missing apiVersion",
            ));
        }
        if types.kind.is_empty() {
            return Err(Error::validation_for_field("kind", "object is missing kind"));
        }
        let name = obj
            .metadata
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(
                    "metadata.name",
                    format!("{} object is missing metadata.name", types.kind),
                )
            })?;

        let (group, version) = parse_api_version(&types.api_version);
        Ok(Self {
            group,
            version,
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone().filter(|ns| !ns.is_empty()),
            name: name.to_string(),
        })
    }

    /// Full apiVersion string (`apps/v1`, or `v1` for the core group)
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ", self.api_version(), self.kind)?;
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).expect("test object should deserialize")
    }

    #[test]
    fn display_namespaced_and_cluster_scoped() {
        let deploy = ResourceRef::new("apps", "v1", "Deployment", Some("default"), "web");
        assert_eq!(deploy.to_string(), "apps/v1/Deployment default/web");

        let ns = ResourceRef::new("", "v1", "Namespace", None, "kyma-system");
        assert_eq!(ns.to_string(), "v1/Namespace kyma-system");
    }

    #[test]
    fn from_object_reads_identity() {
        let obj = object(json!({
            "apiVersion": "operator.kyma-project.io/v1beta2",
            "kind": "Kyma",
            "metadata": {"name": "default", "namespace": "kyma-system"}
        }));
        let r = ResourceRef::from_object(&obj).expect("should identify object");
        assert_eq!(r.group, "operator.kyma-project.io");
        assert_eq!(r.version, "v1beta2");
        assert_eq!(r.namespace.as_deref(), Some("kyma-system"));
        assert_eq!(r.api_version(), "operator.kyma-project.io/v1beta2");
    }

    #[test]
    fn from_object_rejects_missing_name() {
        let obj = object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {}
        }));
        match ResourceRef::from_object(&obj) {
            Err(Error::Validation { field, .. }) => {
                assert_eq!(field.as_deref(), Some("metadata.name"))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn empty_namespace_is_cluster_scoped() {
        let obj = object(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "kyma-system", "namespace": ""}
        }));
        let r = ResourceRef::from_object(&obj).expect("should identify object");
        assert_eq!(r.namespace, None);
    }
}
