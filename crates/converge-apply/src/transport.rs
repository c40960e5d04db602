//! Cluster API seam
//!
//! Everything above this module talks to the cluster through
//! [`ClusterTransport`], so the apply, mutate and watch logic can be tested
//! against a mock or an in-memory cluster.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{
    Api, DynamicObject, GroupVersionKind, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
};
use kube::discovery::{pinned_kind, ApiResource, Scope};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use converge_common::{Error, ResourceRef, Result};

/// Stream of watch events for a single object
pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// Server-side apply parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyParams {
    /// Field manager recorded as owner of the applied fields
    pub field_manager: String,
    /// Take ownership of fields held by other managers
    pub force: bool,
}

/// Server-side watch timeout; kube rejects values of 295s and above
const WATCH_TIMEOUT_SECS: u32 = 290;

/// The four cluster calls the reconciliation client needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Fetch one object
    ///
    /// A missing object is `Error::NotFound`.
    async fn get(&self, key: &ResourceRef) -> Result<DynamicObject>;

    /// Replace one object (PUT)
    ///
    /// `obj.metadata.resourceVersion` is sent as the precondition; a stale
    /// version is rejected with `Error::Conflict`.
    async fn replace(&self, key: &ResourceRef, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Server-side apply one object
    async fn apply(
        &self,
        key: &ResourceRef,
        obj: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject>;

    /// Watch one object by name, starting after `resource_version`
    async fn watch(&self, key: &ResourceRef, resource_version: &str) -> Result<WatchStream>;
}

/// Plural and scope of one kind as reported by the API server
#[derive(Clone, Debug)]
struct Discovered {
    resource: ApiResource,
    namespaced: bool,
}

/// [`ClusterTransport`] backed by a kube-rs client and dynamic APIs
///
/// The URL of every call comes from API discovery, cached per
/// apiVersion and kind for the life of the transport.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
    default_namespace: String,
    discovered: Arc<RwLock<HashMap<(String, String), Discovered>>>,
}

impl KubeTransport {
    /// Wrap a kube client; namespaced objects without a namespace go to
    /// the client's default namespace
    pub fn new(client: Client) -> Self {
        let default_namespace = client.default_namespace().to_string();
        Self {
            client,
            default_namespace,
            discovered: Arc::default(),
        }
    }

    /// Override the namespace used for namespaced objects that carry none
    pub fn with_default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    async fn discover(&self, key: &ResourceRef) -> Result<Discovered> {
        let cache_key = (key.api_version(), key.kind.clone());
        if let Some(found) = self.discovered.read().await.get(&cache_key) {
            return Ok(found.clone());
        }

        let gvk = GroupVersionKind::gvk(&key.group, &key.version, &key.kind);
        let (resource, caps) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| discovery_error(e, key))?;
        let found = Discovered {
            namespaced: matches!(caps.scope, Scope::Namespaced),
            resource,
        };
        debug!(
            api_version = %cache_key.0,
            kind = %cache_key.1,
            plural = %found.resource.plural,
            namespaced = found.namespaced,
            "discovered resource"
        );
        self.discovered.write().await.insert(cache_key, found.clone());
        Ok(found)
    }

    async fn api(&self, key: &ResourceRef) -> Result<Api<DynamicObject>> {
        let found = self.discover(key).await?;
        Ok(
            match target_namespace(key, found.namespaced, &self.default_namespace) {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &found.resource),
                None => Api::all_with(self.client.clone(), &found.resource),
            },
        )
    }
}

/// Namespace of the request URL: none for cluster-scoped kinds, the
/// object's own for namespaced kinds, else the default
fn target_namespace<'a>(
    key: &'a ResourceRef,
    namespaced: bool,
    default_namespace: &'a str,
) -> Option<&'a str> {
    if !namespaced {
        return None;
    }
    Some(key.namespace.as_deref().unwrap_or(default_namespace))
}

/// A kind the server does not serve is a caller error, not a transport one
fn discovery_error(source: kube::Error, key: &ResourceRef) -> Error {
    match &source {
        kube::Error::Discovery(_) => unknown_kind(key),
        kube::Error::Api(ae) if ae.code == 404 => unknown_kind(key),
        _ => Error::from_kube(source, key),
    }
}

fn unknown_kind(key: &ResourceRef) -> Error {
    Error::validation_for_field(
        "kind",
        format!(
            "unknown resource type {}/{} for {}",
            key.api_version(),
            key.kind,
            key.name
        ),
    )
}

#[async_trait]
impl ClusterTransport for KubeTransport {
    async fn get(&self, key: &ResourceRef) -> Result<DynamicObject> {
        trace!(resource = %key, "get");
        self.api(key)
            .await?
            .get(&key.name)
            .await
            .map_err(|e| Error::from_kube(e, key))
    }

    async fn replace(&self, key: &ResourceRef, obj: &DynamicObject) -> Result<DynamicObject> {
        debug!(
            resource = %key,
            resource_version = obj.metadata.resource_version.as_deref().unwrap_or(""),
            "replacing object"
        );
        self.api(key)
            .await?
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, key))
    }

    async fn apply(
        &self,
        key: &ResourceRef,
        obj: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject> {
        let mut pp = PatchParams::apply(&params.field_manager);
        if params.force {
            pp = pp.force();
        }
        self.api(key)
            .await?
            .patch(&key.name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| Error::from_kube(e, key))
    }

    async fn watch(&self, key: &ResourceRef, resource_version: &str) -> Result<WatchStream> {
        let wp = WatchParams::default()
            .fields(&format!("metadata.name={}", key.name))
            .timeout(WATCH_TIMEOUT_SECS);
        debug!(resource = %key, resource_version, "opening watch");
        let owned = key.clone();
        let stream = self
            .api(key)
            .await?
            .watch(&wp, resource_version)
            .await
            .map_err(|e| Error::from_kube(e, key))?
            .map_err(move |e| Error::from_kube(e, &owned));
        Ok(stream.boxed())
    }
}
