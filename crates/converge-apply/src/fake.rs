//! In-memory cluster for end-to-end tests
//!
//! Keeps objects in a map, hands out increasing resourceVersions, bumps the
//! generation on spec changes and rejects stale replaces. Watches replay the
//! events queued by [`FakeCluster::publish_status`] and then hang, the way a
//! quiet real watch does. A controller reaction can be scripted to publish a
//! status right after the next spec change.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use kube::api::{DynamicObject, WatchEvent};
use serde_json::Value;

use converge_common::{Error, ResourceRef, Result};

use crate::transport::{ApplyParams, ClusterTransport, WatchStream};

#[derive(Default)]
struct State {
    objects: HashMap<ResourceRef, DynamicObject>,
    resource_version: u64,
    queued: Vec<WatchEvent<DynamicObject>>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

struct CloseGuard(Arc<AtomicUsize>);

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
    rejected: HashSet<String>,
    applied: Mutex<Vec<(ResourceRef, String)>>,
    reaction: Mutex<Option<Value>>,
    calls: Mutex<Vec<String>>,
    gets: AtomicUsize,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Reject server-side apply of objects named `name` with a 403
    pub(crate) fn rejecting(mut self, name: &str) -> Self {
        self.rejected.insert(name.to_string());
        self
    }

    /// Publish `status` on the next replace that changes the spec
    pub(crate) fn reacting_with(self, status: Value) -> Self {
        *self.reaction.lock().unwrap() = Some(status);
        self
    }

    /// Store `obj` as if it had been created, at generation 1
    pub(crate) fn seed(&self, mut obj: DynamicObject) -> ResourceRef {
        let key = ResourceRef::from_object(&obj).unwrap();
        let mut state = self.state.lock().unwrap();
        obj.metadata.resource_version = Some(state.next_version());
        obj.metadata.generation = Some(1);
        state.objects.insert(key.clone(), obj);
        key
    }

    /// Controller-side status write; queues a Modified event for watchers
    pub(crate) fn publish_status(&self, key: &ResourceRef, status: Value) {
        let mut state = self.state.lock().unwrap();
        let version = state.next_version();
        let obj = state.objects.get_mut(key).unwrap();
        obj.data["status"] = status;
        obj.metadata.resource_version = Some(version);
        let snapshot = obj.clone();
        state.queued.push(WatchEvent::Modified(snapshot));
    }

    /// Writes and watch opens in call order, e.g. `replace Kyma default`
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str, key: &ResourceRef) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {} {}", call, key.kind, key.name));
    }

    pub(crate) fn stored(&self, key: &ResourceRef) -> Option<DynamicObject> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub(crate) fn applied(&self) -> Vec<(ResourceRef, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub(crate) fn watches_opened(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn watches_closed(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

fn forbidden(key: &ResourceRef) -> Error {
    Error::from_kube(
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "permission denied".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }),
        key,
    )
}

#[async_trait]
impl ClusterTransport for FakeCluster {
    async fn get(&self, key: &ResourceRef) -> Result<DynamicObject> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.stored(key).ok_or_else(|| Error::not_found(key))
    }

    async fn replace(&self, key: &ResourceRef, obj: &DynamicObject) -> Result<DynamicObject> {
        self.record("replace", key);
        let mut state = self.state.lock().unwrap();
        let current = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(key))?;
        if obj.metadata.resource_version != current.metadata.resource_version {
            return Err(Error::conflict(key, "the object has been modified"));
        }

        let mut stored = obj.clone();
        let generation = current.metadata.generation.unwrap_or(1);
        let spec_changed = obj.data.get("spec") != current.data.get("spec");
        stored.metadata.generation = Some(generation + i64::from(spec_changed));
        stored.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key.clone(), stored.clone());

        let reaction = spec_changed
            .then(|| self.reaction.lock().unwrap().take())
            .flatten();
        if let Some(status) = reaction {
            let mut reconciled = stored.clone();
            reconciled.data["status"] = status;
            reconciled.metadata.resource_version = Some(state.next_version());
            state.objects.insert(key.clone(), reconciled.clone());
            state.queued.push(WatchEvent::Modified(reconciled));
        }
        Ok(stored)
    }

    async fn apply(
        &self,
        key: &ResourceRef,
        obj: &DynamicObject,
        params: &ApplyParams,
    ) -> Result<DynamicObject> {
        if self.rejected.contains(&key.name) {
            return Err(forbidden(key));
        }
        self.record("apply", key);
        let mut state = self.state.lock().unwrap();
        let mut stored = obj.clone();
        stored.metadata.resource_version = Some(state.next_version());
        stored.metadata.generation = Some(1);
        state.objects.insert(key.clone(), stored.clone());
        self.applied
            .lock()
            .unwrap()
            .push((key.clone(), params.field_manager.clone()));
        Ok(stored)
    }

    async fn watch(&self, key: &ResourceRef, _resource_version: &str) -> Result<WatchStream> {
        self.record("watch", key);
        self.opens.fetch_add(1, Ordering::SeqCst);
        let events: Vec<_> = std::mem::take(&mut self.state.lock().unwrap().queued);
        let guard = CloseGuard(self.closes.clone());
        Ok(stream::iter(events.into_iter().map(Ok))
            .chain(stream::pending())
            .map(move |event| {
                let _guard = &guard;
                event
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::ConcurrentPatcher;
    use crate::mutate::{MutationOutcome, SpecMutator};
    use crate::readiness::{KymaReadiness, ModuleStatePredicate};
    use crate::report::{SilentObserver, TracingObserver};
    use crate::watch::{ReadinessWatcher, WaitOptions};
    use crate::workflow::{EnableRequest, ModuleWorkflow};
    use converge_common::crd::KymaSpec;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn kyma(modules: &[&str], status: Value) -> DynamicObject {
        let modules: Vec<Value> = modules.iter().map(|m| json!({"name": m})).collect();
        serde_json::from_value(json!({
            "apiVersion": "operator.kyma-project.io/v1beta2",
            "kind": "Kyma",
            "metadata": {"name": "default", "namespace": "kyma-system"},
            "spec": {"channel": "regular", "modules": modules},
            "status": status
        }))
        .unwrap()
    }

    fn config_map(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "default"},
            "data": {"key": name}
        }))
        .unwrap()
    }

    fn ready_with(modules: &[&str]) -> Value {
        let modules: Vec<Value> = modules
            .iter()
            .map(|m| json!({"name": m, "state": "Ready"}))
            .collect();
        json!({"state": "Ready", "modules": modules, "lastOperation": {"operation": "done"}})
    }

    #[tokio::test]
    async fn removing_a_module_waits_for_the_new_generation() {
        let cluster = Arc::new(FakeCluster::new());
        let key = cluster.seed(kyma(&["A", "B"], ready_with(&["A", "B"])));

        let mutator = SpecMutator::new(cluster.clone());
        let outcome = mutator
            .mutate_spec(&key, |spec: &KymaSpec| Ok(spec.without_module("B")))
            .await
            .unwrap();
        assert!(outcome.is_changed());
        let stored = cluster.stored(&key).unwrap();
        assert_eq!(stored.metadata.generation, Some(2));
        assert_eq!(stored.data["spec"]["modules"], json!([{"name": "A"}]));

        cluster.publish_status(&key, ready_with(&["A"]));

        let watcher = ReadinessWatcher::new(cluster.clone());
        watcher
            .wait_until_ready(
                &key,
                &KymaReadiness,
                &outcome,
                &WaitOptions::new(Duration::from_secs(30)),
                &mut TracingObserver::new(),
            )
            .await
            .unwrap();

        assert_eq!(cluster.watches_opened(), 1);
        assert_eq!(cluster.watches_closed(), 1);
    }

    #[tokio::test]
    async fn removing_an_absent_module_takes_the_fast_path() {
        let cluster = Arc::new(FakeCluster::new());
        let key = cluster.seed(kyma(&["A"], ready_with(&["A"])));
        let before = cluster.stored(&key).unwrap().metadata.resource_version;

        let mutator = SpecMutator::new(cluster.clone());
        let outcome = mutator
            .mutate_spec(&key, |spec: &KymaSpec| Ok(spec.without_module("C")))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Unchanged { .. }));
        assert_eq!(cluster.stored(&key).unwrap().metadata.resource_version, before);

        let watcher = ReadinessWatcher::new(cluster.clone());
        watcher
            .wait_until_ready(
                &key,
                &KymaReadiness,
                &outcome,
                &WaitOptions::new(Duration::from_secs(30)),
                &mut SilentObserver,
            )
            .await
            .unwrap();
        assert_eq!(cluster.watches_opened(), 0);
        // one read to mutate, one to check
        assert_eq!(cluster.gets(), 2);
    }

    #[tokio::test]
    async fn one_rejected_object_fails_the_batch_but_not_its_siblings() {
        let cluster = Arc::new(FakeCluster::new().rejecting("two"));
        let patcher = ConcurrentPatcher::new(cluster.clone());

        let err = patcher
            .apply(
                "converge",
                true,
                vec![config_map("one"), config_map("two"), config_map("three")],
            )
            .await
            .unwrap_err();

        match &err {
            Error::PartialApply { failures, .. } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].reference.name, "two");
            }
            other => panic!("expected PartialApply, got {other:?}"),
        }
        assert!(err.to_string().contains("permission denied"));

        let mut applied: Vec<_> = cluster
            .applied()
            .into_iter()
            .map(|(key, owner)| {
                assert_eq!(owner, "converge");
                key.name
            })
            .collect();
        applied.sort();
        assert_eq!(applied, vec!["one", "three"]);
    }

    #[tokio::test]
    async fn concurrent_enable_retries_on_conflict() {
        // A second writer lands between our read and our write on the first try
        struct Racing {
            inner: Arc<FakeCluster>,
            raced: AtomicUsize,
        }

        #[async_trait]
        impl ClusterTransport for Racing {
            async fn get(&self, key: &ResourceRef) -> Result<DynamicObject> {
                self.inner.get(key).await
            }

            async fn replace(&self, key: &ResourceRef, obj: &DynamicObject) -> Result<DynamicObject> {
                if self.raced.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut other = self.inner.stored(key).unwrap();
                    other.data["spec"]["channel"] = json!("fast");
                    self.inner.replace(key, &other).await?;
                }
                self.inner.replace(key, obj).await
            }

            async fn apply(
                &self,
                key: &ResourceRef,
                obj: &DynamicObject,
                params: &ApplyParams,
            ) -> Result<DynamicObject> {
                self.inner.apply(key, obj, params).await
            }

            async fn watch(&self, key: &ResourceRef, rv: &str) -> Result<WatchStream> {
                self.inner.watch(key, rv).await
            }
        }

        let cluster = Arc::new(FakeCluster::new());
        let key = cluster.seed(kyma(&["A"], json!({})));
        let racing = Arc::new(Racing {
            inner: cluster.clone(),
            raced: AtomicUsize::new(0),
        });

        let mutator = SpecMutator::new(racing).with_policy(
            converge_common::retry::RetryPolicy::with_max_attempts(3)
                .initial_backoff(Duration::from_millis(1))
                .without_jitter(),
        );
        let outcome = mutator
            .mutate_spec(&key, |spec: &KymaSpec| spec.enable_module("B", None, None))
            .await
            .unwrap();

        assert!(outcome.is_changed());
        let stored = cluster.stored(&key).unwrap();
        // The other writer's change survives alongside ours
        assert_eq!(stored.data["spec"]["channel"], "fast");
        assert_eq!(
            stored.data["spec"]["modules"],
            json!([{"name": "A"}, {"name": "B"}])
        );
    }

    #[tokio::test]
    async fn cancelled_module_wait_still_closes_its_watch() {
        let cluster = Arc::new(FakeCluster::new());
        let key = cluster.seed(kyma(&[], json!({})));

        let mutator = SpecMutator::new(cluster.clone());
        let outcome = mutator
            .mutate_spec(&key, |spec: &KymaSpec| spec.enable_module("A", None, None))
            .await
            .unwrap();
        cluster.publish_status(&key, json!({"modules": [{"name": "A", "state": "Processing"}]}));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let watcher = ReadinessWatcher::new(cluster.clone());
        let err = watcher
            .wait_until_ready(
                &key,
                &ModuleStatePredicate::new("A"),
                &outcome,
                &WaitOptions::new(Duration::from_secs(30)).with_cancel(cancel),
                &mut SilentObserver,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled { .. }));
        assert_eq!(cluster.watches_opened(), 1);
        assert_eq!(cluster.watches_closed(), 1);
    }

    #[tokio::test]
    async fn module_edit_keeps_fields_it_does_not_model() {
        let cluster = Arc::new(FakeCluster::new());
        let mut seeded = kyma(&["A"], json!({}));
        seeded.data["spec"]["sync"] = json!({"strategy": "secret"});
        seeded.data["spec"]["modules"][0]["remoteTemplate"] = json!(true);
        let key = cluster.seed(seeded);

        let mutator = SpecMutator::new(cluster.clone());
        mutator
            .mutate_spec(&key, |spec: &KymaSpec| spec.enable_module("B", None, None))
            .await
            .unwrap();

        let spec = cluster.stored(&key).unwrap().data["spec"].clone();
        assert_eq!(spec["sync"], json!({"strategy": "secret"}));
        assert_eq!(
            spec["modules"],
            json!([{"name": "A", "remoteTemplate": true}, {"name": "B"}])
        );
    }

    fn serverless_cr() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "operator.kyma-project.io/v1alpha1",
            "kind": "Serverless",
            "metadata": {"name": "default", "namespace": "kyma-system"},
            "spec": {"dockerRegistry": {"enableInternal": true}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn enabling_with_custom_resources_applies_them_once_the_module_runs() {
        let cluster = Arc::new(FakeCluster::new().reacting_with(json!({
            "state": "Processing",
            "modules": [{"name": "serverless", "state": "Ready"}]
        })));
        let key = cluster.seed(kyma(&[], json!({})));

        let request = EnableRequest {
            custom_resources: vec![serverless_cr()],
            ..EnableRequest::new("serverless")
        };
        let report = ModuleWorkflow::new(cluster.clone())
            .enable(
                &key,
                &request,
                "converge",
                &WaitOptions::new(Duration::from_secs(30)),
                &mut SilentObserver,
            )
            .await
            .unwrap();

        assert!(report.outcome.is_changed());
        assert_eq!(report.applied.map(|s| s.applied()), Some(1));
        assert_eq!(
            cluster.calls(),
            vec!["replace Kyma default", "watch Kyma default", "apply Serverless default"]
        );
        assert_eq!(cluster.applied()[0].1, "converge");
        assert_eq!(cluster.watches_closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_module_gets_no_custom_resources() {
        let cluster = Arc::new(FakeCluster::new().reacting_with(json!({
            "modules": [{"name": "serverless", "state": "Error"}]
        })));
        let key = cluster.seed(kyma(&[], json!({})));

        let request = EnableRequest {
            custom_resources: vec![serverless_cr()],
            ..EnableRequest::new("serverless")
        };
        let err = ModuleWorkflow::new(cluster.clone())
            .enable(
                &key,
                &request,
                "converge",
                &WaitOptions::new(Duration::from_secs(10)),
                &mut SilentObserver,
            )
            .await
            .unwrap_err();

        match &err {
            Error::ReadinessTimeout { failures, .. } => {
                assert_eq!(failures, &vec!["module serverless is in the Error state".to_string()]);
            }
            other => panic!("expected ReadinessTimeout, got {other:?}"),
        }
        assert!(cluster.applied().is_empty());
    }

    #[tokio::test]
    async fn enabling_without_wait_or_custom_resources_only_edits_the_spec() {
        let cluster = Arc::new(FakeCluster::new());
        let key = cluster.seed(kyma(&[], json!({})));

        let report = ModuleWorkflow::new(cluster.clone())
            .enable(
                &key,
                &EnableRequest::new("keda"),
                "converge",
                &WaitOptions::new(Duration::from_secs(30)),
                &mut SilentObserver,
            )
            .await
            .unwrap();

        assert!(report.applied.is_none());
        assert_eq!(cluster.calls(), vec!["replace Kyma default"]);
        assert_eq!(cluster.watches_opened(), 0);
    }
}
