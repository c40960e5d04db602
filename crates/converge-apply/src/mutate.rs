//! Optimistic-concurrency spec mutation
//!
//! Read-modify-write of one object's `spec`. Each attempt fetches the object,
//! transforms the spec and replaces the object carrying the resourceVersion
//! fetched in that same attempt, so a concurrent writer turns the replace
//! into a 409 and the whole cycle is retried.

use std::cmp::Ordering;
use std::sync::Arc;

use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use converge_common::retry::{retry_if, RetryPolicy};
use converge_common::{Error, ResourceRef, Result};

use crate::transport::ClusterTransport;

/// Last resourceVersion observed for one object during one wait.
///
/// Only moves forward. Versions are compared numerically when both parse as
/// integers (what the API server hands out in practice); otherwise any
/// different version counts as newer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchCheckpoint {
    resource_version: Option<String>,
}

impl WatchCheckpoint {
    /// Checkpoint at the given version
    pub fn new(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: Some(resource_version.into()),
        }
    }

    /// Checkpoint at an object's current version
    pub fn of(obj: &DynamicObject) -> Self {
        Self {
            resource_version: obj.metadata.resource_version.clone(),
        }
    }

    /// The recorded version, if any
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Compare `candidate` against the recorded version
    ///
    /// `None` when there's no recorded version to compare with.
    pub fn compare(&self, candidate: &str) -> Option<Ordering> {
        let current = self.resource_version.as_deref()?;
        match (current.parse::<u64>(), candidate.parse::<u64>()) {
            (Ok(a), Ok(b)) => Some(b.cmp(&a)),
            _ if current == candidate => Some(Ordering::Equal),
            _ => Some(Ordering::Greater),
        }
    }

    /// Whether an event at `candidate` was already seen (echo or older)
    pub fn is_seen(&self, candidate: &str) -> bool {
        matches!(
            self.compare(candidate),
            Some(Ordering::Equal | Ordering::Less)
        )
    }

    /// Move to `candidate` if it is newer; returns whether it moved
    pub fn advance(&mut self, candidate: &str) -> bool {
        if candidate.is_empty() || self.is_seen(candidate) {
            return false;
        }
        self.resource_version = Some(candidate.to_string());
        true
    }
}

/// What a spec mutation did to the object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The server accepted a new generation; readiness must be awaited
    Changed {
        /// Version of the written object
        checkpoint: WatchCheckpoint,
        /// Generation before the write
        previous_generation: Option<i64>,
        /// Generation after the write
        generation: Option<i64>,
    },
    /// Nothing was persisted, or the write did not advance the generation
    Unchanged {
        /// Version of the object as last seen
        checkpoint: WatchCheckpoint,
    },
}

impl MutationOutcome {
    /// Version to start watching from
    pub fn checkpoint(&self) -> &WatchCheckpoint {
        match self {
            Self::Changed { checkpoint, .. } | Self::Unchanged { checkpoint } => checkpoint,
        }
    }

    /// Whether the generation advanced
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

/// Edits the spec of a single existing object with conflict retry
#[derive(Clone)]
pub struct SpecMutator {
    transport: Arc<dyn ClusterTransport>,
    policy: RetryPolicy,
}

impl SpecMutator {
    /// Create a mutator with the default policy (3 attempts, 3s exponential backoff)
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            transport,
            policy: RetryPolicy::default(),
        }
    }

    /// Replace the conflict retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply `transform` to the object's spec and persist the result.
    ///
    /// Only conflicts are retried. A missing object is never created and
    /// fetch failures are returned as-is. When the transform returns an
    /// equal spec nothing is written and the outcome is `Unchanged`.
    #[instrument(skip(self, key, transform), fields(resource = %key))]
    pub async fn mutate_spec<S, F>(&self, key: &ResourceRef, transform: F) -> Result<MutationOutcome>
    where
        S: Serialize + DeserializeOwned + PartialEq,
        F: Fn(&S) -> Result<S>,
    {
        retry_if(&self.policy, "mutate_spec", Error::is_conflict, || {
            self.attempt(key, &transform)
        })
        .await
    }

    async fn attempt<S, F>(&self, key: &ResourceRef, transform: &F) -> Result<MutationOutcome>
    where
        S: Serialize + DeserializeOwned + PartialEq,
        F: Fn(&S) -> Result<S>,
    {
        let mut obj = self.transport.get(key).await?;
        let observed_generation = obj.metadata.generation;
        let observed_version = obj.metadata.resource_version.clone();

        let current: S = read_spec(&obj, key)?;
        let desired = transform(&current)?;
        if desired == current {
            debug!(resource = %key, "spec unchanged, skipping write");
            return Ok(MutationOutcome::Unchanged {
                checkpoint: WatchCheckpoint::of(&obj),
            });
        }

        write_spec(&mut obj, &desired, key)?;
        // The replace precondition is the version fetched above
        obj.metadata.resource_version = observed_version;
        let written = self.transport.replace(key, &obj).await?;

        let generation = written.metadata.generation;
        let checkpoint = WatchCheckpoint::of(&written);
        let advanced = match (observed_generation, generation) {
            (Some(before), Some(after)) => after > before,
            (None, Some(_)) => true,
            _ => false,
        };

        if advanced {
            info!(
                resource = %key,
                previous_generation = observed_generation,
                generation,
                "spec updated"
            );
            Ok(MutationOutcome::Changed {
                checkpoint,
                previous_generation: observed_generation,
                generation,
            })
        } else {
            debug!(resource = %key, "write accepted without a new generation");
            Ok(MutationOutcome::Unchanged { checkpoint })
        }
    }
}

fn read_spec<S: DeserializeOwned>(obj: &DynamicObject, key: &ResourceRef) -> Result<S> {
    let spec = obj
        .data
        .get("spec")
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(spec).map_err(|e| {
        Error::serialization_for_kind(&key.kind, format!("failed to decode spec of {key}: {e}"))
    })
}

fn write_spec<S: Serialize>(obj: &mut DynamicObject, spec: &S, key: &ResourceRef) -> Result<()> {
    let value = serde_json::to_value(spec).map_err(|e| {
        Error::serialization_for_kind(&key.kind, format!("failed to encode spec of {key}: {e}"))
    })?;
    match obj.data.as_object_mut() {
        Some(fields) => {
            fields.insert("spec".to_string(), value);
            Ok(())
        }
        None => Err(Error::serialization_for_kind(
            &key.kind,
            format!("{key} has no object body"),
        )),
    }
}
