//! Concurrent server-side apply
//!
//! One tokio task per object, no concurrency cap, and every task is joined
//! before the batch reports. A failure never cancels siblings and nothing is
//! rolled back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::api::DynamicObject;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use converge_common::kube_utils::strip_apply_metadata;
use converge_common::{ApplyFailure, Error, ResourceRef, Result};

use crate::transport::{ApplyParams, ClusterTransport};

/// Result of applying one object of a batch
#[derive(Debug)]
pub struct ApplyOutcome {
    /// The applied object
    pub reference: ResourceRef,
    /// Why the apply failed, `None` on success
    pub error: Option<Error>,
    /// Time spent on this object alone
    pub elapsed: Duration,
}

/// Report of a fully successful batch
#[derive(Debug)]
pub struct ApplySummary {
    /// One outcome per distinct object, in first-seen order
    pub outcomes: Vec<ApplyOutcome>,
    /// Wall time of the whole batch
    pub elapsed: Duration,
}

impl ApplySummary {
    /// Number of objects applied
    pub fn applied(&self) -> usize {
        self.outcomes.len()
    }
}

/// Applies batches of independent objects in parallel via server-side apply
#[derive(Clone)]
pub struct ConcurrentPatcher {
    transport: Arc<dyn ClusterTransport>,
}

impl ConcurrentPatcher {
    /// Create a patcher over the given transport
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self { transport }
    }

    /// Server-side apply every object, owned by field manager `owner`.
    ///
    /// Objects sharing a [`ResourceRef`] are applied once, using the last
    /// occurrence. Returns `Error::PartialApply` naming every failed object
    /// if any apply failed; objects missing identity fields fail the whole
    /// batch before anything is sent.
    #[instrument(skip(self, objects), fields(count = objects.len()))]
    pub async fn apply(
        &self,
        owner: &str,
        force: bool,
        objects: Vec<DynamicObject>,
    ) -> Result<ApplySummary> {
        let started = Instant::now();
        let batch = dedup(objects)?;
        let total = batch.len();
        let params = Arc::new(ApplyParams {
            field_manager: owner.to_string(),
            force,
        });

        let handles: Vec<_> = batch
            .into_iter()
            .map(|(reference, mut obj)| {
                strip_apply_metadata(&mut obj);
                let transport = self.transport.clone();
                let params = params.clone();
                let task_ref = reference.clone();
                let handle = tokio::spawn(async move {
                    let task_started = Instant::now();
                    debug!(resource = %task_ref, "applying resource");
                    let result = transport.apply(&task_ref, &obj, &params).await;
                    (result, task_started.elapsed())
                });
                (reference, handle)
            })
            .collect();

        let (references, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut outcomes = Vec::with_capacity(total);
        for (reference, joined) in references.into_iter().zip(joined) {
            let (error, elapsed) = match joined {
                Ok((Ok(_), elapsed)) => (None, elapsed),
                Ok((Err(e), elapsed)) => (Some(e), elapsed),
                Err(join_err) => (
                    Some(Error::internal_with_context(
                        "apply",
                        format!("apply task failed: {}", join_err),
                    )),
                    started.elapsed(),
                ),
            };
            if let Some(e) = &error {
                error!(resource = %reference, error = %e, "resource application failed");
            }
            outcomes.push(ApplyOutcome {
                reference,
                error,
                elapsed,
            });
        }

        let elapsed = started.elapsed();
        let failures: Vec<ApplyFailure> = outcomes
            .iter_mut()
            .filter_map(|o| {
                o.error.take().map(|e| ApplyFailure {
                    reference: o.reference.clone(),
                    source: Box::new(e),
                })
            })
            .collect();

        info!(
            applied = total - failures.len(),
            failed = failures.len(),
            elapsed_ms = elapsed.as_millis(),
            "server-side apply finished"
        );

        if failures.is_empty() {
            Ok(ApplySummary { outcomes, elapsed })
        } else {
            Err(Error::PartialApply {
                total,
                elapsed,
                failures,
            })
        }
    }
}

/// Identify every object and collapse duplicates, keeping the position of
/// the first occurrence and the content of the last
fn dedup(objects: Vec<DynamicObject>) -> Result<Vec<(ResourceRef, DynamicObject)>> {
    let mut batch: Vec<(ResourceRef, DynamicObject)> = Vec::with_capacity(objects.len());
    let mut index: HashMap<ResourceRef, usize> = HashMap::new();

    for obj in objects {
        let reference = ResourceRef::from_object(&obj)?;
        match index.get(&reference) {
            Some(&i) => {
                warn!(resource = %reference, "duplicate object in batch, keeping the last one");
                batch[i].1 = obj;
            }
            None => {
                index.insert(reference.clone(), batch.len());
                batch.push((reference, obj));
            }
        }
    }
    Ok(batch)
}
