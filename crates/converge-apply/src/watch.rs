//! Waiting for reconciliation to converge
//!
//! After a no-op mutation there is nothing new for the controller to do, so
//! the object is fetched once and judged as-is. After a real change a watch
//! is opened from the written resourceVersion and every newer snapshot is
//! judged until one is ready, the caller cancels, or the deadline passes.
//! Watches the server ends are reopened after a backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{DynamicObject, WatchEvent};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use converge_common::retry::{Backoff, RetryPolicy};
use converge_common::{Error, ResourceRef, Result};

use crate::mutate::{MutationOutcome, WatchCheckpoint};
use crate::readiness::{ReadinessPredicate, Verdict};
use crate::report::StatusObserver;
use crate::transport::{ClusterTransport, WatchStream};

/// HTTP status the API server uses for an expired watch resourceVersion
const GONE: u16 = 410;
/// Pause before reopening a watch that ended
const REOPEN_BACKOFF: Duration = Duration::from_millis(500);
/// Longest pause between reopens of watches that keep ending empty
const REOPEN_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Deadline and cancellation for one wait
#[derive(Clone, Debug)]
pub struct WaitOptions {
    /// Give up after this long
    pub timeout: Duration,
    /// Give up when cancelled
    pub cancel: CancellationToken,
}

impl WaitOptions {
    /// Wait at most `timeout`, with a fresh cancellation token
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// Use a caller-owned cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// An open watch that is closed exactly once
///
/// Closing drops the underlying stream, which ends the HTTP request.
/// Dropping the handle closes it if that hasn't happened yet.
pub struct WatchHandle {
    stream: Option<WatchStream>,
    resource: String,
}

impl WatchHandle {
    /// Take ownership of an open stream
    pub fn new(stream: WatchStream, key: &ResourceRef) -> Self {
        Self {
            stream: Some(stream),
            resource: key.to_string(),
        }
    }

    /// Next event, `None` once the stream ended or the handle was closed
    pub async fn next(&mut self) -> Option<Result<WatchEvent<DynamicObject>>> {
        self.stream.as_mut()?.next().await
    }

    /// Close the watch; later calls do nothing
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(resource = %self.resource, "watch closed");
        }
    }

    /// Whether the watch has been closed
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.close();
    }
}

enum Interrupted {
    Cancelled,
    Deadline,
}

/// Where a wait begins
enum Start<'a> {
    /// Right after a mutation with this outcome
    After(&'a MutationOutcome),
    /// From the object's current snapshot
    Current,
}

/// Blocks until a resource satisfies a [`ReadinessPredicate`]
#[derive(Clone)]
pub struct ReadinessWatcher {
    transport: Arc<dyn ClusterTransport>,
    reopen: RetryPolicy,
}

impl ReadinessWatcher {
    /// Create a watcher over the given transport
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            transport,
            reopen: RetryPolicy {
                max_attempts: 0,
                initial_backoff: REOPEN_BACKOFF,
                max_backoff: REOPEN_MAX_BACKOFF,
                backoff: Backoff::Exponential { multiplier: 2.0 },
                jitter: true,
                deadline: None,
            },
        }
    }

    /// Pace reopening of ended watches with `policy`
    ///
    /// The pause grows while reopened watches end without delivering
    /// anything and drops back to the initial backoff once one does. Only
    /// the delays of the policy are used; the wait deadline bounds the rest.
    pub fn with_reopen_policy(mut self, policy: RetryPolicy) -> Self {
        self.reopen = policy;
        self
    }

    /// Wait until `predicate` reports ready for `key`.
    ///
    /// `outcome` selects the path: `Unchanged` fetches and evaluates once and
    /// fails with `PredicateFailure` on anything but ready; `Changed` watches
    /// from the outcome's checkpoint. Error verdicts seen while watching are
    /// collected and returned in `ReadinessTimeout` if the wait runs out.
    pub async fn wait_until_ready(
        &self,
        key: &ResourceRef,
        predicate: &dyn ReadinessPredicate,
        outcome: &MutationOutcome,
        opts: &WaitOptions,
        observer: &mut dyn StatusObserver,
    ) -> Result<()> {
        self.wait(key, predicate, Start::After(outcome), opts, observer)
            .await
    }

    /// Wait until `predicate` reports ready for `key`, judging the object as
    /// it is now before watching for anything newer.
    ///
    /// Unlike the fast path a non-ready snapshot is not final. The initial
    /// read runs under the same deadline and cancellation as the watch.
    pub async fn wait_from_current(
        &self,
        key: &ResourceRef,
        predicate: &dyn ReadinessPredicate,
        opts: &WaitOptions,
        observer: &mut dyn StatusObserver,
    ) -> Result<()> {
        self.wait(key, predicate, Start::Current, opts, observer)
            .await
    }

    #[instrument(skip_all, fields(resource = %key))]
    async fn wait(
        &self,
        key: &ResourceRef,
        predicate: &dyn ReadinessPredicate,
        start: Start<'_>,
        opts: &WaitOptions,
        observer: &mut dyn StatusObserver,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + opts.timeout;
        let mut failures: Vec<String> = Vec::new();

        let finished = {
            let work = async {
                match start {
                    Start::After(MutationOutcome::Unchanged { .. }) => {
                        self.check_once(key, predicate, observer).await
                    }
                    Start::After(MutationOutcome::Changed { checkpoint, .. }) => {
                        self.watch_until_ready(
                            key,
                            predicate,
                            checkpoint.clone(),
                            &mut failures,
                            observer,
                        )
                        .await
                    }
                    Start::Current => {
                        let current = self.transport.get(key).await?;
                        if self.judge(key, predicate, &current, &mut failures, observer) {
                            return Ok(());
                        }
                        self.watch_until_ready(
                            key,
                            predicate,
                            WatchCheckpoint::of(&current),
                            &mut failures,
                            observer,
                        )
                        .await
                    }
                }
            };
            tokio::select! {
                biased;
                _ = opts.cancel.cancelled() => Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupted::Deadline),
                result = work => Ok(result),
            }
        };

        let interrupted = match finished {
            Ok(result) => return result,
            Err(interrupted) => interrupted,
        };
        let waited = started.elapsed();
        warn!(
            resource = %key,
            waited_ms = waited.as_millis(),
            failures = failures.len(),
            cancelled = matches!(interrupted, Interrupted::Cancelled),
            "stopped waiting for readiness"
        );

        match interrupted {
            Interrupted::Cancelled if failures.is_empty() => {
                Err(Error::cancelled(format!("waiting for {key}")))
            }
            _ => Err(Error::ReadinessTimeout {
                resource: key.to_string(),
                waited,
                failures,
            }),
        }
    }

    /// Fast path: one fetch, one evaluation
    async fn check_once(
        &self,
        key: &ResourceRef,
        predicate: &dyn ReadinessPredicate,
        observer: &mut dyn StatusObserver,
    ) -> Result<()> {
        let obj = self.transport.get(key).await?;
        let verdict = predicate.evaluate(&obj);
        observer.observe(key, &verdict);
        match verdict {
            Verdict::Ready => {
                info!(resource = %key, "resource is ready");
                Ok(())
            }
            other => Err(Error::PredicateFailure {
                resource: key.to_string(),
                reason: other.to_string(),
            }),
        }
    }

    async fn watch_until_ready(
        &self,
        key: &ResourceRef,
        predicate: &dyn ReadinessPredicate,
        mut checkpoint: WatchCheckpoint,
        failures: &mut Vec<String>,
        observer: &mut dyn StatusObserver,
    ) -> Result<()> {
        let mut pause = self.reopen.initial_backoff;
        loop {
            let from = checkpoint.resource_version().unwrap_or("0").to_string();
            let stream = self.transport.watch(key, &from).await?;
            let mut handle = WatchHandle::new(stream, key);
            let mut delivered = false;

            while let Some(event) = handle.next().await {
                delivered = true;
                let obj = match event? {
                    WatchEvent::Added(obj) | WatchEvent::Modified(obj) => obj,
                    WatchEvent::Deleted(_) => {
                        handle.close();
                        return Err(Error::not_found(key));
                    }
                    WatchEvent::Bookmark(bookmark) => {
                        checkpoint.advance(&bookmark.metadata.resource_version);
                        continue;
                    }
                    WatchEvent::Error(status) if status.code == GONE => {
                        // Our version was compacted away; resync from a fresh read
                        debug!(resource = %key, "watch expired, relisting");
                        handle.close();
                        let current = self.transport.get(key).await?;
                        checkpoint = WatchCheckpoint::of(&current);
                        if self.judge(key, predicate, &current, failures, observer) {
                            return Ok(());
                        }
                        break;
                    }
                    WatchEvent::Error(status) => {
                        handle.close();
                        return Err(Error::Kube {
                            source: kube::Error::Api(status),
                        });
                    }
                };

                let version = obj.metadata.resource_version.as_deref().unwrap_or_default();
                if checkpoint.is_seen(version) {
                    debug!(resource = %key, resource_version = version, "skipping stale event");
                    continue;
                }
                checkpoint.advance(version);

                if self.judge(key, predicate, &obj, failures, observer) {
                    handle.close();
                    return Ok(());
                }
            }

            if delivered {
                pause = self.reopen.initial_backoff;
            }
            let wait = self.reopen.jittered(pause);
            debug!(
                resource = %key,
                resource_version = checkpoint.resource_version().unwrap_or(""),
                delay_ms = wait.as_millis(),
                "watch ended, reopening"
            );
            tokio::time::sleep(wait).await;
            pause = self.reopen.next_delay(pause);
        }
    }

    /// Evaluate one snapshot; true when ready
    fn judge(
        &self,
        key: &ResourceRef,
        predicate: &dyn ReadinessPredicate,
        obj: &DynamicObject,
        failures: &mut Vec<String>,
        observer: &mut dyn StatusObserver,
    ) -> bool {
        let verdict = predicate.evaluate(obj);
        observer.observe(key, &verdict);
        match verdict {
            Verdict::Ready => {
                info!(resource = %key, "resource is ready");
                true
            }
            Verdict::Error(reason) => {
                failures.push(reason);
                false
            }
            Verdict::Warning(reason) => {
                warn!(resource = %key, reason = %reason, "resource reports a warning");
                false
            }
            Verdict::NotReady => false,
        }
    }
}
