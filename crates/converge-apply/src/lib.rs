//! Declarative reconciliation client core
//!
//! Three operations over a [`ClusterTransport`]:
//! - [`ConcurrentPatcher::apply`] server-side applies a batch of objects in parallel
//! - [`SpecMutator::mutate_spec`] edits the spec of a singleton with optimistic concurrency
//! - [`ReadinessWatcher::wait_until_ready`] blocks until a [`ReadinessPredicate`] holds
//!
//! [`ModuleWorkflow`] chains all three to enable a module and create its
//! custom resources.

#![deny(missing_docs)]

pub mod apply;
pub mod mutate;
pub mod readiness;
pub mod report;
pub mod transport;
pub mod watch;
pub mod workflow;

#[cfg(test)]
mod fake;

pub use apply::{ApplyOutcome, ApplySummary, ConcurrentPatcher};
pub use mutate::{MutationOutcome, SpecMutator, WatchCheckpoint};
pub use readiness::{KymaReadiness, ModuleStatePredicate, ReadinessPredicate, Verdict};
pub use report::{SilentObserver, StatusCache, StatusObserver, TracingObserver};
pub use transport::{ApplyParams, ClusterTransport, KubeTransport, WatchStream};
pub use watch::{ReadinessWatcher, WaitOptions, WatchHandle};
pub use workflow::{EnableReport, EnableRequest, ModuleWorkflow};
