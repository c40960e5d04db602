//! Error types for converge
//!
//! Errors are structured with fields so callers can tell a retryable
//! optimistic-concurrency conflict apart from a missing resource or an
//! aggregate apply failure. Every aggregate variant keeps all contributing
//! causes; nothing is truncated to the first failure.

use std::time::Duration;

use thiserror::Error;

use crate::resource::ResourceRef;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// A single failed resource inside a batch apply
#[derive(Debug)]
pub struct ApplyFailure {
    /// The resource that failed to apply
    pub reference: ResourceRef,
    /// Why it failed
    pub source: Box<Error>,
}

/// Main error type for converge operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that does not map onto a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The target resource does not exist (never retried)
    #[error("{resource} not found")]
    NotFound {
        /// Display form of the missing resource
        resource: String,
    },

    /// Optimistic-concurrency rejection: the object changed since it was read
    #[error("conflict writing {resource}: {message}")]
    Conflict {
        /// Display form of the contended resource
        resource: String,
        /// Server-provided reason
        message: String,
    },

    /// One or more resources in a server-side apply batch failed
    #[error(
        "server-side apply failed for {} of {total} resources (after {elapsed:?}): {}",
        .failures.len(),
        join_apply_failures(.failures)
    )]
    PartialApply {
        /// Number of resources in the batch
        total: usize,
        /// Wall time of the whole batch
        elapsed: Duration,
        /// Every failing resource with its cause
        failures: Vec<ApplyFailure>,
    },

    /// Readiness was not reached before the deadline
    #[error(
        "timed out after {waited:?} waiting for {resource} to become ready: {}",
        describe_interim_failures(.failures)
    )]
    ReadinessTimeout {
        /// Display form of the watched resource
        resource: String,
        /// How long the caller waited
        waited: Duration,
        /// Interim failure reasons observed while waiting, oldest first
        failures: Vec<String>,
    },

    /// The readiness predicate produced a terminal Warning or Error verdict
    #[error("{resource} is not ready: {reason}")]
    PredicateFailure {
        /// Display form of the checked resource
        resource: String,
        /// Verdict reason from the predicate
        reason: String,
    },

    /// The caller cancelled the operation
    #[error("{operation} cancelled")]
    Cancelled {
        /// The operation that was interrupted
        operation: String,
    },

    /// Every attempt of a retried operation failed
    #[error(
        "{operation} failed after {attempts} attempts: {}",
        join_errors(.errors)
    )]
    RetriesExhausted {
        /// Operation name used for logging
        operation: String,
        /// Attempts made
        attempts: u32,
        /// The error of every attempt, oldest first
        errors: Vec<Error>,
    },

    /// Invalid input (spec transform, manifest, flags)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.modules[1].name")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "watch", "create_client")
        context: String,
    },
}

fn join_apply_failures(failures: &[ApplyFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}: {}]", f.reference, f.source.detail()))
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_interim_failures(failures: &[String]) -> String {
    if failures.is_empty() {
        "deadline exceeded".to_string()
    } else {
        failures.join("; ")
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .enumerate()
        .map(|(i, e)| format!("#{}: {}", i + 1, e))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Classify a kube-rs error raised while operating on `resource`.
    ///
    /// 404 becomes `NotFound`, 409 becomes `Conflict`; everything else stays
    /// a `Kube` error.
    pub fn from_kube(source: kube::Error, resource: &ResourceRef) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                resource: resource.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.to_string(),
                message: ae.message.clone(),
            },
            _ => Self::Kube { source },
        }
    }

    /// Create a not-found error for a resource
    pub fn not_found(resource: &ResourceRef) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(resource: &ResourceRef, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// The cause without the resource name, for messages that already lead
    /// with the resource
    pub fn detail(&self) -> String {
        match self {
            Error::NotFound { .. } => "not found".to_string(),
            Error::Conflict { message, .. } => format!("conflict: {}", message),
            other => other.to_string(),
        }
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube { source } => matches!(source, kube::Error::Api(ae) if ae.code == 409),
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Conflicts and transport failures are retryable. Missing resources,
    /// validation and serialization errors need a fix from the caller and
    /// are not. A partial apply is retryable when any of its failures is;
    /// server-side apply is idempotent, so the whole batch is resent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => true,
            Error::PartialApply { failures, .. } => {
                failures.iter().any(|f| f.source.is_retryable())
            }
            Error::ReadinessTimeout { .. } => false,
            Error::PredicateFailure { .. } => false,
            Error::Cancelled { .. } => false,
            Error::RetriesExhausted { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{} message", reason),
            reason: reason.to_string(),
            code,
        })
    }

    fn kyma_ref() -> ResourceRef {
        ResourceRef::new("operator.kyma-project.io", "v1beta2", "Kyma", Some("kyma-system"), "default")
    }

    // ==========================================================================
    // Story Tests: how cluster failures are classified
    // ==========================================================================

    /// Story: a stale write is a conflict and gets retried
    #[test]
    fn story_conflict_is_classified_and_retryable() {
        let err = Error::from_kube(api_error(409, "Conflict"), &kyma_ref());
        assert!(err.is_conflict());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("conflict writing"));
        assert!(err.to_string().contains("kyma-system/default"));
    }

    /// Story: the singleton is missing, so the mutator must give up at once
    #[test]
    fn story_missing_singleton_is_permanent() {
        let err = Error::from_kube(api_error(404, "NotFound"), &kyma_ref());
        match &err {
            Error::NotFound { resource } => assert!(resource.contains("default")),
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: forbidden is neither a conflict nor retryable
    #[test]
    fn story_forbidden_is_not_retryable() {
        let err = Error::from_kube(api_error(403, "Forbidden"), &kyma_ref());
        assert!(matches!(err, Error::Kube { .. }));
        assert!(!err.is_conflict());
        assert!(!err.is_retryable());
    }

    #[test]
    fn partial_apply_lists_every_failure() {
        let a = ResourceRef::new("", "v1", "ConfigMap", Some("default"), "a");
        let b = ResourceRef::new("apps", "v1", "Deployment", Some("default"), "b");
        let err = Error::PartialApply {
            total: 3,
            elapsed: Duration::from_millis(5),
            failures: vec![
                ApplyFailure {
                    reference: a,
                    source: Box::new(Error::internal("permission denied")),
                },
                ApplyFailure {
                    reference: b,
                    source: Box::new(Error::internal("webhook timeout")),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 of 3"));
        assert!(msg.contains("v1/ConfigMap default/a"));
        assert!(msg.contains("apps/v1/Deployment default/b"));
        assert!(msg.contains("permission denied"));
        assert!(msg.contains("webhook timeout"));
    }

    #[test]
    fn partial_apply_names_each_failing_resource_once() {
        let a = ResourceRef::new("", "v1", "ConfigMap", Some("default"), "a");
        let b = ResourceRef::new("", "v1", "ConfigMap", Some("default"), "b");
        let err = Error::PartialApply {
            total: 2,
            elapsed: Duration::from_millis(5),
            failures: vec![
                ApplyFailure {
                    reference: a.clone(),
                    source: Box::new(Error::not_found(&a)),
                },
                ApplyFailure {
                    reference: b.clone(),
                    source: Box::new(Error::conflict(&b, "field is owned by helm")),
                },
            ],
        };
        let msg = err.to_string();
        assert_eq!(msg.matches("default/a").count(), 1, "{msg}");
        assert_eq!(msg.matches("default/b").count(), 1, "{msg}");
        assert!(msg.contains("[v1/ConfigMap default/a: not found]"), "{msg}");
        assert!(msg.contains("[v1/ConfigMap default/b: conflict: field is owned by helm]"), "{msg}");
    }

    #[test]
    fn partial_apply_is_retryable_only_through_its_causes() {
        let a = ResourceRef::new("", "v1", "ConfigMap", Some("default"), "a");
        let batch = |source: Error| Error::PartialApply {
            total: 1,
            elapsed: Duration::ZERO,
            failures: vec![ApplyFailure {
                reference: a.clone(),
                source: Box::new(source),
            }],
        };

        assert!(batch(Error::internal("connection reset")).is_retryable());
        assert!(batch(Error::conflict(&a, "stale")).is_retryable());
        assert!(!batch(Error::from(api_error(403, "Forbidden"))).is_retryable());
        assert!(!batch(Error::validation("bad field")).is_retryable());
    }

    #[test]
    fn readiness_timeout_without_failures_reports_deadline() {
        let err = Error::ReadinessTimeout {
            resource: "Kyma kyma-system/default".to_string(),
            waited: Duration::from_secs(60),
            failures: vec![],
        };
        assert!(err.to_string().ends_with("deadline exceeded"));
    }

    #[test]
    fn readiness_timeout_joins_interim_failures() {
        let err = Error::ReadinessTimeout {
            resource: "Kyma kyma-system/default".to_string(),
            waited: Duration::from_secs(60),
            failures: vec!["state Error: install failed".into(), "state Error: retry".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("install failed; state Error: retry"));
        assert!(!msg.contains("deadline exceeded"));
    }

    #[test]
    fn retries_exhausted_keeps_every_attempt() {
        let err = Error::RetriesExhausted {
            operation: "apply".into(),
            attempts: 2,
            errors: vec![Error::internal("first"), Error::internal("second")],
        };
        let msg = err.to_string();
        assert!(msg.contains("#1: internal error [unknown]: first"));
        assert!(msg.contains("#2: internal error [unknown]: second"));
    }
}
