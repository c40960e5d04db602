//! Readiness classification
//!
//! Predicates are pure: they look at one status snapshot and return a
//! [`Verdict`]. What to do with a verdict (wait, accumulate, fail) is the
//! watcher's business.

use std::fmt;

use kube::api::DynamicObject;

use converge_common::crd::{Kyma, KymaStatus, State};

/// Classification of one status snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Converged
    Ready,
    /// Still reconciling
    NotReady,
    /// Converged with a problem that won't heal on its own
    Warning(String),
    /// Reconciliation failed
    Error(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NotReady => write!(f, "not ready"),
            Self::Warning(reason) => write!(f, "warning: {reason}"),
            Self::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Decides whether an object has converged
pub trait ReadinessPredicate: Send + Sync {
    /// Classify one snapshot of the object
    fn evaluate(&self, obj: &DynamicObject) -> Verdict;
}

impl<F> ReadinessPredicate for F
where
    F: Fn(&DynamicObject) -> Verdict + Send + Sync,
{
    fn evaluate(&self, obj: &DynamicObject) -> Verdict {
        self(obj)
    }
}

fn parse_kyma(obj: &DynamicObject) -> Result<Kyma, Verdict> {
    obj.clone()
        .try_parse::<Kyma>()
        .map_err(|e| Verdict::Error(format!("malformed Kyma object: {e}")))
}

fn last_operation(status: &KymaStatus) -> String {
    status
        .last_operation
        .as_ref()
        .filter(|op| !op.operation.is_empty())
        .map(|op| op.describe())
        .unwrap_or_else(|| "no last operation reported".to_string())
}

/// Readiness of the Kyma singleton as a whole
///
/// Ready needs all of: state `Ready`, one status entry per spec module, and
/// a non-empty last operation. `Processing`, `Deleting` and a missing state
/// are in progress. Everything else, including `Ready` with a failed check,
/// is an error carrying the last operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct KymaReadiness;

impl ReadinessPredicate for KymaReadiness {
    fn evaluate(&self, obj: &DynamicObject) -> Verdict {
        let kyma = match parse_kyma(obj) {
            Ok(kyma) => kyma,
            Err(verdict) => return verdict,
        };
        let status = kyma.status.unwrap_or_default();
        let state = status.state();

        match state {
            State::Ready => {
                let expected = kyma.spec.modules.len();
                let reported = status.modules.len();
                let has_operation = status
                    .last_operation
                    .as_ref()
                    .is_some_and(|op| !op.operation.is_empty());
                if reported != expected {
                    Verdict::Error(format!(
                        "state Ready but status lists {reported} of {expected} modules; last operation: {}",
                        last_operation(&status)
                    ))
                } else if !has_operation {
                    Verdict::Error("state Ready but no last operation reported".to_string())
                } else {
                    Verdict::Ready
                }
            }
            State::Warning => Verdict::Warning(format!(
                "state Warning; last operation: {}",
                last_operation(&status)
            )),
            s if s.is_in_progress() => Verdict::NotReady,
            other => Verdict::Error(format!(
                "state {other}; last operation: {}",
                last_operation(&status)
            )),
        }
    }
}

/// Readiness of a single module inside the Kyma status
#[derive(Clone, Debug)]
pub struct ModuleStatePredicate {
    module: String,
    expected: Vec<State>,
}

impl ModuleStatePredicate {
    /// Ready when `module` reports `Ready` or `Warning`
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            expected: vec![State::Ready, State::Warning],
        }
    }

    /// Override the accepted states
    pub fn expecting(mut self, states: Vec<State>) -> Self {
        self.expected = states;
        self
    }
}

impl ReadinessPredicate for ModuleStatePredicate {
    fn evaluate(&self, obj: &DynamicObject) -> Verdict {
        let kyma = match parse_kyma(obj) {
            Ok(kyma) => kyma,
            Err(verdict) => return verdict,
        };
        let Some(status) = kyma.module_info(&self.module).status else {
            return Verdict::NotReady;
        };
        let state = status.state();
        if self.expected.contains(&state) {
            return Verdict::Ready;
        }
        match state {
            State::Error => Verdict::Error(format!(
                "module {} is in the {} state",
                self.module, state
            )),
            State::Warning => Verdict::Warning(format!(
                "module {} is in the {} state",
                self.module, state
            )),
            _ => Verdict::NotReady,
        }
    }
}
