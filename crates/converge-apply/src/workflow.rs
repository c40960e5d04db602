//! Enabling a module together with its custom resources
//!
//! The module's CRDs only exist once the lifecycle manager installed it, so
//! custom resources are applied after the module reports Ready or Warning.

use std::sync::Arc;

use kube::api::DynamicObject;
use tracing::{info, instrument};

use converge_common::crd::{CustomResourcePolicy, KymaSpec};
use converge_common::{ResourceRef, Result};

use crate::apply::{ApplySummary, ConcurrentPatcher};
use crate::mutate::{MutationOutcome, SpecMutator};
use crate::readiness::ModuleStatePredicate;
use crate::report::StatusObserver;
use crate::transport::ClusterTransport;
use crate::watch::{ReadinessWatcher, WaitOptions};

/// One module to enable
#[derive(Clone, Debug, Default)]
pub struct EnableRequest {
    /// Module name
    pub name: String,
    /// Channel overriding the Kyma default
    pub channel: Option<String>,
    /// Treatment of the module's default custom resource
    pub policy: Option<CustomResourcePolicy>,
    /// Wait for the module even without custom resources to apply
    pub wait: bool,
    /// Applied once the module runs
    pub custom_resources: Vec<DynamicObject>,
}

impl EnableRequest {
    /// Enable `name` on the Kyma default channel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// What enabling a module did
#[derive(Debug)]
pub struct EnableReport {
    /// Result of the spec edit
    pub outcome: MutationOutcome,
    /// Custom resources applied after the module became ready
    pub applied: Option<ApplySummary>,
}

/// Enable, wait, then apply: the full `module enable` sequence
#[derive(Clone)]
pub struct ModuleWorkflow {
    mutator: SpecMutator,
    watcher: ReadinessWatcher,
    patcher: ConcurrentPatcher,
}

impl ModuleWorkflow {
    /// Build the workflow over one transport
    pub fn new(transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            mutator: SpecMutator::new(transport.clone()),
            watcher: ReadinessWatcher::new(transport.clone()),
            patcher: ConcurrentPatcher::new(transport),
        }
    }

    /// Add or update the module in the Kyma spec.
    ///
    /// With custom resources, or when asked to, waits for the module; the
    /// custom resources are then server-side applied by `owner` without
    /// taking over fields of other managers. Nothing is applied when the
    /// wait fails.
    #[instrument(skip_all, fields(kyma = %kyma, module = %request.name))]
    pub async fn enable(
        &self,
        kyma: &ResourceRef,
        request: &EnableRequest,
        owner: &str,
        opts: &WaitOptions,
        observer: &mut dyn StatusObserver,
    ) -> Result<EnableReport> {
        let outcome = self
            .mutator
            .mutate_spec(kyma, |spec: &KymaSpec| {
                spec.enable_module(&request.name, request.channel.as_deref(), request.policy)
            })
            .await?;

        if !request.wait && request.custom_resources.is_empty() {
            return Ok(EnableReport {
                outcome,
                applied: None,
            });
        }

        self.watcher
            .wait_until_ready(
                kyma,
                &ModuleStatePredicate::new(&request.name),
                &outcome,
                opts,
                observer,
            )
            .await?;

        if request.custom_resources.is_empty() {
            return Ok(EnableReport {
                outcome,
                applied: None,
            });
        }

        info!(
            count = request.custom_resources.len(),
            "applying module custom resources"
        );
        let applied = self
            .patcher
            .apply(owner, false, request.custom_resources.clone())
            .await?;
        Ok(EnableReport {
            outcome,
            applied: Some(applied),
        })
    }
}
