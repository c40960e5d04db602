//! Kyma Custom Resource Definition
//!
//! The Kyma CR is the singleton per cluster that lists the modules the
//! lifecycle manager should install. The CLI only ever edits its spec; the
//! status is written by the remote controller and read back to decide
//! readiness.

use std::collections::BTreeMap;
use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resource::ResourceRef;
use crate::Error;

/// Name of the Kyma singleton
pub const DEFAULT_KYMA_NAME: &str = "default";
/// Namespace of the Kyma singleton
pub const DEFAULT_KYMA_NAMESPACE: &str = "kyma-system";
/// API group of the Kyma CRD
pub const KYMA_GROUP: &str = "operator.kyma-project.io";
/// API version of the Kyma CRD
pub const KYMA_VERSION: &str = "v1beta2";

/// Desired state of the Kyma singleton
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.kyma-project.io",
    version = "v1beta2",
    kind = "Kyma",
    plural = "kymas",
    status = "KymaStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KymaSpec {
    /// Default release channel for modules that don't set their own
    #[serde(default)]
    pub channel: String,

    /// Modules to install, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<Module>,

    /// Spec fields this client does not model, written back untouched
    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// How the lifecycle manager treats a module's default custom resource
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CustomResourcePolicy {
    /// Leave the module CR to the user
    Ignore,
    /// Create the default module CR on enable and delete it on disable
    CreateAndDelete,
}

impl fmt::Display for CustomResourcePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignore => write!(f, "Ignore"),
            Self::CreateAndDelete => write!(f, "CreateAndDelete"),
        }
    }
}

impl std::str::FromStr for CustomResourcePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Ignore" => Ok(Self::Ignore),
            "CreateAndDelete" => Ok(Self::CreateAndDelete),
            _ => Err(Error::validation(format!(
                "invalid custom resource policy: {s}, expected one of: Ignore, CreateAndDelete"
            ))),
        }
    }
}

/// A module entry in the Kyma spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Module name, unique within the spec
    pub name: String,

    /// Controller that should reconcile this module
    #[serde(rename = "controller", default, skip_serializing_if = "Option::is_none")]
    pub controller_name: Option<String>,

    /// Release channel overriding `KymaSpec::channel`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Treatment of the module's default CR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resource_policy: Option<CustomResourcePolicy>,

    /// Whether the lifecycle manager manages the module (absent means managed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<bool>,

    /// Module fields this client does not model, written back untouched
    #[serde(flatten)]
    #[schemars(skip)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Module {
    /// A managed module on the default channel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Whether the lifecycle manager manages this module
    pub fn is_managed(&self) -> bool {
        self.managed.unwrap_or(true)
    }
}

/// Reported state of the Kyma or of one module
///
/// Unknown strings are kept verbatim so a newer controller doesn't break
/// classification of the states this client knows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Reconciled successfully
    Ready,
    /// Reconciliation in progress
    Processing,
    /// Being deleted
    Deleting,
    /// Reconciled with a non-fatal problem that needs user attention
    Warning,
    /// Reconciliation failed
    Error,
    /// No state reported yet
    Empty,
    /// A state this client does not know
    Unknown(String),
}

impl From<&str> for State {
    fn from(s: &str) -> Self {
        match s {
            "Ready" => Self::Ready,
            "Processing" => Self::Processing,
            "Deleting" => Self::Deleting,
            "Warning" => Self::Warning,
            "Error" => Self::Error,
            "" => Self::Empty,
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl State {
    /// States where the controller is still working and a verdict would be premature
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::Processing | Self::Deleting | Self::Empty)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "Ready"),
            Self::Processing => write!(f, "Processing"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
            Self::Empty => write!(f, "<none>"),
            Self::Unknown(s) => write!(f, "{s}"),
        }
    }
}

/// Observed state of the Kyma singleton
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KymaStatus {
    /// Overall state as reported by the lifecycle manager
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Per-module status
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleStatus>,

    /// Last operation the controller performed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
}

impl KymaStatus {
    /// Parsed overall state
    pub fn state(&self) -> State {
        State::from(self.state.as_deref().unwrap_or_default())
    }
}

/// Reported status of one module
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatus {
    /// Module name
    pub name: String,
    /// Channel the module was installed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Installed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Module state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl ModuleStatus {
    /// Parsed module state
    pub fn state(&self) -> State {
        State::from(self.state.as_deref().unwrap_or_default())
    }
}

/// Marker the controller writes after every reconciliation
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Human-readable description of the operation
    #[serde(default)]
    pub operation: String,
    /// RFC 3339 timestamp of the operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

impl LastOperation {
    /// `"<operation> (at <time>)"`, or just the operation when no time is set
    pub fn describe(&self) -> String {
        match &self.last_update_time {
            Some(at) => format!("{} (at {})", self.operation, at),
            None => self.operation.clone(),
        }
    }
}

/// Spec and status of one module side by side
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KymaModuleInfo {
    /// Spec entry, if the module is configured
    pub spec: Option<Module>,
    /// Status entry, if the controller reported one
    pub status: Option<ModuleStatus>,
}

impl KymaSpec {
    /// Validate the module list
    ///
    /// Every module needs a non-empty, unique name.
    pub fn validate(&self) -> Result<(), Error> {
        for (i, module) in self.modules.iter().enumerate() {
            if module.name.trim().is_empty() {
                return Err(Error::validation_for_field(
                    format!("spec.modules[{i}].name"),
                    "module name cannot be empty",
                ));
            }
            if self.modules[..i].iter().any(|m| m.name == module.name) {
                return Err(Error::validation_for_field(
                    format!("spec.modules[{i}].name"),
                    format!("module {} is listed more than once", module.name),
                ));
            }
        }
        Ok(())
    }

    /// Look up a module by name
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Add a module, or update channel and policy of an existing one.
    ///
    /// Applying the same arguments twice yields the same spec.
    pub fn enable_module(
        &self,
        name: &str,
        channel: Option<&str>,
        policy: Option<CustomResourcePolicy>,
    ) -> Result<KymaSpec, Error> {
        if name.trim().is_empty() {
            return Err(Error::validation_for_field("name", "module name cannot be empty"));
        }
        let mut spec = self.clone();
        match spec.modules.iter_mut().find(|m| m.name == name) {
            Some(module) => {
                module.channel = channel.map(str::to_string);
                module.custom_resource_policy = policy;
            }
            None => spec.modules.push(Module {
                name: name.to_string(),
                channel: channel.map(str::to_string),
                custom_resource_policy: policy,
                ..Default::default()
            }),
        }
        spec.validate()?;
        Ok(spec)
    }

    /// Remove a module, failing when no matching module is configured.
    ///
    /// With a channel, only a module on that channel matches.
    pub fn disable_module(&self, name: &str, channel: Option<&str>) -> Result<KymaSpec, Error> {
        let matches = |m: &Module| {
            m.name == name && channel.map_or(true, |c| m.channel.as_deref() == Some(c))
        };
        if !self.modules.iter().any(matches) {
            let on_channel = channel
                .map(|c| format!(" on channel {c}"))
                .unwrap_or_default();
            return Err(Error::validation_for_field(
                "name",
                format!("no active module {name}{on_channel} found to disable"),
            ));
        }
        let mut spec = self.clone();
        spec.modules.retain(|m| !matches(m));
        Ok(spec)
    }

    /// Remove a module if present; a missing module leaves the spec unchanged.
    pub fn without_module(&self, name: &str) -> KymaSpec {
        let mut spec = self.clone();
        spec.modules.retain(|m| m.name != name);
        spec
    }

    /// Mark a module managed with the given policy
    pub fn manage_module(
        &self,
        name: &str,
        policy: CustomResourcePolicy,
    ) -> Result<KymaSpec, Error> {
        self.update_module(name, |m| {
            m.managed = Some(true);
            m.custom_resource_policy = Some(policy);
        })
    }

    /// Mark a module unmanaged; its CR is then left alone
    pub fn unmanage_module(&self, name: &str) -> Result<KymaSpec, Error> {
        self.update_module(name, |m| {
            m.managed = Some(false);
            m.custom_resource_policy = Some(CustomResourcePolicy::Ignore);
        })
    }

    fn update_module(&self, name: &str, update: impl FnOnce(&mut Module)) -> Result<KymaSpec, Error> {
        let mut spec = self.clone();
        let module = spec
            .modules
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| {
                Error::validation_for_field("name", format!("module {name} not found"))
            })?;
        update(module);
        Ok(spec)
    }
}

impl Kyma {
    /// Reference to this object
    pub fn resource_ref(&self) -> ResourceRef {
        kyma_ref(
            self.metadata.name.as_deref().unwrap_or(DEFAULT_KYMA_NAME),
            self.metadata.namespace.as_deref().unwrap_or(DEFAULT_KYMA_NAMESPACE),
        )
    }

    /// Joined spec/status view of one module
    pub fn module_info(&self, name: &str) -> KymaModuleInfo {
        KymaModuleInfo {
            spec: self.spec.module(name).cloned(),
            status: self
                .status
                .as_ref()
                .and_then(|s| s.modules.iter().find(|m| m.name == name))
                .cloned(),
        }
    }
}

/// Reference to a Kyma object
pub fn kyma_ref(name: &str, namespace: &str) -> ResourceRef {
    ResourceRef::new(KYMA_GROUP, KYMA_VERSION, "Kyma", Some(namespace), name)
}
