//! Custom Resource Definitions consumed by converge
//!
//! Only the Kyma singleton is typed; everything else in a manifest is
//! handled as a `DynamicObject`.

mod kyma;

pub use kyma::{
    kyma_ref, CustomResourcePolicy, Kyma, KymaModuleInfo, KymaSpec, KymaStatus, LastOperation,
    Module, ModuleStatus, State, DEFAULT_KYMA_NAME, DEFAULT_KYMA_NAMESPACE, KYMA_GROUP,
    KYMA_VERSION,
};
