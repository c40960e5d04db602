//! Common types for converge: the Kyma CRD, errors, retry and manifest utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod manifest;
pub mod resource;
pub mod retry;
pub mod yaml;

pub use error::{ApplyFailure, Error};
pub use resource::ResourceRef;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply unless overridden
pub const DEFAULT_FIELD_MANAGER: &str = "converge";
