//! Custom Resource Definitions for the Trustee operator
//!
//! The operator owns a single CRD, `KbsConfig`, which describes one Trustee
//! deployment per namespace.

mod kbs_config;
mod types;

pub use kbs_config::{KbsConfig, KbsConfigSpec};
pub use types::{DeploymentType, ServiceType};
