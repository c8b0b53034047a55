//! Controller implementation for KbsConfig
//!
//! This module contains the reconciliation logic for KbsConfig resources.
//! The controller follows the Kubernetes pattern of re-reading current state
//! and converging the owned Deployment and Service onto the desired state.

mod apply;
mod kbs_config;

pub use apply::{reconcile_deployment, reconcile_service};
pub use kbs_config::{
    error_policy, reconcile, ApplyRequest, Context, ContextBuilder, KubeClient, KubeClientImpl,
    FIELD_MANAGER,
};

#[cfg(test)]
pub use kbs_config::MockKubeClient;
