//! Finalizer handling for KbsConfig resources
//!
//! A KbsConfig carries a finalizer so that the Trustee Deployment is removed
//! before the record disappears from the API server.

use kube::ResourceExt;
use tracing::{debug, info};

use crate::config::OperatorConfig;
use crate::controller::KubeClient;
use crate::crd::KbsConfig;
use crate::Error;

/// Check whether the record carries `finalizer`
pub fn has_finalizer(kbs_config: &KbsConfig, finalizer: &str) -> bool {
    kbs_config.finalizers().iter().any(|f| f == finalizer)
}

/// Finalizer list with `finalizer` appended if missing
pub fn with_finalizer(kbs_config: &KbsConfig, finalizer: &str) -> Vec<String> {
    let mut finalizers = kbs_config.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizer list with every occurrence of `finalizer` removed
pub fn without_finalizer(kbs_config: &KbsConfig, finalizer: &str) -> Vec<String> {
    kbs_config
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect()
}

/// Make sure the Trustee Deployment in `namespace` no longer exists
///
/// A Deployment that is already gone, whether at lookup or at delete time,
/// counts as finalized. Any other failure is returned and the finalizer stays.
pub async fn finalize<K>(kube: &K, namespace: &str, config: &OperatorConfig) -> Result<(), Error>
where
    K: KubeClient + ?Sized,
{
    let name = &config.deployment_name;

    if kube.get_deployment(namespace, name).await?.is_none() {
        debug!(namespace, deployment = %name, "deployment already absent");
        return Ok(());
    }

    info!(namespace, deployment = %name, "deleting Trustee deployment");
    match kube.delete_deployment(namespace, name).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(namespace, deployment = %name, "deployment deleted concurrently");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
