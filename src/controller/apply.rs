//! Create-or-update for the Trustee child objects
//!
//! Each child is looked up by its fixed name. A missing child is created from
//! the desired object; an existing one is overwritten with it.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info};

use super::KubeClient;
use crate::Error;

fn object_key(metadata: &ObjectMeta) -> Result<(&str, &str), Error> {
    let namespace = metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey("name"))?;
    Ok((namespace, name))
}

/// Converge the Trustee Deployment onto `desired`
pub async fn reconcile_deployment<K>(kube: &K, desired: &Deployment) -> Result<(), Error>
where
    K: KubeClient + ?Sized,
{
    let (namespace, name) = object_key(&desired.metadata)?;

    if kube.get_deployment(namespace, name).await?.is_none() {
        info!(namespace, deployment = name, "creating deployment");
        kube.create_deployment(desired).await
    } else {
        debug!(namespace, deployment = name, "updating deployment");
        kube.update_deployment(desired).await
    }
}

/// Converge the KBS Service onto `desired`
pub async fn reconcile_service<K>(kube: &K, desired: &Service) -> Result<(), Error>
where
    K: KubeClient + ?Sized,
{
    let (namespace, name) = object_key(&desired.metadata)?;

    if kube.get_service(namespace, name).await?.is_none() {
        info!(namespace, service = name, "creating service");
        kube.create_service(desired).await
    } else {
        debug!(namespace, service = name, "updating service");
        kube.update_service(desired).await
    }
}
