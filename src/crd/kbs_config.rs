//! KbsConfig Custom Resource Definition
//!
//! A KbsConfig describes the Trustee deployment the operator maintains in its
//! namespace: which topology to run, how the KBS is exposed, and which
//! externally managed ConfigMaps and Secrets are mounted into the containers.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DeploymentType, ServiceType};

/// Specification for a KbsConfig
///
/// Every artifact reference is optional. An empty string is treated the same
/// as an omitted field.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "confidentialcontainers.org",
    version = "v1alpha1",
    kind = "KbsConfig",
    plural = "kbsconfigs",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.kbsDeploymentType"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KbsConfigSpec {
    /// ConfigMap holding `kbs-config.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_config_map_name: Option<String>,

    /// ConfigMap holding `as-config.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_as_config_map_name: Option<String>,

    /// ConfigMap holding `rvps-config.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_rvps_config_map_name: Option<String>,

    /// ConfigMap holding the RVPS reference values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_rvps_ref_values_config_map_name: Option<String>,

    /// Secret holding the KBS admin authentication key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_auth_secret_name: Option<String>,

    /// Service type used to expose the KBS (defaults to ClusterIP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_service_type: Option<ServiceType>,

    /// Component topology (defaults to MicroservicesDeployment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_deployment_type: Option<DeploymentType>,

    /// Secret holding the HTTPS private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_https_key_secret_name: Option<String>,

    /// Secret holding the HTTPS certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_https_cert_secret_name: Option<String>,

    /// Secrets exposed verbatim as KBS resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kbs_secret_resources: Option<Vec<String>>,
}

fn configured(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|name| !name.is_empty())
}

impl KbsConfigSpec {
    /// Component topology, defaulted
    pub fn deployment_type(&self) -> DeploymentType {
        self.kbs_deployment_type.unwrap_or_default()
    }

    /// Service type, defaulted
    pub fn service_type(&self) -> ServiceType {
        self.kbs_service_type.unwrap_or_default()
    }

    /// Main KBS ConfigMap, if requested
    pub fn kbs_config_map(&self) -> Option<&str> {
        configured(&self.kbs_config_map_name)
    }

    /// Attestation service ConfigMap, if requested
    pub fn as_config_map(&self) -> Option<&str> {
        configured(&self.kbs_as_config_map_name)
    }

    /// RVPS ConfigMap, if requested
    pub fn rvps_config_map(&self) -> Option<&str> {
        configured(&self.kbs_rvps_config_map_name)
    }

    /// Reference values ConfigMap, if requested
    pub fn rvps_ref_values_config_map(&self) -> Option<&str> {
        configured(&self.kbs_rvps_ref_values_config_map_name)
    }

    /// Authentication Secret, if requested
    pub fn auth_secret(&self) -> Option<&str> {
        configured(&self.kbs_auth_secret_name)
    }

    /// Secret resources to mount, in declaration order
    ///
    /// Empty entries are skipped like any other unset name.
    pub fn secret_resources(&self) -> impl Iterator<Item = &str> {
        self.kbs_secret_resources
            .iter()
            .flatten()
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    /// The HTTPS key and certificate Secret names
    ///
    /// Returns `Ok(None)` when neither is set and a validation error when only
    /// one of them is.
    pub fn https_secrets(&self) -> Result<Option<(&str, &str)>, crate::Error> {
        match (
            configured(&self.kbs_https_key_secret_name),
            configured(&self.kbs_https_cert_secret_name),
        ) {
            (None, None) => Ok(None),
            (Some(key), Some(cert)) => Ok(Some((key, cert))),
            _ => Err(crate::Error::validation(
                "invalid https parameters, missing key or certificate",
            )),
        }
    }
}
