//! Volume composition for the Trustee pod
//!
//! Turns the optional artifact references on a [`KbsConfigSpec`] into the pod
//! volume list and the per-container mount lists. Every named artifact must
//! exist; the first missing one aborts composition so the Deployment is never
//! rendered from a partial volume set.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, SecretVolumeSource, Volume, VolumeMount,
};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::config::{MountPaths, OperatorConfig};
use crate::crd::{DeploymentType, KbsConfigSpec};
use crate::Error;

/// Volume name for the main KBS config
pub const KBS_CONFIG_VOLUME: &str = "kbs-config";
/// Volume name for the KBS auth secret
pub const AUTH_SECRET_VOLUME: &str = "auth-secret";
/// Volume name for the HTTPS private key
pub const HTTPS_KEY_VOLUME: &str = "https-key";
/// Volume name for the HTTPS certificate
pub const HTTPS_CERT_VOLUME: &str = "https-cert";
/// Volume name for the attestation service config
pub const AS_CONFIG_VOLUME: &str = "as-config";
/// Volume name for the RVPS config
pub const RVPS_CONFIG_VOLUME: &str = "rvps-config";
/// Volume name for the RVPS reference values
pub const REFERENCE_VALUES_VOLUME: &str = "reference-values";

/// Existence checks for artifacts referenced by a KbsConfig
///
/// Only existence matters here; the contents are consumed by the Trustee
/// containers, not by the operator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactLookup: Send + Sync {
    /// Whether a ConfigMap exists
    async fn config_map_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Whether a Secret exists
    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Resolved pod volumes and the mounts for each container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComposedVolumes {
    /// Every volume in the pod, in mount order
    pub volumes: Vec<Volume>,
    /// Mounts for the `kbs` container
    pub kbs_mounts: Vec<VolumeMount>,
    /// Mounts for the `as` container (microservices only)
    pub as_mounts: Vec<VolumeMount>,
    /// Mounts for the `rvps` container (microservices only)
    pub rvps_mounts: Vec<VolumeMount>,
}

/// Which container a volume is mounted in
#[derive(Clone, Copy)]
enum Target {
    Kbs,
    As,
    Rvps,
}

impl ComposedVolumes {
    fn push(&mut self, volume: Volume, root: &str, target: Target) {
        let mount = VolumeMount {
            name: volume.name.clone(),
            mount_path: MountPaths::join(root, &volume.name),
            ..Default::default()
        };
        match target {
            Target::Kbs => self.kbs_mounts.push(mount),
            Target::As => self.as_mounts.push(mount),
            Target::Rvps => self.rvps_mounts.push(mount),
        }
        self.volumes.push(volume);
    }
}

fn config_map_volume(volume_name: &str, config_map: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(volume_name: &str, secret: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn scratch_volume(volume_name: &str) -> Volume {
    Volume {
        name: volume_name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn require_config_map<L>(lookup: &L, namespace: &str, name: &str) -> Result<(), Error>
where
    L: ArtifactLookup + ?Sized,
{
    if lookup.config_map_exists(namespace, name).await? {
        Ok(())
    } else {
        warn!(namespace, config_map = name, "referenced ConfigMap does not exist");
        Err(Error::missing_config_map(namespace, name))
    }
}

async fn require_secret<L>(lookup: &L, namespace: &str, name: &str) -> Result<(), Error>
where
    L: ArtifactLookup + ?Sized,
{
    if lookup.secret_exists(namespace, name).await? {
        Ok(())
    } else {
        warn!(namespace, secret = name, "referenced Secret does not exist");
        Err(Error::missing_secret(namespace, name))
    }
}

/// Resolve every artifact the spec names into volumes and mounts
///
/// The HTTPS pair is validated before any lookup is made. Volumes are emitted
/// in a fixed order (KBS config material, secret resources, scratch space,
/// then the per-topology extras) so repeated compositions of the same spec
/// are identical.
pub async fn compose<L>(
    spec: &KbsConfigSpec,
    namespace: &str,
    lookup: &L,
    config: &OperatorConfig,
) -> Result<ComposedVolumes, Error>
where
    L: ArtifactLookup + ?Sized,
{
    let https = spec.https_secrets()?;
    let paths = &config.paths;
    let mut composed = ComposedVolumes::default();

    if let Some(name) = spec.kbs_config_map() {
        require_config_map(lookup, namespace, name).await?;
        composed.push(
            config_map_volume(KBS_CONFIG_VOLUME, name),
            &paths.kbs_config,
            Target::Kbs,
        );
    }

    if let Some(name) = spec.auth_secret() {
        require_secret(lookup, namespace, name).await?;
        composed.push(
            secret_volume(AUTH_SECRET_VOLUME, name),
            &paths.kbs_config,
            Target::Kbs,
        );
    }

    if let Some((key, cert)) = https {
        require_secret(lookup, namespace, key).await?;
        require_secret(lookup, namespace, cert).await?;
        composed.push(
            secret_volume(HTTPS_KEY_VOLUME, key),
            &paths.kbs_config,
            Target::Kbs,
        );
        composed.push(
            secret_volume(HTTPS_CERT_VOLUME, cert),
            &paths.kbs_config,
            Target::Kbs,
        );
    }

    for name in spec.secret_resources() {
        require_secret(lookup, namespace, name).await?;
        composed.push(secret_volume(name, name), &paths.kbs_resources, Target::Kbs);
    }

    composed.push(
        scratch_volume(&config.scratch_volume_name),
        &paths.scratch_root,
        Target::Kbs,
    );

    match spec.deployment_type() {
        DeploymentType::AllInOne => {
            if let Some(name) = spec.rvps_ref_values_config_map() {
                require_config_map(lookup, namespace, name).await?;
                composed.push(
                    config_map_volume(REFERENCE_VALUES_VOLUME, name),
                    &paths.rvps_reference_values,
                    Target::Kbs,
                );
            }
        }
        DeploymentType::Microservices => {
            if let Some(name) = spec.as_config_map() {
                require_config_map(lookup, namespace, name).await?;
                composed.push(
                    config_map_volume(AS_CONFIG_VOLUME, name),
                    &paths.as_config,
                    Target::As,
                );
            }
            if let Some(name) = spec.rvps_config_map() {
                require_config_map(lookup, namespace, name).await?;
                composed.push(
                    config_map_volume(RVPS_CONFIG_VOLUME, name),
                    &paths.rvps_config,
                    Target::Rvps,
                );
            }
            if let Some(name) = spec.rvps_ref_values_config_map() {
                require_config_map(lookup, namespace, name).await?;
                composed.push(
                    config_map_volume(REFERENCE_VALUES_VOLUME, name),
                    &paths.rvps_reference_values,
                    Target::Rvps,
                );
            }
        }
    }

    debug!(
        namespace,
        volumes = composed.volumes.len(),
        "composed Trustee volumes"
    );
    Ok(composed)
}
