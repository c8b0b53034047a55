//! Operator configuration
//!
//! Every fixed name, mount path and default image used when rendering the
//! Trustee workload lives on [`OperatorConfig`]. The binary fills it from CLI
//! flags and environment variables; tests start from [`OperatorConfig::default`]
//! and override what they need.

use std::collections::BTreeMap;
use std::path::Path;

/// Default namespace the operator runs in when `POD_NAMESPACE` is unset
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "trustee-operator-system";

/// Default KBS image (built against the gRPC attestation service)
pub const DEFAULT_KBS_IMAGE: &str = "ghcr.io/confidential-containers/staged-images/kbs-grpc-as:latest";

/// Default attestation service image
pub const DEFAULT_AS_IMAGE: &str = "ghcr.io/confidential-containers/staged-images/coco-as-grpc:latest";

/// Default reference value provider image
pub const DEFAULT_RVPS_IMAGE: &str = "ghcr.io/confidential-containers/staged-images/rvps:latest";

/// Container images for each Trustee component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Images {
    /// Key broker service
    pub kbs: String,
    /// Attestation service
    pub attestation_service: String,
    /// Reference value provider service
    pub rvps: String,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            kbs: DEFAULT_KBS_IMAGE.to_string(),
            attestation_service: DEFAULT_AS_IMAGE.to_string(),
            rvps: DEFAULT_RVPS_IMAGE.to_string(),
        }
    }
}

/// Filesystem roots that resolved volumes are mounted under
///
/// Each volume lands at `<root>/<volume name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPaths {
    /// KBS config, auth and HTTPS material
    pub kbs_config: String,
    /// Secrets exposed as KBS resources
    pub kbs_resources: String,
    /// Root of the in-memory scratch volume
    pub scratch_root: String,
    /// Attestation service config
    pub as_config: String,
    /// RVPS config
    pub rvps_config: String,
    /// RVPS reference values
    pub rvps_reference_values: String,
}

impl Default for MountPaths {
    fn default() -> Self {
        Self {
            kbs_config: "/etc".to_string(),
            kbs_resources: "/opt/confidential-containers/kbs/repository/default".to_string(),
            scratch_root: "/opt".to_string(),
            as_config: "/etc".to_string(),
            rvps_config: "/etc".to_string(),
            rvps_reference_values: "/opt/confidential-containers/rvps".to_string(),
        }
    }
}

impl MountPaths {
    /// Join a mount root and a volume name into a mount path
    pub fn join(root: &str, volume_name: &str) -> String {
        Path::new(root).join(volume_name).to_string_lossy().into_owned()
    }
}

/// Configuration shared by every reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace the operator watches ConfigMaps and Secrets in
    pub namespace: String,
    /// Name of the Trustee Deployment (one per namespace)
    pub deployment_name: String,
    /// Name of the KBS Service (one per namespace)
    pub service_name: String,
    /// Finalizer placed on KbsConfig resources
    pub finalizer: String,
    /// Label key used for the pod selector
    pub app_label_key: String,
    /// Label value used for the pod selector
    pub app_label_value: String,
    /// Name of the memory-backed scratch volume
    pub scratch_volume_name: String,
    /// Container images
    pub images: Images,
    /// Mount roots
    pub paths: MountPaths,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_OPERATOR_NAMESPACE.to_string(),
            deployment_name: "trustee-deployment".to_string(),
            service_name: "kbs-service".to_string(),
            finalizer: "kbsconfig.confidentialcontainers.org/finalizer".to_string(),
            app_label_key: "app".to_string(),
            app_label_value: "kbs".to_string(),
            scratch_volume_name: "confidential-containers".to_string(),
            images: Images::default(),
            paths: MountPaths::default(),
        }
    }
}

impl OperatorConfig {
    /// Set the operating namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Replace the container images
    pub fn with_images(mut self, images: Images) -> Self {
        self.images = images;
        self
    }

    /// Labels shared by the pod template and both selectors
    pub fn app_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(self.app_label_key.clone(), self.app_label_value.clone())])
    }
}
