//! Desired-state builders for the Trustee Deployment and Service
//!
//! Both builders are pure: they turn a KbsConfig and an already composed
//! volume set into the exact objects the operator submits to the API server.

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::Resource;

use crate::config::OperatorConfig;
use crate::crd::{DeploymentType, KbsConfig};
use crate::volumes::ComposedVolumes;
use crate::Error;

/// Port the KBS listens on, both in the container and on the Service
pub const KBS_PORT: i32 = 8080;
/// Port the attestation service listens on
pub const AS_PORT: i32 = 50004;
/// Port the RVPS listens on
pub const RVPS_PORT: i32 = 50003;

const KBS_COMMAND: &[&str] = &[
    "/usr/local/bin/kbs",
    "--config-file",
    "/etc/kbs-config/kbs-config.json",
];

const AS_COMMAND: &[&str] = &[
    "/usr/local/bin/grpc-as",
    "--socket",
    "0.0.0.0:50004",
    "--config-file",
    "/etc/as-config/as-config.json",
];

const RVPS_COMMAND: &[&str] = &[
    "/usr/local/bin/rvps",
    "-c",
    "/etc/rvps-config/rvps-config.json",
];

fn owner_reference(kbs_config: &KbsConfig) -> Result<OwnerReference, Error> {
    kbs_config
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("name or uid"))
}

fn container(
    name: &str,
    image: &str,
    command: &[&str],
    port: i32,
    mounts: Vec<VolumeMount>,
) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image.to_string()),
        command: Some(command.iter().map(|arg| arg.to_string()).collect()),
        ports: Some(vec![ContainerPort {
            container_port: port,
            name: Some(name.to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

/// Build the Trustee Deployment for a KbsConfig
///
/// Microservices topology yields `kbs`, `as` and `rvps` containers in that
/// order; all-in-one yields only `kbs`.
pub fn build_deployment(
    kbs_config: &KbsConfig,
    namespace: &str,
    volumes: ComposedVolumes,
    config: &OperatorConfig,
) -> Result<Deployment, Error> {
    let owner = owner_reference(kbs_config)?;
    let labels = config.app_labels();
    let images = &config.images;

    let ComposedVolumes {
        volumes,
        kbs_mounts,
        as_mounts,
        rvps_mounts,
    } = volumes;

    let mut containers = vec![container("kbs", &images.kbs, KBS_COMMAND, KBS_PORT, kbs_mounts)];
    if kbs_config.spec.deployment_type() == DeploymentType::Microservices {
        containers.push(container(
            "as",
            &images.attestation_service,
            AS_COMMAND,
            AS_PORT,
            as_mounts,
        ));
        containers.push(container(
            "rvps",
            &images.rvps,
            RVPS_COMMAND,
            RVPS_PORT,
            rvps_mounts,
        ));
    }

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(config.deployment_name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateDeployment {
                    max_unavailable: Some(IntOrString::Int(1)),
                    ..Default::default()
                }),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the KBS Service for a KbsConfig
pub fn build_service(
    kbs_config: &KbsConfig,
    namespace: &str,
    config: &OperatorConfig,
) -> Result<Service, Error> {
    let owner = owner_reference(kbs_config)?;

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(config.service_name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(config.app_labels()),
            type_: Some(kbs_config.spec.service_type().as_str().to_string()),
            ports: Some(vec![ServicePort {
                name: Some("kbs-port".to_string()),
                protocol: Some("TCP".to_string()),
                port: KBS_PORT,
                target_port: Some(IntOrString::Int(KBS_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
