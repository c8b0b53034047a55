//! Supporting types for the KbsConfig CRD

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the Trustee components are laid out inside the Deployment
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentType {
    /// KBS, AS and RVPS each run in their own container
    #[default]
    #[serde(rename = "MicroservicesDeployment")]
    Microservices,
    /// A single KBS container with built-in AS and RVPS
    #[serde(rename = "AllInOneDeployment")]
    AllInOne,
}

impl std::str::FromStr for DeploymentType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MicroservicesDeployment" | "Microservices" => Ok(Self::Microservices),
            "AllInOneDeployment" | "AllInOne" => Ok(Self::AllInOne),
            _ => Err(crate::Error::validation(format!(
                "invalid deployment type: {s}, expected MicroservicesDeployment or AllInOneDeployment"
            ))),
        }
    }
}

impl std::fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Microservices => write!(f, "MicroservicesDeployment"),
            Self::AllInOne => write!(f, "AllInOneDeployment"),
        }
    }
}

/// Kubernetes Service type for the KBS endpoint
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ServiceType {
    /// Reachable only from inside the cluster
    #[default]
    ClusterIP,
    /// Exposed on a port of every node
    NodePort,
    /// Exposed through a cloud load balancer
    LoadBalancer,
    /// CNAME to an external name
    ExternalName,
}

impl ServiceType {
    /// The value written to `spec.type` on the Service
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIP => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
            Self::ExternalName => "ExternalName",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
