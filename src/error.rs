//! Error types for the Trustee operator

use thiserror::Error;

/// Main error type for Trustee operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A ConfigMap or Secret named by a KbsConfig does not exist
    #[error("{kind} {namespace}/{name} referenced by KbsConfig does not exist")]
    MissingArtifact {
        /// Artifact kind (ConfigMap or Secret)
        kind: &'static str,
        /// Namespace that was searched
        namespace: String,
        /// Artifact name as written in the KbsConfig
        name: String,
    },

    /// Validation error for KbsConfig specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Object is missing a namespace or name
    #[error("object has no {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a missing-artifact error for a ConfigMap
    pub fn missing_config_map(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingArtifact {
            kind: "ConfigMap",
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a missing-artifact error for a Secret
    pub fn missing_secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::MissingArtifact {
            kind: "Secret",
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Returns true if this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }
}
