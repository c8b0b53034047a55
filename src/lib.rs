//! Trustee Operator - Kubernetes operator for the Trustee attestation services
//!
//! The operator watches `KbsConfig` resources and keeps one Trustee deployment
//! per namespace in line with them: a Deployment running the key broker
//! service (KBS) alone or alongside the attestation service (AS) and the
//! reference value provider service (RVPS), plus a Service exposing the KBS.
//! Configuration files and keys are supplied by the user as ConfigMaps and
//! Secrets and mounted into the containers.
//!
//! # Modules
//!
//! - [`crd`] - The KbsConfig Custom Resource Definition
//! - [`controller`] - Reconcile loop, error policy and the Kubernetes client seam
//! - [`volumes`] - Resolves referenced ConfigMaps and Secrets into pod volumes
//! - [`resources`] - Builds the desired Deployment and Service
//! - [`finalizer`] - Deletion-time teardown gated by a finalizer
//! - [`filter`] - Event predicates for ConfigMap and Secret watches
//! - [`config`] - Fixed names, mount paths and container images
//! - [`retry`] - Requeue backoff for failed reconciles
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod filter;
pub mod finalizer;
pub mod resources;
pub mod retry;
pub mod volumes;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
