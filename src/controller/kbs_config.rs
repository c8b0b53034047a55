//! KbsConfig controller implementation
//!
//! Each reconcile re-reads the KbsConfig, then either tears the Trustee
//! Deployment down (record being deleted) or renders the Deployment and
//! Service from the current spec and applies them.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use super::apply::{reconcile_deployment, reconcile_service};
use crate::config::OperatorConfig;
use crate::crd::KbsConfig;
use crate::finalizer::{finalize, has_finalizer, with_finalizer, without_finalizer};
use crate::resources::{build_deployment, build_service};
use crate::retry::{RequeueBackoff, RetryConfig};
use crate::volumes::{compose, ArtifactLookup};
use crate::Error;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "trustee-operator";

/// Trait abstracting Kubernetes client operations for KbsConfig
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production. Lookups return `Ok(None)` when the object
/// does not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a KbsConfig
    async fn get_kbs_config(&self, namespace: &str, name: &str)
        -> Result<Option<KbsConfig>, Error>;

    /// Replace the finalizer list of a KbsConfig
    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error>;

    /// Fetch a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Create a Deployment
    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Bring an existing Deployment in line with the given object
    ///
    /// Fields absent from `deployment` are removed from the live object.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Delete a Deployment
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Fetch a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, service: &Service) -> Result<(), Error>;

    /// Bring an existing Service in line with the given object
    ///
    /// Fields absent from `service` are removed from the live object.
    async fn update_service(&self, service: &Service) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
///
/// Child objects are always written as an [`ApplyRequest`].
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn server_side_apply<K>(&self, obj: &K) -> Result<(), Error>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
    {
        let request = ApplyRequest::new(obj)?;
        self.namespaced::<K>(&request.namespace)
            .patch(&request.name, &request.params, &Patch::Apply(&request.body))
            .await?;
        Ok(())
    }
}

/// A forced server-side apply of one child object
///
/// Creates and updates of the Deployment and Service both go out as this
/// request, so [`FIELD_MANAGER`] is the only manager of every field it sets
/// and fields dropped from the desired object are pruned on the next apply.
#[derive(Debug)]
pub struct ApplyRequest {
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
    /// Apply parameters (field manager, force)
    pub params: PatchParams,
    /// Full desired object
    pub body: serde_json::Value,
}

impl ApplyRequest {
    /// Build the apply request for `obj`
    pub fn new<K: Resource + Serialize>(obj: &K) -> Result<Self, Error> {
        let meta = obj.meta();
        let namespace = meta
            .namespace
            .clone()
            .ok_or(Error::MissingObjectKey("namespace"))?;
        let name = meta.name.clone().ok_or(Error::MissingObjectKey("name"))?;
        let body = serde_json::to_value(obj)
            .map_err(|e| Error::serialization(format!("apply patch: {e}")))?;
        Ok(Self {
            namespace,
            name,
            params: PatchParams::apply(FIELD_MANAGER).force(),
            body,
        })
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_kbs_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<KbsConfig>, Error> {
        Ok(self.namespaced::<KbsConfig>(namespace).get_opt(name).await?)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.namespaced::<KbsConfig>(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self.namespaced::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.server_side_apply(deployment).await
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.server_side_apply(deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.namespaced::<Deployment>(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        Ok(self.namespaced::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<(), Error> {
        self.server_side_apply(service).await
    }

    async fn update_service(&self, service: &Service) -> Result<(), Error> {
        self.server_side_apply(service).await
    }
}

#[async_trait]
impl ArtifactLookup for KubeClientImpl {
    async fn config_map_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let found = self
            .namespaced::<ConfigMap>(namespace)
            .get_metadata_opt(name)
            .await?;
        Ok(found.is_some())
    }

    async fn secret_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let found = self
            .namespaced::<Secret>(namespace)
            .get_metadata_opt(name)
            .await?;
        Ok(found.is_some())
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances against a live cluster:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(OperatorConfig::default().with_namespace("trustee"))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Existence checks for referenced ConfigMaps and Secrets
    pub artifacts: Arc<dyn ArtifactLookup>,
    /// Fixed names, paths and images
    pub config: OperatorConfig,
    /// Per-record requeue backoff
    pub backoff: RequeueBackoff,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Assemble a context from explicit parts
    ///
    /// Useful when the cluster API is provided by something other than a
    /// live client, such as an in-memory store.
    pub fn new(
        kube: Arc<dyn KubeClient>,
        artifacts: Arc<dyn ArtifactLookup>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            kube,
            artifacts,
            config,
            backoff: RequeueBackoff::default(),
        }
    }

    /// Replace the requeue backoff parameters
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.backoff = RequeueBackoff::new(retry);
        self
    }

    /// Create a context for testing with mock clients and default config
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, artifacts: Arc<dyn ArtifactLookup>) -> Self {
        Self::new(kube, artifacts, OperatorConfig::default())
    }
}

/// Builder for constructing [`Context`] instances
///
/// Anything not overridden is backed by a [`KubeClientImpl`] over the given
/// client.
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    artifacts: Option<Arc<dyn ArtifactLookup>>,
    config: OperatorConfig,
    retry: RetryConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            artifacts: None,
            config: OperatorConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the requeue backoff parameters
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the artifact lookup (primarily for testing)
    pub fn artifact_lookup(mut self, artifacts: Arc<dyn ArtifactLookup>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let real = Arc::new(KubeClientImpl::new(self.client));
        let kube: Arc<dyn KubeClient> = match self.kube {
            Some(kube) => kube,
            None => real.clone(),
        };
        let artifacts: Arc<dyn ArtifactLookup> = match self.artifacts {
            Some(artifacts) => artifacts,
            None => real,
        };
        Context::new(kube, artifacts, self.config).with_retry(self.retry)
    }
}

fn record_key(kbs_config: &KbsConfig) -> String {
    format!(
        "{}/{}",
        kbs_config.namespace().unwrap_or_default(),
        kbs_config.name_any()
    )
}

/// Reconcile a KbsConfig resource
///
/// Returns [`Action::await_change`] on success: the controller is woken again
/// by changes to the record, its children, or ConfigMaps and Secrets in the
/// operator namespace. Failures are handed to [`error_policy`].
#[instrument(
    skip(kbs_config, ctx),
    fields(kbs_config = %kbs_config.name_any(), namespace = ?kbs_config.namespace())
)]
pub async fn reconcile(kbs_config: Arc<KbsConfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = kbs_config
        .namespace()
        .ok_or(Error::MissingObjectKey("namespace"))?;
    let name = kbs_config.name_any();
    let key = record_key(&kbs_config);
    info!("reconciling KbsConfig");

    let Some(current) = ctx.kube.get_kbs_config(&namespace, &name).await? else {
        info!("KbsConfig no longer exists");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    };

    if current.metadata.deletion_timestamp.is_some() {
        handle_deletion(&current, &namespace, &ctx).await?;
    } else {
        sync(&current, &namespace, &ctx).await?;
    }

    ctx.backoff.reset(&key);
    Ok(Action::await_change())
}

async fn handle_deletion(kbs_config: &KbsConfig, namespace: &str, ctx: &Context) -> Result<(), Error> {
    let finalizer = &ctx.config.finalizer;
    if !has_finalizer(kbs_config, finalizer) {
        debug!("KbsConfig marked for deletion without finalizer, nothing to do");
        return Ok(());
    }

    finalize(ctx.kube.as_ref(), namespace, &ctx.config).await?;

    info!("removing finalizer");
    ctx.kube
        .patch_finalizers(
            namespace,
            &kbs_config.name_any(),
            without_finalizer(kbs_config, finalizer),
        )
        .await
}

async fn sync(kbs_config: &KbsConfig, namespace: &str, ctx: &Context) -> Result<(), Error> {
    let volumes = compose(
        &kbs_config.spec,
        namespace,
        ctx.artifacts.as_ref(),
        &ctx.config,
    )
    .await?;

    let deployment = build_deployment(kbs_config, namespace, volumes, &ctx.config)?;
    reconcile_deployment(ctx.kube.as_ref(), &deployment).await?;

    let service = build_service(kbs_config, namespace, &ctx.config)?;
    reconcile_service(ctx.kube.as_ref(), &service).await?;

    let finalizer = &ctx.config.finalizer;
    if !has_finalizer(kbs_config, finalizer) {
        info!("adding finalizer");
        ctx.kube
            .patch_finalizers(
                namespace,
                &kbs_config.name_any(),
                with_finalizer(kbs_config, finalizer),
            )
            .await?;
    }

    Ok(())
}

/// Error policy for the controller
///
/// Logs the failure and requeues the record with exponential backoff. The
/// attempt counter is cleared by the next successful reconcile.
pub fn error_policy(kbs_config: Arc<KbsConfig>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = record_key(&kbs_config);
    let delay = ctx.backoff.next_delay(&key);
    error!(
        ?error,
        kbs_config = %key,
        attempt = ctx.backoff.attempts(&key),
        retry_in_ms = delay.as_millis() as u64,
        "reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DeploymentType, KbsConfigSpec};
    use crate::volumes::MockArtifactLookup;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mockall::Sequence;
    use std::sync::Mutex;

    const FINALIZER: &str = "kbsconfig.confidentialcontainers.org/finalizer";

    /// Create a sample KbsConfig for testing
    fn sample_kbs_config() -> KbsConfig {
        let mut kbs = KbsConfig::new(
            "kbsconfig-sample",
            KbsConfigSpec {
                kbs_config_map_name: Some("kbs-config-cm".to_string()),
                kbs_as_config_map_name: Some("as-config-cm".to_string()),
                kbs_rvps_config_map_name: Some("rvps-config-cm".to_string()),
                kbs_auth_secret_name: Some("kbs-auth-public-key".to_string()),
                ..Default::default()
            },
        );
        kbs.metadata.namespace = Some("trustee".to_string());
        kbs.metadata.uid = Some("0b1e6d4a-uid".to_string());
        kbs
    }

    fn with_finalizer_set(mut kbs: KbsConfig) -> KbsConfig {
        kbs.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        kbs
    }

    fn being_deleted(mut kbs: KbsConfig) -> KbsConfig {
        kbs.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        kbs
    }

    fn returns_record(kube: &mut MockKubeClient, kbs: KbsConfig) {
        kube.expect_get_kbs_config()
            .withf(|ns, name| ns == "trustee" && name == "kbsconfig-sample")
            .returning(move |_, _| Ok(Some(kbs.clone())));
    }

    fn all_artifacts_exist() -> Arc<MockArtifactLookup> {
        let mut lookup = MockArtifactLookup::new();
        lookup.expect_config_map_exists().returning(|_, _| Ok(true));
        lookup.expect_secret_exists().returning(|_, _| Ok(true));
        Arc::new(lookup)
    }

    fn no_lookups() -> Arc<MockArtifactLookup> {
        let mut lookup = MockArtifactLookup::new();
        lookup.expect_config_map_exists().never();
        lookup.expect_secret_exists().never();
        Arc::new(lookup)
    }

    fn context(kube: MockKubeClient, artifacts: Arc<MockArtifactLookup>) -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(kube), artifacts))
    }

    /// Captured writes for verification without coupling to call order.
    #[derive(Clone, Default)]
    struct WriteCapture {
        deployments: Arc<Mutex<Vec<Deployment>>>,
        services: Arc<Mutex<Vec<Service>>>,
        finalizers: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl WriteCapture {
        fn deployments(&self) -> Vec<Deployment> {
            self.deployments.lock().unwrap().clone()
        }

        fn services(&self) -> Vec<Service> {
            self.services.lock().unwrap().clone()
        }

        fn finalizers(&self) -> Vec<Vec<String>> {
            self.finalizers.lock().unwrap().clone()
        }
    }

    /// Mock cluster where the children do not exist yet
    fn fresh_cluster(kbs: KbsConfig) -> (MockKubeClient, WriteCapture) {
        let capture = WriteCapture::default();
        let mut kube = MockKubeClient::new();
        returns_record(&mut kube, kbs);

        kube.expect_get_deployment().returning(|_, _| Ok(None));
        kube.expect_get_service().returning(|_, _| Ok(None));

        let deployments = capture.deployments.clone();
        kube.expect_create_deployment().returning(move |d| {
            deployments.lock().unwrap().push(d.clone());
            Ok(())
        });
        let services = capture.services.clone();
        kube.expect_create_service().returning(move |s| {
            services.lock().unwrap().push(s.clone());
            Ok(())
        });
        let finalizers = capture.finalizers.clone();
        kube.expect_patch_finalizers().returning(move |_, _, f| {
            finalizers.lock().unwrap().push(f);
            Ok(())
        });
        kube.expect_update_deployment().never();
        kube.expect_update_service().never();

        (kube, capture)
    }

    mod sync_path {
        use super::*;

        #[tokio::test]
        async fn fresh_record_creates_children_and_attaches_finalizer() {
            let (kube, capture) = fresh_cluster(sample_kbs_config());
            let ctx = context(kube, all_artifacts_exist());

            let action = reconcile(Arc::new(sample_kbs_config()), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());

            let deployments = capture.deployments();
            assert_eq!(deployments.len(), 1);
            let pod = deployments[0]
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .unwrap();
            let containers: Vec<_> = pod.containers.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(containers, vec!["kbs", "as", "rvps"]);

            let services = capture.services();
            assert_eq!(services.len(), 1);
            assert_eq!(services[0].metadata.name.as_deref(), Some("kbs-service"));

            assert_eq!(capture.finalizers(), vec![vec![FINALIZER.to_string()]]);
        }

        #[tokio::test]
        async fn all_in_one_record_renders_single_container() {
            let mut kbs = sample_kbs_config();
            kbs.spec.kbs_deployment_type = Some(DeploymentType::AllInOne);
            let (kube, capture) = fresh_cluster(kbs.clone());
            let ctx = context(kube, all_artifacts_exist());

            reconcile(Arc::new(kbs), ctx).await.unwrap();

            let deployments = capture.deployments();
            let pod = deployments[0]
                .spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .unwrap();
            assert_eq!(pod.containers.len(), 1);
            assert!(pod
                .volumes
                .as_ref()
                .unwrap()
                .iter()
                .all(|v| v.name != "as-config" && v.name != "rvps-config"));
        }

        #[tokio::test]
        async fn existing_children_are_updated_and_finalizer_left_alone() {
            let kbs = with_finalizer_set(sample_kbs_config());
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs.clone());
            kube.expect_get_deployment()
                .returning(|_, _| Ok(Some(Deployment::default())));
            kube.expect_get_service()
                .returning(|_, _| Ok(Some(Service::default())));
            kube.expect_update_deployment().times(1).returning(|_| Ok(()));
            kube.expect_update_service().times(1).returning(|_| Ok(()));
            kube.expect_create_deployment().never();
            kube.expect_create_service().never();
            kube.expect_patch_finalizers().never();

            let ctx = context(kube, all_artifacts_exist());
            reconcile(Arc::new(kbs), ctx).await.unwrap();
        }

        #[tokio::test]
        async fn lone_https_key_fails_before_any_write() {
            let mut kbs = sample_kbs_config();
            kbs.spec.kbs_https_key_secret_name = Some("tls-key".to_string());

            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs.clone());
            kube.expect_get_deployment().never();
            kube.expect_create_deployment().never();
            kube.expect_create_service().never();
            kube.expect_patch_finalizers().never();

            let ctx = context(kube, no_lookups());
            let err = reconcile(Arc::new(kbs), ctx).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }

        #[tokio::test]
        async fn missing_artifact_aborts_before_the_deployment() {
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, sample_kbs_config());
            kube.expect_get_deployment().never();
            kube.expect_create_deployment().never();
            kube.expect_create_service().never();

            let mut lookup = MockArtifactLookup::new();
            lookup.expect_config_map_exists().returning(|_, _| Ok(false));

            let ctx = context(kube, Arc::new(lookup));
            let err = reconcile(Arc::new(sample_kbs_config()), ctx)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MissingArtifact { kind: "ConfigMap", .. }));
        }

        #[tokio::test]
        async fn service_failure_skips_finalizer() {
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, sample_kbs_config());
            kube.expect_get_deployment().returning(|_, _| Ok(None));
            kube.expect_create_deployment().returning(|_| Ok(()));
            kube.expect_get_service()
                .returning(|_, _| Err(Error::validation("api down")));
            kube.expect_patch_finalizers().never();

            let ctx = context(kube, all_artifacts_exist());
            assert!(reconcile(Arc::new(sample_kbs_config()), ctx).await.is_err());
        }
    }

    mod write_path {
        use super::*;

        fn pod_volumes(body: &serde_json::Value) -> Vec<String> {
            body["spec"]["template"]["spec"]["volumes"]
                .as_array()
                .map(|volumes| {
                    volumes
                        .iter()
                        .filter_map(|v| v["name"].as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        }

        fn pod_containers(body: &serde_json::Value) -> Vec<String> {
            body["spec"]["template"]["spec"]["containers"]
                .as_array()
                .map(|containers| {
                    containers
                        .iter()
                        .filter_map(|c| c["name"].as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default()
        }

        /// Mock cluster where both children already exist
        fn existing_cluster(kbs: KbsConfig) -> (MockKubeClient, WriteCapture) {
            let capture = WriteCapture::default();
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs);
            kube.expect_get_deployment()
                .returning(|_, _| Ok(Some(Deployment::default())));
            kube.expect_get_service()
                .returning(|_, _| Ok(Some(Service::default())));

            let deployments = capture.deployments.clone();
            kube.expect_update_deployment().returning(move |d| {
                deployments.lock().unwrap().push(d.clone());
                Ok(())
            });
            let services = capture.services.clone();
            kube.expect_update_service().returning(move |s| {
                services.lock().unwrap().push(s.clone());
                Ok(())
            });
            kube.expect_create_deployment().never();
            kube.expect_create_service().never();
            kube.expect_patch_finalizers().never();
            (kube, capture)
        }

        #[tokio::test]
        async fn create_and_update_share_one_forced_apply() {
            let (kube, created) = fresh_cluster(sample_kbs_config());
            reconcile(Arc::new(sample_kbs_config()), context(kube, all_artifacts_exist()))
                .await
                .unwrap();

            let kbs = with_finalizer_set(sample_kbs_config());
            let (kube, updated) = existing_cluster(kbs.clone());
            reconcile(Arc::new(kbs), context(kube, all_artifacts_exist()))
                .await
                .unwrap();

            let requests = [
                ApplyRequest::new(&created.deployments()[0]).unwrap(),
                ApplyRequest::new(&updated.deployments()[0]).unwrap(),
                ApplyRequest::new(&created.services()[0]).unwrap(),
                ApplyRequest::new(&updated.services()[0]).unwrap(),
            ];
            for request in &requests {
                assert_eq!(request.params.field_manager.as_deref(), Some(FIELD_MANAGER));
                assert!(request.params.force);
                assert_eq!(request.namespace, "trustee");
            }
            assert_eq!(requests[0].body["kind"], "Deployment");
            assert_eq!(requests[0].body["apiVersion"], "apps/v1");
            assert_eq!(requests[2].body["kind"], "Service");
            assert_eq!(requests[0].body, requests[1].body);
        }

        #[tokio::test]
        async fn update_carries_only_what_the_record_still_asks_for() {
            let mut kbs = with_finalizer_set(sample_kbs_config());
            kbs.spec.kbs_auth_secret_name = None;
            kbs.spec.kbs_deployment_type = Some(DeploymentType::AllInOne);
            let (kube, updated) = existing_cluster(kbs.clone());

            reconcile(Arc::new(kbs), context(kube, all_artifacts_exist()))
                .await
                .unwrap();

            let request = ApplyRequest::new(&updated.deployments()[0]).unwrap();
            assert_eq!(pod_containers(&request.body), vec!["kbs"]);
            let volumes = pod_volumes(&request.body);
            assert!(!volumes.contains(&"auth-secret".to_string()));
            assert!(!volumes.contains(&"as-config".to_string()));
            assert!(volumes.contains(&"kbs-config".to_string()));
        }

        #[test]
        fn apply_needs_a_name() {
            let service = Service {
                metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                    namespace: Some("trustee".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            assert!(matches!(
                ApplyRequest::new(&service),
                Err(Error::MissingObjectKey("name"))
            ));
        }
    }

    mod absence {
        use super::*;

        #[tokio::test]
        async fn vanished_record_is_success_without_writes() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_kbs_config().returning(|_, _| Ok(None));
            kube.expect_get_deployment().never();
            kube.expect_create_deployment().never();
            kube.expect_patch_finalizers().never();

            let ctx = context(kube, no_lookups());
            let action = reconcile(Arc::new(sample_kbs_config()), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }

        #[tokio::test]
        async fn fetch_errors_fail_the_reconcile() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_kbs_config()
                .returning(|_, _| Err(Error::validation("timeout")));

            let ctx = context(kube, no_lookups());
            assert!(reconcile(Arc::new(sample_kbs_config()), ctx).await.is_err());
        }
    }

    mod deletion {
        use super::*;

        #[tokio::test]
        async fn deployment_is_removed_before_finalizer() {
            let kbs = being_deleted(with_finalizer_set(sample_kbs_config()));
            let mut seq = Sequence::new();
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs.clone());
            kube.expect_get_deployment()
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(Some(Deployment::default())));
            kube.expect_delete_deployment()
                .withf(|ns, name| ns == "trustee" && name == "trustee-deployment")
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
            kube.expect_patch_finalizers()
                .withf(|_, _, finalizers| finalizers.is_empty())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _| Ok(()));
            kube.expect_create_deployment().never();

            let ctx = context(kube, no_lookups());
            reconcile(Arc::new(kbs), ctx).await.unwrap();
        }

        #[tokio::test]
        async fn failed_teardown_keeps_finalizer() {
            let kbs = being_deleted(with_finalizer_set(sample_kbs_config()));
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs.clone());
            kube.expect_get_deployment()
                .returning(|_, _| Ok(Some(Deployment::default())));
            kube.expect_delete_deployment()
                .returning(|_, _| Err(Error::validation("forbidden")));
            kube.expect_patch_finalizers().never();

            let ctx = context(kube, no_lookups());
            assert!(reconcile(Arc::new(kbs), ctx).await.is_err());
        }

        #[tokio::test]
        async fn absent_deployment_still_releases_the_record() {
            let kbs = being_deleted(with_finalizer_set(sample_kbs_config()));
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs.clone());
            kube.expect_get_deployment().returning(|_, _| Ok(None));
            kube.expect_delete_deployment().never();
            kube.expect_patch_finalizers()
                .times(1)
                .returning(|_, _, _| Ok(()));

            let ctx = context(kube, no_lookups());
            reconcile(Arc::new(kbs), ctx).await.unwrap();
        }

        #[tokio::test]
        async fn without_finalizer_deletion_is_a_no_op() {
            let kbs = being_deleted(sample_kbs_config());
            let mut kube = MockKubeClient::new();
            returns_record(&mut kube, kbs.clone());
            kube.expect_get_deployment().never();
            kube.expect_delete_deployment().never();
            kube.expect_patch_finalizers().never();

            let ctx = context(kube, no_lookups());
            let action = reconcile(Arc::new(kbs), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    mod backoff {
        use super::*;

        #[tokio::test]
        async fn failures_back_off_and_success_resets() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_kbs_config().returning(|_, _| Ok(None));
            let ctx = context(kube, no_lookups());
            let kbs = Arc::new(sample_kbs_config());
            let error = Error::validation("boom");

            error_policy(kbs.clone(), &error, ctx.clone());
            error_policy(kbs.clone(), &error, ctx.clone());
            assert_eq!(ctx.backoff.attempts("trustee/kbsconfig-sample"), 2);

            reconcile(kbs, ctx.clone()).await.unwrap();
            assert_eq!(ctx.backoff.attempts("trustee/kbsconfig-sample"), 0);
        }
    }
}
