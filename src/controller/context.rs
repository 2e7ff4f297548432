use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::ControllerContext;
use super::error::ReconcileError;
use super::events::{EventSink, LoggingRecorder, build_obj_ref};
use super::result::ReconcileResult;
use crate::config::OperatorConfig;
use crate::crd::memcached::{FINALIZER, MEMCACHED_LABEL};
use crate::crd::{Memcached, ProgressState};

/// Per-invocation state: the freshly loaded entity, the wrapped event
/// recorder and caches of the observed children, populated lazily as the
/// pipeline steps first need them.
pub struct ReconciliationContext {
    pub client: Client,
    pub config: OperatorConfig,
    pub recorder: LoggingRecorder,
    pub memcached: Memcached,
    pub namespace: String,
    pub name: String,
    pub pods: Vec<Pod>,

    pub(crate) deployment: Option<Deployment>,
    pub(crate) service: Option<Service>,
    pub(crate) proxy_deployment: Option<Deployment>,
    pub(crate) proxy_service: Option<Service>,
}

impl ReconciliationContext {
    /// Load the entity and its observed pods. A kube 404 propagates so the
    /// caller can distinguish "already deleted" from real failures.
    pub async fn new(
        ctx: &ControllerContext,
        namespace: &str,
        name: &str,
    ) -> Result<Self, ReconcileError> {
        debug!("building reconciliation context");

        let api: Api<Memcached> =
            Api::namespaced(ctx.client.clone(), namespace);
        let memcached = api.get(name).await?;

        let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
        let selector = format!("{}={}", MEMCACHED_LABEL, name);
        let pods = pod_api
            .list(&ListParams::default().labels(&selector))
            .await
            .map(|l| l.items)
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "error listing managed pods");
                Vec::new()
            });

        Ok(ReconciliationContext {
            client: ctx.client.clone(),
            config: ctx.config.clone(),
            recorder: LoggingRecorder::new(ctx.events.clone()),
            memcached,
            namespace: namespace.to_string(),
            name: name.to_string(),
            pods,
            deployment: None,
            service: None,
            proxy_deployment: None,
            proxy_service: None,
        })
    }

    pub(crate) fn memcached_api(&self) -> Api<Memcached> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn deployment_api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn service_api(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub(crate) fn pod_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Publish an audit event about the entity, best effort.
    pub(crate) async fn emit(
        &self,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let reference = build_obj_ref(
            &self.namespace,
            &self.name,
            self.memcached.uid().as_deref(),
        );
        let _ = self
            .recorder
            .publish(
                Event {
                    type_,
                    reason: reason.into(),
                    note: Some(note),
                    action: action.into(),
                    secondary: None,
                },
                &reference,
            )
            .await;
    }

    /// Entry point for one pass: deletion sub-machine first, then the
    /// finalizer ensure, then the convergence pipeline.
    pub async fn calculate_reconciliation_actions(
        &mut self,
    ) -> ReconcileResult {
        let result = ReconcileResult::from(self.process_deletion().await);
        if result.completed() {
            return result;
        }

        if let Err(e) = self.ensure_finalizer().await {
            return ReconcileResult::Error(e);
        }

        self.process_reconcile().await
    }

    /// Ordered idempotent checks; stop at the first non-Continue result.
    pub(crate) async fn process_reconcile(&mut self) -> ReconcileResult {
        let result = ReconcileResult::from(
            self.check_memcached_deployment_creation().await,
        );
        if result.completed() {
            return result;
        }

        let result = ReconcileResult::from(
            self.check_memcached_service_creation().await,
        );
        if result.completed() {
            return result;
        }

        let result = ReconcileResult::from(
            self.check_memcached_deployment_scaling().await,
        );
        if result.completed() {
            return result;
        }

        let result = ReconcileResult::from(self.check_pod_health().await);
        if result.completed() {
            return result;
        }

        let result =
            ReconcileResult::from(self.check_proxy_deployment_creation().await);
        if result.completed() {
            return result;
        }

        let result =
            ReconcileResult::from(self.check_proxy_service_creation().await);
        if result.completed() {
            return result;
        }

        let result =
            ReconcileResult::from(self.check_proxy_deployment_scaling().await);
        if result.completed() {
            return result;
        }

        if let Err(e) = self.set_operator_progress(ProgressState::Ready).await {
            return ReconcileResult::Error(e);
        }

        info!("all children reconciled");
        ReconcileResult::Done
    }

    /// Attach the finalizer marker once, unless the entity opted out or is
    /// already on its way out. At most one mutating write.
    pub(crate) async fn ensure_finalizer(
        &mut self,
    ) -> Result<(), ReconcileError> {
        if self.memcached.finalizer_opt_out() {
            return Ok(());
        }
        if self.memcached.has_finalizer() || self.memcached.is_deleting() {
            return Ok(());
        }

        info!("adding finalizer for the Memcached");
        let mut finalizers =
            self.memcached.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        let patch = json!({"metadata": {"finalizers": finalizers.clone()}});
        self.memcached_api()
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        self.memcached.metadata.finalizers = Some(finalizers);
        Ok(())
    }
}
