use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{error, info, instrument, warn};

mod context;
mod error;
mod events;
mod finalize;
mod memcached;
mod proxy;
mod result;
mod status;

pub use context::ReconciliationContext;
pub use error::ReconcileError;
pub use events::{EventSink, KubeEventSink, LoggingRecorder};
pub use finalize::{DeletionDisposition, evaluate_deletion};
pub use result::ReconcileResult;

use events::REASON_RECONCILE_FAILED;

use crate::config::OperatorConfig;
use crate::crd::Memcached;

/// Long-lived state shared by every reconcile invocation.
pub struct ControllerContext {
    pub client: Client,
    pub config: OperatorConfig,
    pub events: Arc<dyn EventSink>,
}

/// Watch Memcached entities and their owned children until shutdown.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
) -> anyhow::Result<()> {
    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        config,
        events: Arc::new(KubeEventSink::new(client.clone())),
    });

    let memcacheds: Api<Memcached> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client);

    info!("starting memcached controller");
    Controller::new(memcacheds, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(services, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => {
                    info!(object = %obj.name, "reconciled")
                }
                Err(e) => warn!(error = %e, "reconciliation failed"),
            }
        })
        .await;
    info!("controller stream terminated");
    Ok(())
}

#[instrument(skip(obj, ctx), fields(namespace = %obj.namespace().unwrap_or_default(), name = %obj.name_any()))]
async fn reconcile(
    obj: Arc<Memcached>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let started = Instant::now();
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();

    // Load fresh rather than trusting the watch cache; a stale status here
    // would replay decisions that already happened.
    let mut rcx =
        match ReconciliationContext::new(&ctx, &namespace, &name).await {
            Ok(rcx) => rcx,
            Err(e) if e.is_not_found() => {
                info!("entity already gone; nothing to reconcile");
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        };

    let result = rcx.calculate_reconciliation_actions().await;
    if let ReconcileResult::Error(e) = &result {
        error!(error = %e, "reconciliation pass failed");
        rcx.emit(
            EventType::Warning,
            REASON_RECONCILE_FAILED,
            "Reconcile",
            format!("Reconciliation of {} failed: {}", name, e),
        )
        .await;
    }

    let action = result.into_action(&rcx.config);
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "pass complete");
    action
}

fn error_policy(
    _obj: Arc<Memcached>,
    _err: &ReconcileError,
    _ctx: Arc<ControllerContext>,
) -> Action {
    Action::requeue(Duration::from_secs(60))
}
