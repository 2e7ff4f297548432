use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use serde_json::json;
use tracing::{error, info};

use super::context::ReconciliationContext;
use super::error::{ReconcileError, is_not_found};
use super::events::{
    REASON_CREATED_RESOURCE, REASON_SCALING_DOWN, REASON_SCALING_UP,
};
use super::memcached::{
    ScaleDirection, container_security_context, current_replicas,
    node_affinity, pod_security_context, scale_direction,
};
use super::result::ReconcileResult;
use crate::crd::memcached::PROXY_DEFAULT_IMAGE;
use crate::crd::{DockerImage, ProgressState, ProxySpec};
use crate::resources::{default_resources, generate_resource_requirements};

/// Sharding-proxy tier. Optional; every check here is a no-op unless the
/// entity declares a proxy section.

pub(crate) fn proxy_name(name: &str) -> String {
    format!("{}-proxy", name)
}

/// Proxy image resolution never fails: explicit spec, then the environment,
/// then a pinned default.
pub(crate) fn image_for_proxy(
    image: &DockerImage,
    fallback: Option<&str>,
) -> String {
    if image.name.is_empty() && image.tag.is_empty() {
        return fallback.unwrap_or(PROXY_DEFAULT_IMAGE).to_string();
    }
    if image.tag.is_empty() {
        format!("{}:latest", image.name)
    } else {
        format!("{}:{}", image.name, image.tag)
    }
}

pub(crate) fn labels_for_proxy(
    name: &str,
    image: &str,
) -> BTreeMap<String, String> {
    let version = image.split(':').nth(1).unwrap_or("latest");
    let instance = proxy_name(name);
    [
        ("app.kubernetes.io/name", "Memcached-Proxy"),
        ("app.kubernetes.io/instance", instance.as_str()),
        ("app.kubernetes.io/version", version),
        ("app.kubernetes.io/part-of", "memcached-operator"),
        ("app.kubernetes.io/created-by", "controller-manager"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Fixed proxy command; the config file is expected to be mounted by the
/// image at this path.
pub(crate) fn proxy_command() -> Vec<String> {
    ["nutcracker", "-c", "/etc/config/twem-config.yaml", "-v", "7"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl ReconciliationContext {
    fn deployment_for_proxy(
        &self,
        proxy: &ProxySpec,
    ) -> Result<Deployment, ReconcileError> {
        let image =
            image_for_proxy(&proxy.image, self.config.proxy_image.as_deref());
        let labels = labels_for_proxy(&self.name, &image);
        let requirements = generate_resource_requirements(
            proxy.resources.as_ref(),
            &default_resources(),
            "proxy",
        )?;

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(proxy_name(&self.name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: self.owner_references(),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(proxy.replicas),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        affinity: Some(node_affinity()),
                        security_context: Some(pod_security_context()),
                        containers: vec![Container {
                            name: "proxy".to_string(),
                            image: Some(image),
                            image_pull_policy: Some(
                                "IfNotPresent".to_string(),
                            ),
                            security_context: Some(
                                container_security_context(),
                            ),
                            ports: Some(vec![ContainerPort {
                                container_port: proxy.listen_port(),
                                name: Some("proxy".to_string()),
                                ..Default::default()
                            }]),
                            command: Some(proxy_command()),
                            resources: Some(requirements),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn service_for_proxy(&self, proxy: &ProxySpec) -> Service {
        let image =
            image_for_proxy(&proxy.image, self.config.proxy_image.as_deref());
        let labels = labels_for_proxy(&self.name, &image);

        Service {
            metadata: ObjectMeta {
                name: Some(proxy_name(&self.name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: self.owner_references(),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("proxy".to_string()),
                    port: proxy.listen_port(),
                    ..Default::default()
                }]),
                selector: Some(labels),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) async fn check_proxy_deployment_creation(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        let Some(proxy) = self.memcached.spec.proxy.clone() else {
            return Ok(ReconcileResult::Continue);
        };

        let name = proxy_name(&self.name);
        let api = self.deployment_api();
        match api.get(&name).await {
            Ok(existing) => {
                self.proxy_deployment = Some(existing);
                Ok(ReconcileResult::Continue)
            }
            Err(e) if is_not_found(&e) => {
                info!("creating a new Deployment for the proxy");
                self.set_operator_progress(ProgressState::Updating).await?;
                let deployment = self.deployment_for_proxy(&proxy)?;
                let created =
                    api.create(&PostParams::default(), &deployment).await?;
                self.emit(
                    EventType::Normal,
                    REASON_CREATED_RESOURCE,
                    "Create",
                    format!("Created Deployment {}", name),
                )
                .await;
                self.proxy_deployment = Some(created);
                Ok(ReconcileResult::Continue)
            }
            Err(e) => {
                error!(error = %e, "could not locate Deployment for the proxy");
                Err(e.into())
            }
        }
    }

    pub(crate) async fn check_proxy_service_creation(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        let Some(proxy) = self.memcached.spec.proxy.clone() else {
            return Ok(ReconcileResult::Continue);
        };
        if self.proxy_deployment.is_none() {
            return Ok(ReconcileResult::Continue);
        }

        let name = proxy_name(&self.name);
        let api = self.service_api();
        match api.get(&name).await {
            Ok(existing) => {
                self.proxy_service = Some(existing);
                Ok(ReconcileResult::Continue)
            }
            Err(e) if is_not_found(&e) => {
                info!("creating a new Service for the proxy");
                self.set_operator_progress(ProgressState::Updating).await?;
                let service = self.service_for_proxy(&proxy);
                let created =
                    api.create(&PostParams::default(), &service).await?;
                self.emit(
                    EventType::Normal,
                    REASON_CREATED_RESOURCE,
                    "Create",
                    format!("Created Service {}", name),
                )
                .await;
                self.proxy_service = Some(created);
                Ok(ReconcileResult::Continue)
            }
            Err(e) => {
                error!(error = %e, "could not locate Service for the proxy");
                Err(e.into())
            }
        }
    }

    /// Converge the proxy replica count toward the proxy's own declared
    /// replicas. No conditions are tracked for the proxy tier; the event
    /// stream is the only trace.
    pub(crate) async fn check_proxy_deployment_scaling(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        let Some(proxy) = self.memcached.spec.proxy.clone() else {
            return Ok(ReconcileResult::Continue);
        };
        let Some(deployment) = self.proxy_deployment.clone() else {
            return Ok(ReconcileResult::Continue);
        };

        let desired = proxy.replicas;
        let current = current_replicas(&deployment);
        let Some(direction) = scale_direction(current, desired) else {
            return Ok(ReconcileResult::Continue);
        };

        let name = proxy_name(&self.name);
        info!(current, desired, "need to update the proxy's replicas");

        let (reason, note) = match direction {
            ScaleDirection::Up => {
                (REASON_SCALING_UP, format!("Scaling up {}", name))
            }
            ScaleDirection::Down => {
                (REASON_SCALING_DOWN, format!("Scaling down {}", name))
            }
        };
        self.emit(EventType::Normal, reason, "Scale", note).await;
        self.set_operator_progress(ProgressState::Updating).await?;

        let patch = json!({"spec": {"replicas": desired}});
        self.deployment_api()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        if let Some(cached) =
            self.proxy_deployment.as_mut().and_then(|d| d.spec.as_mut())
        {
            cached.replicas = Some(desired);
        }

        Ok(ReconcileResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_name_is_suffixed() {
        assert_eq!(proxy_name("cache-a"), "cache-a-proxy");
    }

    #[test]
    fn proxy_image_falls_back_to_pinned_default() {
        let empty = DockerImage::default();
        assert_eq!(image_for_proxy(&empty, None), PROXY_DEFAULT_IMAGE);
        assert_eq!(
            image_for_proxy(&empty, Some("twemproxy:0.6")),
            "twemproxy:0.6"
        );
        let explicit = DockerImage {
            name: "twemproxy".into(),
            tag: "0.5.0-custom".into(),
        };
        assert_eq!(
            image_for_proxy(&explicit, Some("ignored:1")),
            "twemproxy:0.5.0-custom"
        );
    }

    #[test]
    fn proxy_labels_use_the_suffixed_instance() {
        let labels = labels_for_proxy("cache-a", "twemproxy:0.5.0");
        assert_eq!(labels["app.kubernetes.io/name"], "Memcached-Proxy");
        assert_eq!(labels["app.kubernetes.io/instance"], "cache-a-proxy");
        assert_eq!(labels["app.kubernetes.io/version"], "0.5.0");
    }

    #[test]
    fn proxy_command_is_fixed() {
        assert_eq!(
            proxy_command(),
            ["nutcracker", "-c", "/etc/config/twem-config.yaml", "-v", "7"]
        );
    }
}
