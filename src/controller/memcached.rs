use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, ContainerPort, NodeAffinity,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PodSecurityContext, PodSpec, PodTemplateSpec, SeccompProfile,
    SecurityContext, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta, OwnerReference,
};
use kube::Resource;
use kube::ResourceExt;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::events::EventType;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::context::ReconciliationContext;
use super::error::{ReconcileError, is_not_found};
use super::events::{
    REASON_CREATED_RESOURCE, REASON_DELETING_STUCK_POD, REASON_SCALING_DOWN,
    REASON_SCALING_UP, REASON_UNHEALTHY,
};
use super::result::ReconcileResult;
use super::status::ConditionUpdate;
use crate::crd::memcached::MEMCACHED_LABEL;
use crate::crd::{
    ConditionStatus, ConditionType, DockerImage, ProgressState, VerboseLevel,
};
use crate::resources::{
    default_resources, generate_resource_requirements, memory_limit_bytes,
};

const IMAGE_ENV_VAR: &str = "MEMCACHED_IMAGE";
/// MiB held back from the container memory limit for process overhead.
const MEMORY_RESERVE_MIB: i64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScaleDirection {
    Up,
    Down,
}

/// Replicas currently declared on a deployment. The API server defaults an
/// unset field to 1, so an absent value must read as 1 or an externally
/// created deployment draws one spurious scale patch.
pub(crate) fn current_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

/// Which way the workload has to move, `None` when already converged.
pub(crate) fn scale_direction(
    current: i32,
    desired: i32,
) -> Option<ScaleDirection> {
    match current.cmp(&desired) {
        Ordering::Equal => None,
        Ordering::Less => Some(ScaleDirection::Up),
        Ordering::Greater => Some(ScaleDirection::Down),
    }
}

/// Resolve the image reference: explicit spec wins, then the environment
/// fallback. Memcached has no built-in default image.
pub(crate) fn image_for_memcached(
    image: &DockerImage,
    fallback: Option<&str>,
) -> Result<String, ReconcileError> {
    if image.name.is_empty() && image.tag.is_empty() {
        return fallback.map(str::to_string).ok_or(
            ReconcileError::MissingImage {
                variable: IMAGE_ENV_VAR,
            },
        );
    }
    if image.tag.is_empty() {
        Ok(format!("{}:latest", image.name))
    } else {
        Ok(format!("{}:{}", image.name, image.tag))
    }
}

pub(crate) fn labels_for_memcached(
    name: &str,
    image: &str,
) -> BTreeMap<String, String> {
    let version = image.split(':').nth(1).unwrap_or("latest");
    [
        ("app.kubernetes.io/name", "Memcached"),
        ("app.kubernetes.io/instance", name),
        ("app.kubernetes.io/version", version),
        ("app.kubernetes.io/part-of", "memcached-operator"),
        ("app.kubernetes.io/created-by", "controller-manager"),
        (MEMCACHED_LABEL, name),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Startup command for a memcached container. A zero memory limit omits the
/// flag entirely; small limits (< 128Mi) produce a non-positive value that is
/// passed through unchecked, matching the historical behavior.
pub(crate) fn build_command(
    verbose: VerboseLevel,
    mem_limit_bytes: i64,
) -> Vec<String> {
    let mut cmd: Vec<String> = ["memcached", "-o", "modern"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if mem_limit_bytes != 0 {
        let mem_limit = mem_limit_bytes / 1024 / 1024 - MEMORY_RESERVE_MIB;
        cmd.push(format!("--memory-limit={}", mem_limit));
    }

    match verbose {
        VerboseLevel::Disable => {
            debug!("memcached instance logging is disabled")
        }
        VerboseLevel::Enable => cmd.push("-v".to_string()),
        VerboseLevel::Moar => cmd.push("-vv".to_string()),
        VerboseLevel::Extreme => cmd.push("-vvv".to_string()),
    }

    cmd
}

pub(crate) fn node_affinity() -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(
                NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![
                            NodeSelectorRequirement {
                                key: "kubernetes.io/arch".to_string(),
                                operator: "In".to_string(),
                                values: Some(
                                    ["amd64", "arm64", "ppc64le", "s390x"]
                                        .iter()
                                        .map(|s| s.to_string())
                                        .collect(),
                                ),
                            },
                            NodeSelectorRequirement {
                                key: "kubernetes.io/os".to_string(),
                                operator: "In".to_string(),
                                values: Some(vec!["linux".to_string()]),
                            },
                        ]),
                        ..Default::default()
                    }],
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn container_security_context() -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(1001),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl ReconciliationContext {
    pub(crate) fn owner_references(&self) -> Option<Vec<OwnerReference>> {
        self.memcached.controller_owner_ref(&()).map(|r| vec![r])
    }

    fn deployment_for_memcached(&self) -> Result<Deployment, ReconcileError> {
        let spec = &self.memcached.spec;
        let image = image_for_memcached(
            &spec.image,
            self.config.memcached_image.as_deref(),
        )?;
        let labels = labels_for_memcached(&self.name, &image);
        let requirements = generate_resource_requirements(
            spec.resources.as_ref(),
            &default_resources(),
            "memcached",
        )?;
        let command =
            build_command(spec.verbose, memory_limit_bytes(&requirements));

        Ok(Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: self.owner_references(),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(spec.size),
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
                            name: "memcached".to_string(),
                            image: Some(image),
                            image_pull_policy: Some(
                                "IfNotPresent".to_string(),
                            ),
                            security_context: Some(
                                container_security_context(),
                            ),
                            ports: Some(vec![ContainerPort {
                                container_port: spec.container_port,
                                name: Some("memcached".to_string()),
                                ..Default::default()
                            }]),
                            command: Some(command),
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

    fn service_for_memcached(&self) -> Result<Service, ReconcileError> {
        let spec = &self.memcached.spec;
        let image = image_for_memcached(
            &spec.image,
            self.config.memcached_image.as_deref(),
        )?;
        let labels = labels_for_memcached(&self.name, &image);

        Ok(Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: self.owner_references(),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("memcached".to_string()),
                    port: spec.container_port,
                    ..Default::default()
                }]),
                selector: Some(labels),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Create the workload deployment when it does not exist yet; cache the
    /// observed one either way.
    pub(crate) async fn check_memcached_deployment_creation(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        let api = self.deployment_api();
        match api.get(&self.name).await {
            Ok(existing) => {
                self.deployment = Some(existing);
                Ok(ReconcileResult::Continue)
            }
            Err(e) if is_not_found(&e) => {
                info!("creating a new Deployment for the Memcached");
                self.set_operator_progress(ProgressState::Updating).await?;
                let deployment = self.deployment_for_memcached()?;
                let created =
                    api.create(&PostParams::default(), &deployment).await?;
                self.emit(
                    EventType::Normal,
                    REASON_CREATED_RESOURCE,
                    "Create",
                    format!("Created Deployment {}", self.name),
                )
                .await;
                self.deployment = Some(created);
                Ok(ReconcileResult::Continue)
            }
            Err(e) => {
                error!(error = %e, "could not locate Deployment for the Memcached");
                Err(e.into())
            }
        }
    }

    /// Same create-on-first-sight pattern for the network endpoint; only
    /// meaningful once a workload exists.
    pub(crate) async fn check_memcached_service_creation(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        if self.deployment.is_none() {
            return Ok(ReconcileResult::Continue);
        }

        let api = self.service_api();
        match api.get(&self.name).await {
            Ok(existing) => {
                self.service = Some(existing);
                Ok(ReconcileResult::Continue)
            }
            Err(e) if is_not_found(&e) => {
                info!("creating a new Service for the Memcached");
                self.set_operator_progress(ProgressState::Updating).await?;
                let service = self.service_for_memcached()?;
                let created =
                    api.create(&PostParams::default(), &service).await?;
                self.emit(
                    EventType::Normal,
                    REASON_CREATED_RESOURCE,
                    "Create",
                    format!("Created Service {}", self.name),
                )
                .await;
                self.service = Some(created);
                Ok(ReconcileResult::Continue)
            }
            Err(e) => {
                error!(error = %e, "could not locate Service for the Memcached");
                Err(e.into())
            }
        }
    }

    /// Converge the workload replica count, in both directions. Exactly one
    /// patch when the counts differ, none when they already match.
    pub(crate) async fn check_memcached_deployment_scaling(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        let Some(deployment) = self.deployment.clone() else {
            return Ok(ReconcileResult::Continue);
        };

        let desired = self.memcached.spec.size;
        let current = current_replicas(&deployment);

        let Some(direction) = scale_direction(current, desired) else {
            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            if ready == desired {
                self.clear_scaling_conditions().await?;
            }
            return Ok(ReconcileResult::Continue);
        };

        info!(
            current,
            desired, "need to update the memcached's replicas"
        );

        let (condition, reason, note) = match direction {
            ScaleDirection::Up => (
                ConditionType::ScalingUp,
                REASON_SCALING_UP,
                format!("Scaling up {}", self.name),
            ),
            ScaleDirection::Down => (
                ConditionType::ScalingDown,
                REASON_SCALING_DOWN,
                format!("Scaling down {}", self.name),
            ),
        };

        // Status first so observed-generation tracking stays sane, then the
        // single mutating write against the workload.
        self.upsert_conditions(&[(
            condition,
            ConditionStatus::True,
            "Scale",
            "replica count diverged from the declared size",
        )])
        .await?;
        self.emit(EventType::Normal, reason, "Scale", note).await;
        self.set_operator_progress(ProgressState::Updating).await?;

        let patch = json!({"spec": {"replicas": desired}});
        self.deployment_api()
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        if let Some(cached) =
            self.deployment.as_mut().and_then(|d| d.spec.as_mut())
        {
            cached.replicas = Some(desired);
        }

        Ok(ReconcileResult::Continue)
    }

    /// Flip any in-flight scaling markers back once the observed replicas
    /// match the declared size; this is what lets the deletion sub-machine
    /// see a completed decommission.
    async fn clear_scaling_conditions(&mut self) -> Result<(), ReconcileError> {
        let status = self.memcached.status_or_default();
        let mut updates: Vec<ConditionUpdate> = Vec::new();
        for type_ in [ConditionType::ScalingUp, ConditionType::ScalingDown] {
            if status.condition_status(type_) == ConditionStatus::True {
                updates.push((
                    type_,
                    ConditionStatus::False,
                    "ScaleSettled",
                    "observed replicas match the declared size",
                ));
            }
        }
        if updates.is_empty() {
            return Ok(());
        }
        self.upsert_conditions(&updates).await
    }

    /// Surface failed pods and reap at most one pod stuck terminating past
    /// the configured grace.
    pub(crate) async fn check_pod_health(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        let now = Utc::now();
        let grace = self.config.stuck_pod_grace();
        let mut reaped = false;

        for pod in &self.pods {
            let pod_name = pod.name_any();
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("");

            if phase == "Failed" {
                self.emit(
                    EventType::Warning,
                    REASON_UNHEALTHY,
                    "PodHealth",
                    format!("Pod {} is in a failed state", pod_name),
                )
                .await;
            }

            if reaped {
                continue;
            }
            if let Some(ts) = pod.metadata.deletion_timestamp.as_ref() {
                if now.signed_duration_since(ts.0) > grace {
                    warn!(pod = %pod_name, "pod stuck terminating; force deleting");
                    self.pod_api()
                        .delete(
                            &pod_name,
                            &DeleteParams::default().grace_period(0),
                        )
                        .await?;
                    self.emit(
                        EventType::Warning,
                        REASON_DELETING_STUCK_POD,
                        "PodHealth",
                        format!("Deleting stuck pod {}", pod_name),
                    )
                    .await;
                    reaped = true;
                }
            }
        }

        Ok(ReconcileResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_replicas_read_as_the_api_default_of_one() {
        assert_eq!(current_replicas(&Deployment::default()), 1);

        let mut deployment = Deployment::default();
        deployment.spec = Some(DeploymentSpec {
            replicas: Some(3),
            ..Default::default()
        });
        assert_eq!(current_replicas(&deployment), 3);
    }

    #[test]
    fn externally_created_singleton_needs_no_scale_patch() {
        let mut deployment = Deployment::default();
        deployment.spec = Some(DeploymentSpec::default());
        assert_eq!(
            scale_direction(current_replicas(&deployment), 1),
            None
        );
    }

    #[test]
    fn scale_direction_matches_ordering() {
        assert_eq!(scale_direction(2, 5), Some(ScaleDirection::Up));
        assert_eq!(scale_direction(5, 2), Some(ScaleDirection::Down));
        assert_eq!(scale_direction(2, 2), None);
    }

    #[test]
    fn verbosity_maps_to_repeated_flags() {
        let flags = |v| {
            build_command(v, 0)
                .into_iter()
                .filter(|a| a.starts_with("-v"))
                .collect::<Vec<_>>()
        };
        assert!(flags(VerboseLevel::Disable).is_empty());
        assert_eq!(flags(VerboseLevel::Enable), ["-v"]);
        assert_eq!(flags(VerboseLevel::Moar), ["-vv"]);
        assert_eq!(flags(VerboseLevel::Extreme), ["-vvv"]);
    }

    #[test]
    fn command_always_starts_with_fixed_prefix() {
        let cmd = build_command(VerboseLevel::Disable, 0);
        assert_eq!(cmd, ["memcached", "-o", "modern"]);
    }

    #[test]
    fn one_gib_limit_leaves_896_mib_for_the_cache() {
        let cmd =
            build_command(VerboseLevel::Disable, 1024 * 1024 * 1024);
        assert!(cmd.contains(&"--memory-limit=896".to_string()));
    }

    #[test]
    fn zero_limit_omits_the_memory_flag() {
        let cmd = build_command(VerboseLevel::Enable, 0);
        assert!(!cmd.iter().any(|a| a.starts_with("--memory-limit")));
    }

    #[test]
    fn tiny_limit_goes_negative_untouched() {
        // Known latent behavior: limits under the 128Mi reserve produce a
        // nonsensical value and are deliberately not clamped here.
        let cmd = build_command(VerboseLevel::Disable, 64 * 1024 * 1024);
        assert!(cmd.contains(&"--memory-limit=-64".to_string()));
    }

    #[test]
    fn image_prefers_spec_then_fallback() {
        let explicit = DockerImage {
            name: "memcached".into(),
            tag: "1.6.23-alpine".into(),
        };
        assert_eq!(
            image_for_memcached(&explicit, None).unwrap(),
            "memcached:1.6.23-alpine"
        );

        let name_only = DockerImage {
            name: "memcached".into(),
            tag: String::new(),
        };
        assert_eq!(
            image_for_memcached(&name_only, None).unwrap(),
            "memcached:latest"
        );

        let empty = DockerImage::default();
        assert_eq!(
            image_for_memcached(&empty, Some("memcached:1.6")).unwrap(),
            "memcached:1.6"
        );
        assert!(matches!(
            image_for_memcached(&empty, None),
            Err(ReconcileError::MissingImage { .. })
        ));
    }

    #[test]
    fn labels_carry_instance_and_version() {
        let labels = labels_for_memcached("cache-a", "memcached:1.6.23");
        assert_eq!(labels["app.kubernetes.io/instance"], "cache-a");
        assert_eq!(labels["app.kubernetes.io/version"], "1.6.23");
        assert_eq!(labels[MEMCACHED_LABEL], "cache-a");
    }
}
