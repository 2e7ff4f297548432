use kube::api::{Patch, PatchParams};
use kube::runtime::events::EventType;
use serde_json::json;
use tracing::{debug, info};

use super::context::ReconciliationContext;
use super::error::ReconcileError;
use super::events::REASON_DECOMMISSIONING;
use super::result::ReconcileResult;
use crate::crd::memcached::FINALIZER;
use crate::crd::{ConditionStatus, ConditionType, Memcached, ProgressState};

/// Where the entity sits in its deletion lifecycle. Pure over the loaded
/// entity so every state is unit-testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionDisposition {
    /// No deletion timestamp; normal convergence applies.
    NotDeleting,
    /// Deleting but our finalizer is gone; nothing left for us to do.
    FinalizerGone,
    /// First deletion pass: mark decommission and start the scale to zero.
    BeginDecommission,
    /// Scale-down still in flight; keep the finalizer and wait.
    AwaitScaleDown,
    /// Scale-down observed complete; release the entity.
    Finalize,
}

pub fn evaluate_deletion(memcached: &Memcached) -> DeletionDisposition {
    if !memcached.is_deleting() {
        return DeletionDisposition::NotDeleting;
    }
    if !memcached.has_finalizer() {
        return DeletionDisposition::FinalizerGone;
    }
    let status = memcached.status_or_default();
    if status.condition_status(ConditionType::Decommission)
        != ConditionStatus::True
    {
        return DeletionDisposition::BeginDecommission;
    }
    if status.condition_status(ConditionType::ScalingDown)
        == ConditionStatus::True
    {
        return DeletionDisposition::AwaitScaleDown;
    }
    DeletionDisposition::Finalize
}

/// Finalizer list with our entry stripped; `None` when nothing remains, so a
/// merge patch clears the field outright. Foreign finalizers survive.
pub(crate) fn remaining_finalizers(
    memcached: &Memcached,
) -> Option<Vec<String>> {
    let rest: Vec<String> = memcached
        .metadata
        .finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != FINALIZER)
        .collect();
    if rest.is_empty() { None } else { Some(rest) }
}

impl ReconciliationContext {
    /// Deletion sub-machine. Runs before the pipeline every pass; guarantees
    /// the workload is scaled to zero and observed down before the finalizer
    /// is removed, so no child resources outlive their owner's removal.
    pub(crate) async fn process_deletion(
        &mut self,
    ) -> Result<ReconcileResult, ReconcileError> {
        match evaluate_deletion(&self.memcached) {
            DeletionDisposition::NotDeleting => Ok(ReconcileResult::Continue),
            DeletionDisposition::FinalizerGone => Ok(ReconcileResult::Done),
            DeletionDisposition::BeginDecommission => {
                info!("deletion timestamp detected; starting decommission");
                self.set_operator_progress(ProgressState::Updating).await?;
                self.upsert_conditions(&[
                    (
                        ConditionType::Decommission,
                        ConditionStatus::True,
                        "Deleting",
                        "scale to zero before removal",
                    ),
                    (
                        ConditionType::ScalingDown,
                        ConditionStatus::True,
                        "Decommission",
                        "waiting for the workload to reach zero replicas",
                    ),
                ])
                .await?;
                // Force the target to zero for this pass only; the pipeline
                // scales the workload down with it.
                self.memcached.spec.size = 0;
                Ok(ReconcileResult::Continue)
            }
            DeletionDisposition::AwaitScaleDown => {
                self.set_operator_progress(ProgressState::Updating).await?;
                self.memcached.spec.size = 0;
                self.emit(
                    EventType::Normal,
                    REASON_DECOMMISSIONING,
                    "Decommission",
                    format!("Memcached {} is decommissioning", self.name),
                )
                .await;
                debug!(
                    "waiting for the decommission to complete first, before deleting"
                );
                Ok(ReconcileResult::Continue)
            }
            DeletionDisposition::Finalize => {
                info!("decommission complete; removing finalizer");
                self.set_operator_progress(ProgressState::Updating).await?;
                // A merge patch strips only our finalizer entry, so foreign
                // finalizers and concurrent writers are unaffected and no
                // resourceVersion precondition applies.
                let finalizers = remaining_finalizers(&self.memcached);
                let patch =
                    json!({"metadata": {"finalizers": finalizers.clone()}});
                self.memcached_api()
                    .patch(
                        &self.name,
                        &PatchParams::default(),
                        &Patch::Merge(&patch),
                    )
                    .await?;
                self.memcached.metadata.finalizers = finalizers;
                Ok(ReconcileResult::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::memcached::FINALIZER;
    use crate::crd::{MemcachedCondition, MemcachedSpec, MemcachedStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn entity() -> Memcached {
        Memcached::new(
            "cache-a",
            MemcachedSpec {
                size: 3,
                container_port: 11211,
                image: Default::default(),
                verbose: Default::default(),
                resources: None,
                proxy: None,
            },
        )
    }

    fn deleting(mut m: Memcached) -> Memcached {
        m.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        m
    }

    fn finalized(mut m: Memcached) -> Memcached {
        m.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        m
    }

    fn with_condition(
        mut m: Memcached,
        type_: ConditionType,
        status: ConditionStatus,
    ) -> Memcached {
        let mut st = m.status.take().unwrap_or_else(MemcachedStatus::default);
        st.conditions.get_or_insert_with(Vec::new).push(
            MemcachedCondition {
                type_,
                status,
                reason: None,
                message: None,
                last_transition_time: None,
            },
        );
        m.status = Some(st);
        m
    }

    #[test]
    fn live_entity_is_not_deleting() {
        assert_eq!(
            evaluate_deletion(&entity()),
            DeletionDisposition::NotDeleting
        );
    }

    #[test]
    fn deleting_without_finalizer_is_terminal() {
        assert_eq!(
            evaluate_deletion(&deleting(entity())),
            DeletionDisposition::FinalizerGone
        );
    }

    #[test]
    fn first_deletion_pass_begins_decommission() {
        let m = deleting(finalized(entity()));
        assert_eq!(
            evaluate_deletion(&m),
            DeletionDisposition::BeginDecommission
        );
    }

    #[test]
    fn waits_while_scale_down_is_in_flight() {
        let m = with_condition(
            with_condition(
                deleting(finalized(entity())),
                ConditionType::Decommission,
                ConditionStatus::True,
            ),
            ConditionType::ScalingDown,
            ConditionStatus::True,
        );
        assert_eq!(
            evaluate_deletion(&m),
            DeletionDisposition::AwaitScaleDown
        );
    }

    #[test]
    fn release_strips_only_our_finalizer() {
        let mine = finalized(entity());
        assert_eq!(remaining_finalizers(&mine), None);

        let mut shared = finalized(entity());
        shared
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push("other.io/cleanup".to_string());
        assert_eq!(
            remaining_finalizers(&shared),
            Some(vec!["other.io/cleanup".to_string()])
        );
    }

    #[test]
    fn finalizes_once_scale_down_settled() {
        let m = with_condition(
            with_condition(
                deleting(finalized(entity())),
                ConditionType::Decommission,
                ConditionStatus::True,
            ),
            ConditionType::ScalingDown,
            ConditionStatus::False,
        );
        assert_eq!(evaluate_deletion(&m), DeletionDisposition::Finalize);
    }
}
