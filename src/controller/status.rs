use chrono::Utc;
use kube::api::{Patch, PatchParams};
use serde_json::json;
use tracing::{debug, trace};

use super::context::ReconciliationContext;
use super::error::ReconcileError;
use crate::crd::{
    ConditionStatus, ConditionType, MemcachedCondition, MemcachedStatus,
    ProgressState,
};

pub(crate) type ConditionUpdate =
    (ConditionType, ConditionStatus, &'static str, &'static str);

/// Apply condition updates to a list, returning whether anything material
/// changed. Timestamps are only touched on material change, so repeated
/// passes do not churn the status.
pub(crate) fn apply_condition_updates(
    conditions: &mut Vec<MemcachedCondition>,
    updates: &[ConditionUpdate],
    now: &str,
) -> bool {
    let mut changed = false;
    for (type_, status, reason, message) in updates {
        match conditions.iter_mut().find(|c| c.type_ == *type_) {
            Some(existing) => {
                if existing.status != *status
                    || existing.reason.as_deref() != Some(reason)
                    || existing.message.as_deref() != Some(message)
                {
                    existing.status = *status;
                    existing.reason = Some((*reason).to_string());
                    existing.message = Some((*message).to_string());
                    existing.last_transition_time = Some(now.to_string());
                    changed = true;
                }
            }
            None => {
                conditions.push(MemcachedCondition {
                    type_: *type_,
                    status: *status,
                    reason: Some((*reason).to_string()),
                    message: Some((*message).to_string()),
                    last_transition_time: Some(now.to_string()),
                });
                changed = true;
            }
        }
    }
    changed
}

/// Next status for a progress move, `None` when no write is warranted: the
/// store already holds the requested value, or the entity is deleting and
/// would otherwise report `Ready` mid-decommission. Reaching `Ready` stamps
/// the observed generation.
pub(crate) fn next_status_for_progress(
    current: &MemcachedStatus,
    new_state: ProgressState,
    deleting: bool,
    generation: Option<i64>,
) -> Option<MemcachedStatus> {
    if deleting && new_state == ProgressState::Ready {
        return None;
    }
    if current.operator_progress == Some(new_state) {
        return None;
    }
    let mut status = current.clone();
    status.operator_progress = Some(new_state);
    if new_state == ProgressState::Ready {
        status.observed_generation = generation;
    }
    Some(status)
}

impl ReconciliationContext {
    /// Move the coarse progress state, skipping the write entirely when no
    /// transition is warranted.
    pub(crate) async fn set_operator_progress(
        &mut self,
        new_state: ProgressState,
    ) -> Result<(), ReconcileError> {
        let Some(status) = next_status_for_progress(
            &self.memcached.status_or_default(),
            new_state,
            self.memcached.is_deleting(),
            self.memcached.metadata.generation,
        ) else {
            trace!(?new_state, "operator progress unchanged; skipping patch");
            return Ok(());
        };

        debug!(?new_state, "setting operator progress");
        self.patch_status(status).await
    }

    /// Upsert conditions, patching the status subresource only when the set
    /// materially changes.
    pub(crate) async fn upsert_conditions(
        &mut self,
        updates: &[ConditionUpdate],
    ) -> Result<(), ReconcileError> {
        let status = self.memcached.status_or_default();
        let mut conditions = status.conditions.clone().unwrap_or_default();
        let now = Utc::now().to_rfc3339();

        if !apply_condition_updates(&mut conditions, updates, &now) {
            trace!("conditions unchanged; skipping patch");
            return Ok(());
        }

        let mut status = status;
        status.conditions = Some(conditions);
        self.patch_status(status).await
    }

    /// Patch only the status subresource so concurrent spec edits are never
    /// clobbered, then adopt the server's response so later writes in the
    /// same pass carry a fresh resourceVersion. The local spec is left
    /// untouched; the deletion path forces a zero size that the store never
    /// sees.
    async fn patch_status(
        &mut self,
        status: MemcachedStatus,
    ) -> Result<(), ReconcileError> {
        let patch = json!({ "status": &status });
        let updated = self
            .memcached_api()
            .patch_status(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        self.memcached.metadata.resource_version =
            updated.metadata.resource_version;
        self.memcached.status = updated.status.or(Some(status));
        Ok(())
    }
}
