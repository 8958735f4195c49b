//! # Deletion
//!
//! Tears the release down before the finalizer is released. The finalizer
//! is only removed once the backend confirms every release the record may
//! own is gone: the one recorded by the last successful deploy and the one
//! the current spec names, when they differ.

use super::deploy::fail;
use crate::backend::{BackendError, BundleRef, ObservedRelease};
use crate::controller::reconciler::status::{publish_event, set_phase};
use crate::controller::reconciler::types::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::controller::reconciler::validation::validate_helm_release;
use crate::crd::{HelmRelease, Phase, CONDITION_READY};
use crate::observability;
use crate::store::ReleaseEvent;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

pub(super) async fn finalize(
    ctx: &Reconciler,
    hr: HelmRelease,
) -> Result<ReconcileOutcome, ReconcilerError> {
    if !hr.has_finalizer() {
        debug!("{} is being deleted and carries no finalizer", hr.release_name());
        return Ok(ReconcileOutcome::Done);
    }

    let hr = if failed_while_deleting(&hr) {
        debug!("Retrying teardown of {} without leaving Failed", hr.release_name());
        hr
    } else {
        set_phase(
            ctx,
            &hr,
            Phase::Uninstalling,
            "Uninstalling",
            format!("Uninstalling release {}", hr.release_name()),
        )
        .await?
    };

    let deployed = BundleRef::deployed(&hr);
    let current = BundleRef::from_release(&hr);
    let mut targets: Vec<BundleRef> = deployed.into_iter().collect();

    match validate_helm_release(&hr) {
        Ok(()) => {
            if !targets.iter().any(|t| t.same_release(&current)) {
                targets.push(current);
            }
        }
        Err(e) => {
            let never_deployed = hr.status.as_ref().is_none_or(|s| s.helm_revision.is_none());
            if never_deployed {
                // Nothing can exist for a spec that never passed validation
                info!("Skipping uninstall of never-deployed invalid release: {}", e);
                return release_finalizer(ctx, &hr, "Nothing to uninstall").await;
            }
            if targets.is_empty() {
                warn!("Spec of {} is invalid, attempting uninstall anyway: {}", hr.release_name(), e);
                targets.push(current);
            } else {
                warn!("Spec of {} is invalid, uninstalling the deployed release only: {}", hr.release_name(), e);
            }
        }
    }

    for bundle in &targets {
        if let Some(outcome) = remove_release(ctx, &hr, bundle).await? {
            return Ok(outcome);
        }
    }

    let names: Vec<String> = targets
        .iter()
        .map(|t| format!("{}/{}", t.namespace, t.release_name))
        .collect();
    release_finalizer(ctx, &hr, &format!("Release {} uninstalled", names.join(", "))).await
}

/// Uninstall `bundle` if the backend still holds it.
///
/// Returns the outcome to report when the backend failed, `None` once the
/// release is gone.
pub(super) async fn remove_release(
    ctx: &Reconciler,
    hr: &HelmRelease,
    bundle: &BundleRef,
) -> Result<Option<ReconcileOutcome>, ReconcilerError> {
    let observed = match ctx.backend.status(bundle).await {
        Ok(observed) => {
            observability::metrics::record_backend_operation("status", "success");
            observed
        }
        Err(e) => return fail(ctx, hr, "Status", &e).await.map(Some),
    };

    if observed == ObservedRelease::Absent {
        debug!("Release {} absent, nothing to uninstall", bundle);
        return Ok(None);
    }

    match ctx.backend.uninstall(bundle).await {
        Ok(()) => {
            observability::metrics::record_backend_operation("uninstall", "success");
            info!("Uninstalled {}", bundle);
        }
        Err(BackendError::NotFound(message)) => {
            observability::metrics::record_backend_operation("uninstall", "not-found");
            debug!("Release {} already gone: {}", bundle, message);
        }
        Err(e) => return fail(ctx, hr, "Uninstall", &e).await.map(Some),
    }
    Ok(None)
}

/// Whether the record failed after its deletion was requested, so the
/// teardown is being retried rather than started
fn failed_while_deleting(hr: &HelmRelease) -> bool {
    if hr.phase() != Some(Phase::Failed) {
        return false;
    }
    let Some(requested) = hr
        .metadata
        .deletion_timestamp
        .as_ref()
        .and_then(|t| serde_json::to_value(t).ok())
        .and_then(|v| v.as_str().and_then(parse_time))
    else {
        return false;
    };
    hr.status
        .as_ref()
        .and_then(|s| s.latest_condition(CONDITION_READY))
        .and_then(|c| c.last_transition_time.as_deref())
        .and_then(parse_time)
        .is_some_and(|failed_at| failed_at >= requested)
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

async fn release_finalizer(
    ctx: &Reconciler,
    hr: &HelmRelease,
    message: &str,
) -> Result<ReconcileOutcome, ReconcilerError> {
    // Published first: the record may be erased as soon as the finalizer goes
    publish_event(ctx, hr, ReleaseEvent::normal("Uninstalled", "Uninstall", message)).await;
    ctx.store.remove_finalizer(hr).await?;
    info!("Removed finalizer from {}", hr.release_name());
    Ok(ReconcileOutcome::Done)
}
