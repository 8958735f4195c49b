//! # Reconciliation
//!
//! One pass of driving a HelmRelease toward its spec.
//!
//! ```text
//!  (none) --finalizer--> Pending --install--> Installing --> Ready
//!                                                  |           |
//!                                                  v      spec edited
//!                                               Failed <-- Upgrading
//!  any phase --deletion--> Uninstalling --uninstall--> finalizer removed
//! ```
//!
//! A pass is a pure function of the stored record and what the backend
//! reports, so it is safe to repeat at any point, including after a crash
//! between a backend call and the status write that should have followed it.

mod deploy;
mod finalize;

use crate::backend::{BundleRef, ObservedRelease, ReleaseState};
use crate::controller::reconciler::status::{mark_failed, set_phase};
use crate::controller::reconciler::types::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::controller::reconciler::validation::validate_helm_release;
use crate::crd::{HelmRelease, Phase};
use crate::observability;
use crate::store::ObjectKey;
use tracing::{debug, info, warn};

/// Reconcile the record stored under `key`
pub async fn reconcile(
    ctx: &Reconciler,
    key: &ObjectKey,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let Some(hr) = ctx.store.get(key).await? else {
        debug!("HelmRelease {} no longer exists", key);
        return Ok(ReconcileOutcome::Done);
    };

    // A record must carry the identity it was fetched under
    if ObjectKey::of(&hr).as_ref() != Some(key) {
        return Err(ReconcilerError::InvalidObject(format!(
            "record fetched as {key} has identity {}/{}",
            hr.metadata.namespace.as_deref().unwrap_or("<none>"),
            hr.metadata.name.as_deref().unwrap_or("<none>")
        )));
    }

    if hr.is_being_deleted() {
        return finalize::finalize(ctx, hr).await;
    }

    let hr = if hr.has_finalizer() {
        hr
    } else {
        info!("Attaching finalizer to {}", key);
        let hr = ctx.store.add_finalizer(&hr).await?;
        if hr.phase().is_none() {
            set_phase(ctx, &hr, Phase::Pending, "Pending", "Release queued for installation").await?
        } else {
            hr
        }
    };

    apply(ctx, hr).await
}

/// Bring the backend in line with a live (not deleting) record
async fn apply(ctx: &Reconciler, hr: HelmRelease) -> Result<ReconcileOutcome, ReconcilerError> {
    let status = hr.status.clone().unwrap_or_default();

    if status.phase == Some(Phase::Ready) && status.observed_generation == Some(hr.generation()) {
        debug!(
            "{} is Ready at generation {}, nothing to do",
            hr.release_name(),
            hr.generation()
        );
        return Ok(ReconcileOutcome::Done);
    }

    if let Err(e) = validate_helm_release(&hr) {
        warn!("Invalid HelmRelease spec: {}", e);
        mark_failed(ctx, &hr, "Validate", "InvalidSpec", e.to_string()).await?;
        return Ok(ReconcileOutcome::Requeue(ctx.failure_requeue));
    }

    let bundle = BundleRef::from_release(&hr);
    if let Some(previous) = BundleRef::deployed(&hr).filter(|d| !d.same_release(&bundle)) {
        // Release name or namespace edited: the old release must not be orphaned
        info!("Release moved from {} to {}, removing the old one", previous, bundle);
        if let Some(outcome) = finalize::remove_release(ctx, &hr, &previous).await? {
            return Ok(outcome);
        }
    }

    let observed = match ctx.backend.status(&bundle).await {
        Ok(observed) => {
            observability::metrics::record_backend_operation("status", "success");
            observed
        }
        Err(e) => return deploy::fail(ctx, &hr, "Status", &e).await,
    };

    match observed {
        ObservedRelease::Absent => deploy::install(ctx, hr, &bundle).await,
        ObservedRelease::Present {
            revision,
            version,
            state,
        } => {
            if should_adopt(&hr, &bundle, revision, &version, state) {
                deploy::adopt(ctx, hr, revision).await
            } else {
                deploy::upgrade(ctx, hr, &bundle).await
            }
        }
    }
}

/// Whether an existing release already is the outcome of an operation whose
/// status write was lost.
///
/// Holds when the release is deployed at the desired version with a revision
/// the status has not recorded yet, and the record is mid-operation or
/// failed. A recorded revision only counts for the release it was recorded
/// under. A `Ready` record with a stale generation always upgrades: the
/// edit may have changed values without changing the version.
fn should_adopt(
    hr: &HelmRelease,
    bundle: &BundleRef,
    revision: i64,
    version: &str,
    state: ReleaseState,
) -> bool {
    let status = hr.status.clone().unwrap_or_default();
    let phase_allows = matches!(
        status.phase,
        None | Some(Phase::Pending | Phase::Installing | Phase::Upgrading | Phase::Failed)
    );
    let recorded_here = BundleRef::deployed(hr).is_none_or(|d| d.same_release(bundle));
    phase_allows
        && state == ReleaseState::Deployed
        && version == hr.spec.version
        && (!recorded_here || status.helm_revision != Some(revision))
}
