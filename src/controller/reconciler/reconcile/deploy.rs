//! # Install and Upgrade
//!
//! Backend mutations for live records. The phase is written before the
//! first backend call, so a crash leaves the record in
//! `Installing`/`Upgrading` and the next pass can recognise the result via
//! `status`. A retry of a `Failed` record stays `Failed` until it succeeds:
//! repeated failures then write nothing, and no status change re-queues the
//! record ahead of its backoff.

use crate::backend::{BackendError, BundleRef, ObservedRelease, ReleaseState};
use crate::controller::reconciler::status::{mark_failed, mark_ready, set_phase};
use crate::controller::reconciler::types::{ReconcileOutcome, Reconciler, ReconcilerError};
use crate::crd::{HelmRelease, Phase};
use crate::observability;
use tracing::{debug, error, info, warn};

pub(super) async fn install(
    ctx: &Reconciler,
    hr: HelmRelease,
    bundle: &BundleRef,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let hr = enter_phase(
        ctx,
        hr,
        Phase::Installing,
        "Installing",
        format!("Installing {}@{}", bundle.chart, bundle.version),
    )
    .await?;

    let values = hr.spec.values.clone().unwrap_or_default();
    match ctx.backend.install(bundle, &values).await {
        Ok(revision) => {
            observability::metrics::record_backend_operation("install", "success");
            info!("Installed {} at revision {}", bundle, revision);
            mark_ready(
                ctx,
                &hr,
                revision,
                "Install",
                "Installed",
                format!("Installed {}@{} (revision {})", bundle.chart, bundle.version, revision),
            )
            .await?;
            Ok(ReconcileOutcome::Done)
        }
        Err(BackendError::AlreadyExists(message)) => {
            observability::metrics::record_backend_operation("install", "already-exists");
            warn!("Install of {} found an existing release: {}", bundle, message);
            recover_existing(ctx, hr, bundle, BackendError::AlreadyExists(message)).await
        }
        Err(e) => fail(ctx, &hr, "Install", &e).await,
    }
}

/// Write the in-progress phase, unless the record is retrying a failure
async fn enter_phase(
    ctx: &Reconciler,
    hr: HelmRelease,
    phase: Phase,
    reason: &str,
    message: String,
) -> Result<HelmRelease, ReconcilerError> {
    if hr.phase() == Some(Phase::Failed) {
        debug!("Retrying {} without leaving Failed: {}", hr.release_name(), message);
        return Ok(hr);
    }
    set_phase(ctx, &hr, phase, reason, message).await
}

/// The release appeared between `status` and `install`. Take it over if it
/// is deployed at the desired version; otherwise report the install failure
/// and let the next pass upgrade it.
async fn recover_existing(
    ctx: &Reconciler,
    hr: HelmRelease,
    bundle: &BundleRef,
    install_error: BackendError,
) -> Result<ReconcileOutcome, ReconcilerError> {
    match ctx.backend.status(bundle).await {
        Ok(ObservedRelease::Present {
            revision,
            version,
            state: ReleaseState::Deployed,
        }) if version == bundle.version => {
            observability::metrics::record_backend_operation("status", "success");
            adopt(ctx, hr, revision).await
        }
        Ok(_) => {
            observability::metrics::record_backend_operation("status", "success");
            fail(ctx, &hr, "Install", &install_error).await
        }
        Err(e) => fail(ctx, &hr, "Status", &e).await,
    }
}

pub(super) async fn upgrade(
    ctx: &Reconciler,
    hr: HelmRelease,
    bundle: &BundleRef,
) -> Result<ReconcileOutcome, ReconcilerError> {
    let hr = enter_phase(
        ctx,
        hr,
        Phase::Upgrading,
        "Upgrading",
        format!("Upgrading to {}@{}", bundle.chart, bundle.version),
    )
    .await?;

    let values = hr.spec.values.clone().unwrap_or_default();
    match ctx.backend.upgrade(bundle, &values).await {
        Ok(revision) => {
            observability::metrics::record_backend_operation("upgrade", "success");
            info!("Upgraded {} to revision {}", bundle, revision);
            mark_ready(
                ctx,
                &hr,
                revision,
                "Upgrade",
                "Upgraded",
                format!("Upgraded to {}@{} (revision {})", bundle.chart, bundle.version, revision),
            )
            .await?;
            Ok(ReconcileOutcome::Done)
        }
        Err(e) => fail(ctx, &hr, "Upgrade", &e).await,
    }
}

/// Record an existing deployed release as ours without calling the backend
pub(super) async fn adopt(
    ctx: &Reconciler,
    hr: HelmRelease,
    revision: i64,
) -> Result<ReconcileOutcome, ReconcilerError> {
    info!(
        "Release {} already deployed at {} (revision {}), recording it",
        hr.release_name(),
        hr.spec.version,
        revision
    );
    mark_ready(
        ctx,
        &hr,
        revision,
        "Reconcile",
        "Adopted",
        format!(
            "Release already deployed at {} (revision {})",
            hr.spec.version, revision
        ),
    )
    .await?;
    Ok(ReconcileOutcome::Done)
}

/// Record a backend failure and schedule the fixed-backoff retry
pub(super) async fn fail(
    ctx: &Reconciler,
    hr: &HelmRelease,
    action: &str,
    err: &BackendError,
) -> Result<ReconcileOutcome, ReconcilerError> {
    observability::metrics::record_backend_operation(&action.to_lowercase(), err.reason());
    if err.is_transient() {
        warn!("{} of {} failed (transient): {}", action, hr.release_name(), err);
    } else {
        error!("{} of {} failed: {}", action, hr.release_name(), err);
    }

    mark_failed(ctx, hr, action, err.reason(), format!("{action} failed: {err}")).await?;
    Ok(ReconcileOutcome::Requeue(ctx.failure_requeue))
}
