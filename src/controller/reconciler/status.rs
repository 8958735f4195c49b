//! # Status Management
//!
//! Writes phase, conditions and deployment facts to the HelmRelease status
//! and emits the matching events.
//!
//! Every write is conditional on the record version the reconciler read, so
//! a concurrent edit surfaces as [`ReconcilerError::Conflict`] instead of
//! being overwritten.

use crate::backend::BundleRef;
use crate::controller::reconciler::types::{Reconciler, ReconcilerError};
use crate::crd::{Condition, HelmRelease, HelmReleaseStatus, Phase, CONDITION_READY};
use crate::observability;
use crate::store::ReleaseEvent;
use tracing::{debug, warn};

/// Event action for a phase entered by the reconciler
fn phase_action(phase: Phase) -> &'static str {
    match phase {
        Phase::Pending => "Reconcile",
        Phase::Installing => "Install",
        Phase::Upgrading => "Upgrade",
        Phase::Uninstalling => "Uninstall",
        Phase::Ready | Phase::Failed => "Reconcile",
    }
}

/// Write `status` unless it equals the stored status.
/// Returns the record as stored after the write.
pub async fn write_status(
    ctx: &Reconciler,
    hr: &HelmRelease,
    status: HelmReleaseStatus,
) -> Result<HelmRelease, ReconcilerError> {
    // Skipping no-op writes keeps repeated reconciliations from generating watch events
    if hr.status.as_ref() == Some(&status) {
        debug!("Skipping status update - status unchanged");
        return Ok(hr.clone());
    }

    let previous = hr.phase();
    let updated = ctx.store.update_status(hr, &status).await?;

    if let Some(phase) = status.phase.filter(|p| Some(*p) != previous) {
        debug!(
            "Phase transition {} -> {}",
            previous.map_or("<none>", Phase::as_str),
            phase
        );
        observability::metrics::increment_phase_transitions(phase.as_str());
    }
    Ok(updated)
}

/// Enter a non-terminal phase (`Pending`, `Installing`, `Upgrading`,
/// `Uninstalling`). Emits an event when the phase changes.
pub async fn set_phase(
    ctx: &Reconciler,
    hr: &HelmRelease,
    phase: Phase,
    reason: &str,
    message: impl Into<String>,
) -> Result<HelmRelease, ReconcilerError> {
    let message = message.into();
    let mut status = hr.status.clone().unwrap_or_default();
    status.phase = Some(phase);
    status.push_condition(Condition::new(
        CONDITION_READY,
        phase == Phase::Ready,
        reason,
        message.clone(),
    ));

    let entered = hr.phase() != Some(phase);
    let updated = write_status(ctx, hr, status).await?;
    if entered {
        publish_event(
            ctx,
            &updated,
            ReleaseEvent::normal(reason, phase_action(phase), message),
        )
        .await;
    }
    Ok(updated)
}

/// Record a successful deployment at `revision`, along with the release
/// identity it was made under
pub async fn mark_ready(
    ctx: &Reconciler,
    hr: &HelmRelease,
    revision: i64,
    action: &str,
    reason: &str,
    message: impl Into<String>,
) -> Result<HelmRelease, ReconcilerError> {
    let message = message.into();
    let mut status = hr.status.clone().unwrap_or_default();
    let revision_changed = status.helm_revision != Some(revision);

    let bundle = BundleRef::from_release(hr);
    status.phase = Some(Phase::Ready);
    status.deployed_version = Some(hr.spec.version.clone());
    status.helm_revision = Some(revision);
    status.release_name = Some(bundle.release_name);
    status.release_namespace = Some(bundle.namespace);
    if revision_changed || status.last_deployed_at.is_none() {
        status.last_deployed_at = Some(chrono::Utc::now().to_rfc3339());
    }
    status.observe_generation(hr.generation());
    status.push_condition(Condition::new(CONDITION_READY, true, reason, message.clone()));

    let updated = write_status(ctx, hr, status).await?;
    publish_event(ctx, &updated, ReleaseEvent::normal(reason, action, message)).await;
    Ok(updated)
}

/// Record a failed attempt. The generation counts as observed: the failure
/// reflects the current spec.
pub async fn mark_failed(
    ctx: &Reconciler,
    hr: &HelmRelease,
    action: &str,
    reason: &str,
    message: impl Into<String>,
) -> Result<HelmRelease, ReconcilerError> {
    let message = message.into();
    let mut status = hr.status.clone().unwrap_or_default();
    status.phase = Some(Phase::Failed);
    status.observe_generation(hr.generation());
    status.push_condition(Condition::new(CONDITION_READY, false, reason, message.clone()));

    let updated = write_status(ctx, hr, status).await?;
    publish_event(ctx, &updated, ReleaseEvent::warning(reason, action, message)).await;
    Ok(updated)
}

/// Publish an event. Failures are logged and otherwise ignored.
pub async fn publish_event(ctx: &Reconciler, hr: &HelmRelease, event: ReleaseEvent) {
    let reason = event.reason.clone();
    if let Err(e) = ctx.store.publish_event(hr, event).await {
        warn!("Failed to publish {} event: {}", reason, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::crd::HelmReleaseSpec;
    use crate::store::{EventKind, MemoryStore, ObjectKey, ReleaseStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, Reconciler, HelmRelease) {
        let store = Arc::new(MemoryStore::new());
        let ctx = Reconciler::new(
            store.clone(),
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(30),
        );
        let mut hr = HelmRelease::new(
            "web",
            HelmReleaseSpec {
                chart: "nginx".to_string(),
                repo_url: "https://example/charts".to_string(),
                version: "15.0.0".to_string(),
                target_namespace: "demo".to_string(),
                release_name: None,
                values: None,
            },
        );
        hr.metadata.namespace = Some("default".to_string());
        let created = store.create(hr).unwrap();
        (store, ctx, created)
    }

    #[tokio::test]
    async fn test_set_phase_skips_unchanged_status() {
        let (store, ctx, hr) = setup();
        let pending = set_phase(&ctx, &hr, Phase::Pending, "Pending", "queued")
            .await
            .unwrap();
        let again = set_phase(&ctx, &pending, Phase::Pending, "Pending", "queued")
            .await
            .unwrap();
        assert_eq!(store.status_writes(), 1);
        assert_eq!(
            pending.metadata.resource_version,
            again.metadata.resource_version
        );
        // One event for entering the phase
        let key = ObjectKey::of(&hr).unwrap();
        assert_eq!(store.events(&key).len(), 1);
    }

    #[tokio::test]
    async fn test_mark_ready_records_deployment() {
        let (_store, ctx, hr) = setup();
        let ready = mark_ready(&ctx, &hr, 1, "Install", "Installed", "installed")
            .await
            .unwrap();
        let status = ready.status.unwrap();
        assert_eq!(status.phase, Some(Phase::Ready));
        assert_eq!(status.deployed_version.as_deref(), Some("15.0.0"));
        assert_eq!(status.helm_revision, Some(1));
        assert_eq!(status.release_name.as_deref(), Some("web"));
        assert_eq!(status.release_namespace.as_deref(), Some("demo"));
        assert_eq!(status.observed_generation, Some(1));
        assert!(status.last_deployed_at.is_some());
        assert!(status.latest_condition(CONDITION_READY).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_mark_failed_emits_warning() {
        let (store, ctx, hr) = setup();
        let failed = mark_failed(&ctx, &hr, "Install", "ChartNotFound", "no such chart")
            .await
            .unwrap();
        assert_eq!(failed.phase(), Some(Phase::Failed));
        let events = store.events(&ObjectKey::of(&hr).unwrap());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Warning);
        assert_eq!(events[0].reason, "ChartNotFound");
    }

    #[tokio::test]
    async fn test_stale_record_conflicts() {
        let (store, ctx, hr) = setup();
        store.add_finalizer(&hr).await.unwrap();
        let result = set_phase(&ctx, &hr, Phase::Pending, "Pending", "queued").await;
        assert!(matches!(result, Err(ReconcilerError::Conflict(_))));
    }
}
