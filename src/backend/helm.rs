//! # Helm CLI Backend
//!
//! Drives the `helm` binary. Each operation is one helm invocation; stderr
//! is classified into a [`BackendError`] so the reconciler can record a
//! precise failure reason.
//!
//! Child processes are spawned with `kill_on_drop`, so when a reconciliation
//! deadline expires and the future is dropped the helm process is killed
//! rather than left running behind the worker's back.

use super::{classify_helm_error, BackendError, BundleRef, ObservedRelease, ReleaseBackend, ReleaseState};
use crate::crd::Values;
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

/// Row of `helm list -o json`
#[derive(Debug, Deserialize)]
struct HelmListEntry {
    name: String,
    revision: String,
    status: String,
    chart: String,
}

/// Subset of the release document printed by `helm install|upgrade -o json`
#[derive(Debug, Deserialize)]
struct HelmReleaseOutput {
    version: i64,
}

/// Helm CLI release backend
#[derive(Debug, Clone)]
pub struct HelmCliBackend {
    binary: PathBuf,
    operation_timeout: Duration,
}

impl HelmCliBackend {
    /// Locate the helm binary.
    ///
    /// `HELM_BINARY` overrides the lookup; otherwise `helm` is resolved on
    /// `PATH`.
    pub fn locate(operation_timeout: Duration) -> Result<Self, BackendError> {
        let binary = match std::env::var("HELM_BINARY") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => which::which("helm").map_err(|e| {
                BackendError::Unavailable(format!("helm binary not found on PATH: {e}"))
            })?,
        };
        info!("Using helm binary: {}", binary.display());
        Ok(Self::new(binary, operation_timeout))
    }

    pub fn new(binary: PathBuf, operation_timeout: Duration) -> Self {
        Self {
            binary,
            operation_timeout,
        }
    }

    fn timeout_arg(&self) -> String {
        format!("{}s", self.operation_timeout.as_secs().max(1))
    }

    fn list_args(bundle: &BundleRef) -> Vec<String> {
        vec![
            "list".to_string(),
            "--all".to_string(),
            "--namespace".to_string(),
            bundle.namespace.clone(),
            "--filter".to_string(),
            format!("^{}$", bundle.release_name),
            "--output".to_string(),
            "json".to_string(),
        ]
    }

    fn deploy_args(&self, verb: &str, bundle: &BundleRef, values_file: &Path) -> Vec<String> {
        let mut args = vec![
            verb.to_string(),
            bundle.release_name.clone(),
            bundle.chart.clone(),
        ];
        // OCI registries carry the chart in the reference; classic repos use --repo
        if bundle.repo_url.starts_with("oci://") {
            args[2] = format!("{}/{}", bundle.repo_url.trim_end_matches('/'), bundle.chart);
        } else {
            args.push("--repo".to_string());
            args.push(bundle.repo_url.clone());
        }
        args.extend([
            "--version".to_string(),
            bundle.version.clone(),
            "--namespace".to_string(),
            bundle.namespace.clone(),
            "--values".to_string(),
            values_file.display().to_string(),
            "--timeout".to_string(),
            self.timeout_arg(),
            "--output".to_string(),
            "json".to_string(),
        ]);
        if verb == "install" {
            args.push("--create-namespace".to_string());
        }
        args
    }

    fn uninstall_args(&self, bundle: &BundleRef) -> Vec<String> {
        vec![
            "uninstall".to_string(),
            bundle.release_name.clone(),
            "--namespace".to_string(),
            bundle.namespace.clone(),
            "--wait".to_string(),
            "--timeout".to_string(),
            self.timeout_arg(),
        ]
    }

    async fn run(&self, args: &[String]) -> Result<String, BackendError> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                BackendError::Unavailable(format!(
                    "Failed to execute {}: {e}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("helm {} failed: {}", args.first().map_or("", String::as_str), stderr.trim());
            return Err(classify_helm_error(&stderr));
        }

        String::from_utf8(output.stdout)
            .map_err(|e| BackendError::Other(format!("Failed to decode helm output as UTF-8: {e}")))
    }

    async fn deploy(
        &self,
        verb: &str,
        bundle: &BundleRef,
        values: &Values,
    ) -> Result<i64, BackendError> {
        let values_file = write_values_file(values)?;
        let args = self.deploy_args(verb, bundle, values_file.path());
        let stdout = self.run(&args).await?;
        parse_release_revision(&stdout)
    }
}

/// Render values into a temporary file that lives until the returned handle is dropped
fn write_values_file(values: &Values) -> Result<tempfile::NamedTempFile, BackendError> {
    let yaml = values
        .to_yaml()
        .map_err(|e| BackendError::InvalidSpec(format!("Failed to render values: {e}")))?;
    let mut file = tempfile::Builder::new()
        .prefix("helm-values-")
        .suffix(".yaml")
        .tempfile()
        .map_err(|e| BackendError::Other(format!("Failed to create values file: {e}")))?;
    file.write_all(yaml.as_bytes())
        .map_err(|e| BackendError::Other(format!("Failed to write values file: {e}")))?;
    Ok(file)
}

/// Extract the chart version from helm's `<chart>-<version>` column
fn chart_version(chart_column: &str, chart: &str) -> String {
    if let Some(version) = chart_column.strip_prefix(&format!("{chart}-")) {
        return version.to_string();
    }
    // Chart renamed upstream: the version starts at the first "-<digit>"
    chart_column
        .char_indices()
        .find(|(i, c)| {
            *c == '-'
                && chart_column[i + 1..]
                    .chars()
                    .next()
                    .is_some_and(|n| n.is_ascii_digit())
        })
        .map_or_else(String::new, |(i, _)| chart_column[i + 1..].to_string())
}

fn parse_list_output(stdout: &str, bundle: &BundleRef) -> Result<ObservedRelease, BackendError> {
    let entries: Vec<HelmListEntry> = serde_json::from_str(stdout.trim())
        .map_err(|e| BackendError::Other(format!("Failed to parse helm list output: {e}")))?;

    let Some(entry) = entries.into_iter().find(|e| e.name == bundle.release_name) else {
        return Ok(ObservedRelease::Absent);
    };

    let revision = entry
        .revision
        .parse::<i64>()
        .map_err(|e| BackendError::Other(format!("Invalid revision '{}': {e}", entry.revision)))?;

    Ok(ObservedRelease::Present {
        revision,
        version: chart_version(&entry.chart, &bundle.chart),
        state: ReleaseState::from_helm(&entry.status),
    })
}

fn parse_release_revision(stdout: &str) -> Result<i64, BackendError> {
    serde_json::from_str::<HelmReleaseOutput>(stdout.trim())
        .map(|release| release.version)
        .map_err(|e| BackendError::Other(format!("Failed to parse helm release output: {e}")))
}

#[async_trait]
impl ReleaseBackend for HelmCliBackend {
    async fn status(&self, bundle: &BundleRef) -> Result<ObservedRelease, BackendError> {
        let stdout = self.run(&Self::list_args(bundle)).await?;
        parse_list_output(&stdout, bundle)
    }

    async fn install(&self, bundle: &BundleRef, values: &Values) -> Result<i64, BackendError> {
        info!("helm install {}", bundle);
        self.deploy("install", bundle, values).await
    }

    async fn upgrade(&self, bundle: &BundleRef, values: &Values) -> Result<i64, BackendError> {
        info!("helm upgrade {}", bundle);
        self.deploy("upgrade", bundle, values).await
    }

    async fn uninstall(&self, bundle: &BundleRef) -> Result<(), BackendError> {
        info!("helm uninstall {}", bundle);
        self.run(&self.uninstall_args(bundle)).await.map(|_| ())
    }
}
