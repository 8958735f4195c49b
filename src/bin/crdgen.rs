//! Prints the HelmRelease CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen > config/crd/helmrelease.yaml
//! ```

use helm_release_controller::crd::HelmRelease;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&HelmRelease::crd())?);
    Ok(())
}
