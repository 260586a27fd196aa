//! Prints the gateway CRD manifests to stdout.
//!
//! Usage: `cargo run --bin crdgen > deploy/crds.yaml`

use config_api::{Upstream, VirtualHost};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Upstream::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&VirtualHost::crd())?);
    Ok(())
}
