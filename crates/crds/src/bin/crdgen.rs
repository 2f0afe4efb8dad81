//! Prints the `DevelopmentEnvironment` CRD as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > deploy/crds/developmentenvironment.yaml`

use crds::DevelopmentEnvironment;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crd = DevelopmentEnvironment::crd();
    print!("{}", serde_yaml::to_string(&crd)?);
    Ok(())
}
