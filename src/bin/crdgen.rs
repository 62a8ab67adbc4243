//! Print the CustomResourceDefinitions for every managed kind as one YAML stream

use kube::CustomResourceExt;
use sigstore_k8s::crd::{CTlog, Rekor, Trillian};

fn main() -> anyhow::Result<()> {
    let crds = [Trillian::crd(), Rekor::crd(), CTlog::crd()];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    print!("{}", docs.join("---\n"));
    Ok(())
}
