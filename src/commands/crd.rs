use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use kube_rightsizer::crd::{RightSizerConfig, RightSizerPolicy};

use crate::cli::CrdAction;

pub async fn run(action: CrdAction) -> Result<()> {
    match action {
        CrdAction::Generate => generate(),
        CrdAction::Install => install().await,
    }
}

fn generate() -> Result<()> {
    let config_crd =
        serde_yaml::to_string(&RightSizerConfig::crd()).context("Failed to serialize CRD")?;
    let policy_crd =
        serde_yaml::to_string(&RightSizerPolicy::crd()).context("Failed to serialize CRD")?;
    println!("{config_crd}---\n{policy_crd}");
    Ok(())
}

async fn install() -> Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in [RightSizerConfig::crd(), RightSizerPolicy::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        crds.patch(
            &name,
            &PatchParams::apply("kube-rightsizer").force(),
            &Patch::Apply(&crd),
        )
        .await
        .with_context(|| format!("Failed to apply CRD {name}"))?;
        println!("Installed {name}");
    }

    Ok(())
}
