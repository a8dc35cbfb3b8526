use anyhow::{Context, Result};
use kube::api::Api;
use kube::Client;

use kube_rightsizer::crd::{RightSizerConfig, RightSizerPolicy};
use kube_rightsizer::executor;
use kube_rightsizer::provider::{MetricsApiProvider, MetricsProvider};

/// Preflight checklist: everything `run` needs, verified up front.
pub async fn run() -> Result<()> {
    println!("Checking cluster prerequisites...\n");

    let client = Client::try_default()
        .await
        .context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  RightSizerConfig CRD ........ ");
    let configs: Api<RightSizerConfig> = Api::all(client.clone());
    match configs.list(&Default::default()).await {
        Ok(list) => println!("OK ({} object(s))", list.items.len()),
        Err(_) => println!("MISSING (run `kube-rightsizer crd install`)"),
    }

    print!("  RightSizerPolicy CRD ........ ");
    let policies: Api<RightSizerPolicy> = Api::all(client.clone());
    match policies.list(&Default::default()).await {
        Ok(list) => println!("OK ({} object(s))", list.items.len()),
        Err(_) => println!("MISSING (run `kube-rightsizer crd install`)"),
    }

    print!("  Resize subresource .......... ");
    match executor::probe_platform_caps(&client).await {
        Ok(caps) if caps.resize_subresource => {
            let shrink = if caps.in_place_memory_decrease {
                "with in-place memory decrease"
            } else {
                "memory decrease needs restart"
            };
            println!("OK ({shrink})");
        }
        Ok(_) => println!("ABSENT (parent-workload fallback will be used)"),
        Err(e) => println!("UNKNOWN ({e})"),
    }

    print!("  Metrics API ................. ");
    let provider = MetricsApiProvider::new(client);
    match provider.fetch().await {
        Ok(usages) => println!("OK ({} container sample(s))", usages.len()),
        Err(_) => println!("MISSING (install metrics-server)"),
    }

    println!("\nCheck complete.");
    Ok(())
}
