use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kube-rightsizer")]
#[command(about = "In-place right-sizing operator for container workloads")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity, CRDs, and resize support
    Check,

    /// Manage the RightSizerConfig / RightSizerPolicy CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the right-sizer control plane
    Run {
        /// Path to a kubeconfig file (defaults to in-cluster, then $KUBECONFIG)
        #[arg(long)]
        kubeconfig: Option<String>,

        /// Namespace the operator runs in (self-protection scope)
        #[arg(long)]
        namespace: Option<String>,

        /// Participate in leader election (disable for single-replica runs)
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        leader_elect: bool,

        /// Metrics endpoint bind address
        #[arg(long, default_value = "0.0.0.0:9090")]
        metrics_addr: String,

        /// Health endpoint bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        health_addr: String,

        /// Log level: debug, info, warn, error
        #[arg(long)]
        log_level: Option<String>,

        /// Observe and report without mutating anything (overrides config)
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print both CRD schemas as YAML to stdout
    Generate,

    /// Install the CRDs into the connected cluster
    Install,
}
