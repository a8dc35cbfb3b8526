mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::Crd { action } => commands::crd::run(action).await?,
        Commands::Run {
            kubeconfig,
            namespace,
            leader_elect,
            metrics_addr,
            health_addr,
            log_level,
            dry_run,
        } => {
            let exit = commands::run::run(commands::run::RunArgs {
                kubeconfig,
                namespace,
                leader_elect,
                metrics_addr,
                health_addr,
                log_level,
                dry_run,
            })
            .await?;
            if exit != 0 {
                std::process::exit(exit);
            }
        }
    }

    Ok(())
}
