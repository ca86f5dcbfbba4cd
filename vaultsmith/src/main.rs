use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use vaultsmith_core::vault_api::HttpVaultApiFactory;
use vaultsmith_core::{
    ClusterConfig, ClusterOrchestrator, ErrorKind, VaultsmithError, VaultsmithResult,
};

mod prompt;
mod terraform;

use prompt::TerminalPrompt;
use terraform::TerraformApplier;

#[derive(Parser)]
#[command(name = "vaultsmith")]
#[command(about = "Bootstrap and reconcile a Raft-backed Vault cluster", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Initialize, unseal, join and configure the cluster
    Bootstrap {
        /// Cluster configuration file (YAML or TOML)
        #[arg(long)]
        config: PathBuf,

        /// Override the number of pipeline attempts
        #[arg(long)]
        attempts: Option<u32>,

        /// Override the pause between attempts, in seconds
        #[arg(long)]
        retry_wait: Option<u64>,

        /// Terraform executable used for the infrastructure apply
        #[arg(long, default_value = "terraform")]
        terraform_bin: PathBuf,
    },
    /// Print the resolved node topology
    Topology {
        #[arg(long)]
        config: PathBuf,
    },
    /// Take a Raft snapshot and store it in the storage backend
    Snapshot {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_logging(verbose: bool) -> VaultsmithResult<()> {
    let level = if verbose { "debug" } else { "info" };
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for crate_name in ["vaultsmith", "vaultsmith_core"] {
        filter = filter.add_directive(
            format!("{}={}", crate_name, level)
                .parse()
                .map_err(|e| VaultsmithError::configuration("logging", format!("Invalid log directive: {}", e)))?,
        );
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn orchestrator(config: ClusterConfig, terraform_bin: PathBuf) -> VaultsmithResult<ClusterOrchestrator> {
    ClusterOrchestrator::connect(
        config,
        Arc::new(HttpVaultApiFactory),
        Arc::new(TerminalPrompt),
        Arc::new(TerraformApplier::new(terraform_bin)),
    )
    .await
}

async fn bootstrap(
    config_path: PathBuf,
    attempts: Option<u32>,
    retry_wait: Option<u64>,
    terraform_bin: PathBuf,
) -> VaultsmithResult<()> {
    let mut config = ClusterConfig::from_file(&config_path)?;
    if let Some(attempts) = attempts {
        config.orchestration.attempts = attempts;
    }
    if let Some(seconds) = retry_wait {
        config.orchestration.retry_wait = Duration::from_secs(seconds);
    }

    let orchestrator = orchestrator(config, terraform_bin).await?;
    tokio::select! {
        result = orchestrator.run() => {
            let ha = result?;
            println!("Vault cluster is ready at {}", ha.api().address());
            println!("Admin client credentials: {}", ha.artifacts().settings_file.display());
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => Err(VaultsmithError::Interrupted),
    }
}

async fn show_topology(config_path: PathBuf) -> VaultsmithResult<()> {
    let config = ClusterConfig::from_file(&config_path)?;
    let orchestrator = orchestrator(config, PathBuf::from("terraform")).await?;
    let topology = orchestrator.topology().await?;

    for node in topology.nodes() {
        println!("{}", node.node_id);
        println!("  api_addr:     {}", node.api_addr);
        println!("  cluster_addr: {}", node.cluster_addr);
        println!("  raft address: {}", node.raft_address());
        println!("  SANs:         {}", node.subject_alt_names.join(", "));
        if node.retry_join.is_empty() {
            println!("  retry_join:   none");
        }
        for target in node.retry_join.values() {
            println!("  retry_join:   {} ({})", target.node_id, target.leader_api_addr);
        }
    }
    Ok(())
}

async fn snapshot(config_path: PathBuf) -> VaultsmithResult<()> {
    let config = ClusterConfig::from_file(&config_path)?;
    let orchestrator = orchestrator(config, PathBuf::from("terraform")).await?;
    let size = orchestrator.snapshot().await?;
    println!("Stored {} byte raft snapshot", size);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Bootstrap {
            config,
            attempts,
            retry_wait,
            terraform_bin,
        } => bootstrap(config, attempts, retry_wait, terraform_bin).await,
        Commands::Topology { config } => show_topology(config).await,
        Commands::Snapshot { config } => snapshot(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(VaultsmithError::Interrupted) => {
            tracing::error!("Interrupted by operator");
            // A prompt thread still waiting on the terminal would keep the runtime from shutting down
            std::process::exit(1);
        }
        Err(e) if e.kind() == ErrorKind::SafeExit => {
            tracing::info!("{}", e);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
