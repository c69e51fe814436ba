use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatelease::{Config, ConflictProber, DhcpService, IcmpProber, NoopProber, Result};

#[derive(Parser)]
#[command(name = "gatelease")]
#[command(author, version, about = "DHCP lease management for dual-stack interfaces", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting lease service with config: {:?}", cli.config);
            let prober: Arc<dyn ConflictProber> = if config.icmp_timeout().is_zero() {
                Arc::new(NoopProber)
            } else {
                Arc::new(IcmpProber::new())
            };
            let service = DhcpService::new(config, prober).await?;
            service.start().await;

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping service...");
            if let Err(error) = service.shutdown().await {
                tracing::error!("Failed to save leases on shutdown: {}", error);
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let service = DhcpService::new(config, Arc::new(NoopProber)).await?;

            for manager in service.managers() {
                let leases = manager.leases().await;
                println!("[{}]", manager.name());

                if leases.is_empty() {
                    println!("No active leases.");
                    continue;
                }

                println!(
                    "{:<40} {:<28} {:<16} {:<24} {:<10}",
                    "IP Address", "Hardware Address", "Hostname", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(122));

                for lease in leases {
                    let (expires, remaining) = match (lease.expires_at, lease.remaining_seconds()) {
                        (Some(expires_at), Some(remaining)) => (
                            expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                            if remaining > 0 {
                                format!("{}s", remaining)
                            } else {
                                "expired".to_string()
                            },
                        ),
                        _ => ("never".to_string(), "static".to_string()),
                    };

                    println!(
                        "{:<40} {:<28} {:<16} {:<24} {:<10}",
                        lease.ip,
                        lease.hw_addr.to_string(),
                        lease.hostname,
                        expires,
                        remaining
                    );
                }
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let service = DhcpService::new(config, Arc::new(NoopProber)).await?;
            service.reaper().reap_once().await;
            service.save().await?;
            println!(
                "Cleaned up expired leases, {} active lease(s) remain.",
                service.leases().await.len()
            );
            Ok(())
        }
    }
}
