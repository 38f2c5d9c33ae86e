use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    tracing::{info, warn},
    tracing_subscriber::EnvFilter,
};

use {
    crier_config::{discover_and_load, load_config, validate_config, CrierConfig},
    crier_engine::PromoterService,
    crier_stores::{
        memory::{MemoryAccountStore, MemoryChannelStore, MemoryTemplateStore},
        AccountRecord,
    },
    crier_transport::{
        sim::{SimFactory, SimNetwork},
        ChatEntity,
    },
};

#[derive(Parser)]
#[command(name = "crier", about = "crier: session-pool promotion control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file path (overrides discovery).
    #[arg(long, global = true, env = "CRIER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the promoter (default when no subcommand is provided).
    Run {
        /// Drive the control plane on the simulated loopback transport.
        /// The only transport this build ships; a real MTProto transport
        /// plugs in through the client factory.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Simulated sessions for the dry run.
        #[arg(long, default_value_t = 6)]
        mobiles: usize,

        /// Simulated discoverable channels for the dry run.
        #[arg(long, default_value_t = 12)]
        channels: usize,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,
    /// Check the configuration for range and consistency problems.
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match cli.config {
        Some(ref path) => load_config(path)?,
        None => discover_and_load(),
    };

    match cli.command.unwrap_or(Commands::Run {
        dry_run: false,
        mobiles: 6,
        channels: 12,
    }) {
        Commands::Run {
            dry_run,
            mobiles,
            channels,
        } => run(config, dry_run, mobiles, channels).await,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            },
            ConfigAction::Validate => validate(&config),
        },
    }
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn validate(config: &CrierConfig) -> Result<()> {
    let result = validate_config(config);
    if result.diagnostics.is_empty() {
        println!("configuration OK");
        return Ok(());
    }
    for d in &result.diagnostics {
        println!("{}: {}: {}", d.severity, d.path, d.message);
    }
    if result.has_errors() {
        anyhow::bail!("configuration has errors");
    }
    Ok(())
}

async fn run(config: CrierConfig, dry_run: bool, mobiles: usize, channels: usize) -> Result<()> {
    if !dry_run {
        anyhow::bail!(
            "no MTProto transport is bundled; run with --dry-run to drive the \
             control plane on the simulated transport"
        );
    }

    let result = validate_config(&config);
    for d in &result.diagnostics {
        warn!(path = d.path, severity = %d.severity, "{}", d.message);
    }
    if result.has_errors() {
        anyhow::bail!("refusing to start with configuration errors");
    }

    let (network, service) = build_dry_run(config, mobiles, channels);
    service.start().await?;
    info!(mobiles, channels, "dry run started; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.stop().await;

    let status = service.status().await;
    let sent = network.sent_messages().len();
    info!(
        sent,
        healthy = status.healthy_mobiles.len(),
        "dry run finished"
    );
    Ok(())
}

/// A self-contained world: simulated sessions, discoverable channels, and
/// in-memory stores.
fn build_dry_run(
    config: CrierConfig,
    mobiles: usize,
    channels: usize,
) -> (Arc<SimNetwork>, Arc<PromoterService>) {
    let network = SimNetwork::shared();

    let pool: Vec<String> = (1..=mobiles).map(|i| format!("+1555000{i:04}")).collect();
    for mobile in &pool {
        for c in 1..=channels {
            network.add_dialog(
                mobile,
                ChatEntity {
                    id: Some(format!("{:010}", 7_000_000 + c)),
                    title: format!("group-{c}"),
                    username: (c % 3 == 0).then(|| format!("group_{c}")),
                    megagroup: true,
                    participants_count: 600 + (c as i64) * 37,
                    ..ChatEntity::default()
                },
            );
        }
    }

    let accounts = Arc::new(MemoryAccountStore::new(vec![AccountRecord {
        client_id: "dry-run".into(),
        promote_mobiles: pool,
        days_left: 3,
        expired: false,
    }]));

    let service = PromoterService::build(
        config,
        Arc::new(SimFactory::new(Arc::clone(&network))),
        Arc::new(MemoryChannelStore::new()),
        Arc::new(MemoryTemplateStore::fallback_only(
            "Check out our channel for daily deals!",
        )),
        accounts,
    );

    (network, service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_world_builds() {
        let (network, _service) = build_dry_run(CrierConfig::default(), 2, 3);
        assert!(network.sent_messages().is_empty());
    }
}
