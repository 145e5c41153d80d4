//! switchyard - OpenAI-compatible LLM proxy with managed credentials.
//!
//! A proxy that accepts OpenAI-shaped requests and dispatches them to the
//! healthiest configured upstream provider, with key rotation, rate
//! limiting, circuit breaking and multi-level fallback.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::storage;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "OpenAI-compatible LLM proxy with health-aware fallback")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "switchyard.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "switchyard.toml")]
        config: String,
    },

    /// Show catalog providers, mappings and masked keys
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "switchyard.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("switchyard={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let mut config = switchyard::Config::from_file(&config)?;
            init_tracing(&config.logging.level);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            switchyard::proxy::run_server(config).await
        }

        Commands::Check { config: path } => {
            init_tracing("info");
            let config = switchyard::Config::from_file(&path)?;
            tracing::info!(config = %path, "Configuration is valid");
            tracing::info!(
                listen = %config.server.listen,
                shared_store = %config
                    .shared_store
                    .url
                    .as_deref()
                    .unwrap_or("in-memory"),
                strategy = %config.dispatch.selection_strategy,
                "Resolved settings"
            );
            Ok(())
        }

        Commands::Providers { config: path } => {
            init_tracing("warn");
            let config = switchyard::Config::from_file(&path)?;
            let pool = storage::init_pool(&config.database.url).await?;
            let catalog = storage::Catalog::from_pool(
                pool,
                std::time::Duration::from_secs(config.database.catalog_ttl_secs),
            )
            .await?;

            let snapshot = catalog.snapshot().await;
            let mut providers: Vec<_> = snapshot.providers().collect();
            providers.sort_by(|a, b| a.name.cmp(&b.name));

            for provider in providers {
                let status = if provider.enabled { "enabled" } else { "disabled" };
                println!(
                    "{} [{}] {} ({})",
                    provider.name,
                    provider.kind.as_str(),
                    provider.base_url,
                    status
                );
                for key in snapshot.keys_for(provider.id) {
                    println!(
                        "  key {} {} priority={} status={}",
                        key.key_id,
                        key.masked,
                        key.priority,
                        key.status.as_str()
                    );
                }
            }

            println!();
            for alias in snapshot.aliases() {
                let targets: Vec<String> = snapshot
                    .mappings_for(&alias)
                    .iter()
                    .filter_map(|m| {
                        snapshot
                            .provider(m.provider_id)
                            .map(|p| format!("{}/{}", p.name, m.provider_model))
                    })
                    .collect();
                println!("{} -> {}", alias, targets.join(", "));
            }
            Ok(())
        }
    }
}
