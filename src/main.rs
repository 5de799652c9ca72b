//! routelane - rule-based request routing for coding-assistant clients
//!
//! A local server that routes each client request to the highest-priority
//! healthy rule of the active route, failing over when an upstream errors.

use clap::{Parser, Subcommand};
use routelane::config::{Config, KeySource, LoggingConfig};
use routelane::model::ContentType;
use routelane::proxy::run_server;
use routelane::router::priority_order;
use routelane::status::{StatusConnectionManager, WsConnector, STATUS_CHANNEL_PATH};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "routelane")]
#[command(about = "Rule-based request routing with health-aware failover")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the routing server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show routes and their rules in priority order
    Rules {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Follow the rule status channel of a running server
    Watch {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:3456")]
        server: String,
    },
}

/// Install the subscriber. `RUST_LOG` wins over the configured directives.
fn init_tracing(directives: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directives.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the config and start logging at its `[logging] level`.
fn load_config(path: &str) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    let loaded = Config::from_file_with_env(path)?;
    init_tracing(&loaded.0.logging.filter_directives());
    tracing::info!(config = %path, "Loaded configuration");
    Ok(loaded)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut config, key_sources) = load_config(&config)?;

            for (service, source) in &key_sources {
                if *source == KeySource::None {
                    tracing::warn!(service = %service, "No API key configured");
                }
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }

            run_server(config).await
        }

        Commands::Check { config } => {
            let (config, key_sources) = load_config(&config)?;
            println!(
                "Configuration OK: {} vendors, {} services, {} routes, {} rules",
                config.vendors.len(),
                config.services.len(),
                config.routes.len(),
                config.rules.len()
            );
            for (service, source) in key_sources {
                println!("  {:<24} key: {}", service, source);
            }
            Ok(())
        }

        Commands::Rules { config } => {
            let (config, _) = load_config(&config)?;
            for route in &config.routes {
                println!(
                    "{} ({}, {}){}",
                    route.id,
                    route.name,
                    route.target_type,
                    if route.is_active { " [active]" } else { "" }
                );
                for content_type in ContentType::ALL {
                    let mut rules: Vec<_> = config
                        .rules
                        .iter()
                        .filter(|r| r.route_id == route.id && r.content_type == content_type)
                        .cloned()
                        .collect();
                    if rules.is_empty() {
                        continue;
                    }
                    rules.sort_by(priority_order);
                    println!("  {}:", content_type);
                    for rule in rules {
                        println!(
                            "    {:>4}  {:<20} -> {} {}",
                            rule.sort_order,
                            rule.id,
                            rule.target_service_id,
                            rule.target_model().unwrap_or("(caller model)")
                        );
                    }
                }
            }
            Ok(())
        }

        Commands::Watch { server } => {
            init_tracing(&LoggingConfig::default().filter_directives());
            let url = format!("ws://{}{}", server, STATUS_CHANNEL_PATH);
            tracing::info!(url = %url, "Watching rule status");

            let manager = StatusConnectionManager::new(Arc::new(WsConnector::new(url)));
            let subscription = manager.subscribe();
            let mut ticker = tokio::time::interval(Duration::from_secs(5));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut snapshot: Vec<_> = subscription.snapshot().into_iter().collect();
                        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
                        println!("[{:?}] {} rules", subscription.state(), snapshot.len());
                        for (rule_id, entry) in snapshot {
                            println!(
                                "  {:<20} {:<7} tokens={} requests={}",
                                rule_id,
                                format!("{:?}", entry.status),
                                entry.total_tokens_used.unwrap_or(0),
                                entry.total_requests_used.unwrap_or(0)
                            );
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        subscription.unsubscribe();
                        return Ok(());
                    }
                }
            }
        }
    }
}
