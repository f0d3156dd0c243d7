use claude_bridge::{cli, pid, providers::ProviderRegistry, server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cbr")]
#[command(about = "Claude Bridge - Anthropic Messages API over OpenAI-compatible providers", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ~/.claude-bridge/config.toml)
    #[arg(short, long, env = "CLAUDE_BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge
    Start {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Stop the running bridge
    Stop,
    /// Check service status
    Status,
    /// Validate configuration and list providers
    Check,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<(cli::AppConfig, PathBuf)> {
    let path = match path {
        Some(path) => path,
        None => cli::AppConfig::default_path()?,
    };
    let config = cli::AppConfig::from_file(&path)
        .map_err(|e| anyhow::anyhow!("{} ({})", e, path.display()))?;
    Ok((config, path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port } => {
            let (mut config, config_path) = load_config(cli.config)?;

            // Override port if specified
            if let Some(port) = port {
                config.server.port = port;
            }

            // Write PID file
            if let Err(e) = pid::write_pid() {
                eprintln!("Warning: Failed to write PID file: {}", e);
            }

            tracing::info!("Using configuration {}", config_path.display());
            println!("🚀 Claude Bridge v{}", env!("CARGO_PKG_VERSION"));
            println!("📡 Starting server on {}:{}", config.server.host, config.server.port);
            println!();
            println!("🔀 Providers (fallback: {:?}):", config.fallback.strategy);
            for provider in config.providers.iter().filter(|p| p.is_enabled()) {
                println!("   {} (priority {})", provider.name, provider.priority);
            }
            println!();
            println!("Press Ctrl+C to stop");

            // Cleanup PID file on exit
            let result = server::start_server(config).await;
            let _ = pid::cleanup_pid();
            result?;
        }
        Commands::Stop => {
            println!("Stopping Claude Bridge...");
            match pid::read_pid() {
                Ok(pid) if pid::is_process_running(pid) => match pid::terminate(pid) {
                    Ok(()) => {
                        println!("✅ Service stopped successfully");
                        let _ = pid::cleanup_pid();
                    }
                    Err(e) => eprintln!("Failed to stop service: {}", e),
                },
                Ok(_) => {
                    println!("Service is not running");
                    let _ = pid::cleanup_pid();
                }
                Err(_) => {
                    println!("Service is not running (no PID file found)");
                }
            }
        }
        Commands::Status => match pid::read_pid() {
            Ok(pid) if pid::is_process_running(pid) => {
                println!("✅ Service is running (PID: {})", pid);
            }
            Ok(_) => {
                println!("❌ Service is not running (stale PID file)");
                let _ = pid::cleanup_pid();
            }
            Err(_) => {
                println!("❌ Service is not running");
            }
        },
        Commands::Check => {
            let (config, config_path) = load_config(cli.config)?;
            let registry = ProviderRegistry::from_configs(&config.providers)?;

            println!("✅ {} is valid", config_path.display());
            println!();
            println!("{:<20} {:>8} {:<8} {:<40} MODELS", "PROVIDER", "PRIORITY", "ENABLED", "BASE URL");
            for entry in registry.entries() {
                let provider = &entry.config;
                let models = provider
                    .models
                    .iter()
                    .map(|(from, to)| format!("{}→{}", from, to))
                    .collect::<Vec<_>>()
                    .join(", ");
                println!(
                    "{:<20} {:>8} {:<8} {:<40} {}",
                    provider.name,
                    provider.priority,
                    if provider.is_enabled() { "yes" } else { "no" },
                    provider.base_url,
                    models
                );
            }
        }
    }

    Ok(())
}
