mod doctor;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mxf::config::load_config;
use mxf::transport::{self, TransportState};
use mxf::Substrate;

#[derive(Parser)]
#[command(name = "mxf")]
#[command(about = "Model Exchange Framework agent execution substrate")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transport server (session websocket endpoint).
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
        #[arg(long, env = "MXF_DOMAIN_KEY", default_value = "dev-domain-key")]
        domain_key: String,
    },
    /// Print the resolved configuration as TOML.
    PrintConfig,
    /// Check config and optional collaborators without starting the transport.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = load_config(None)?;

    match cli.command {
        Commands::PrintConfig => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Doctor => {
            let healthy = doctor::run();
            std::process::exit(if healthy { 0 } else { 1 });
        }
        Commands::Serve { port, domain_key } => {
            let home = mxf::util::get_mxf_home()?;
            let db_path = home.join("memory.sqlite3");
            let substrate = Substrate::new(config, db_path)?;
            substrate.spawn_background_tasks();

            let state = TransportState {
                sessions: substrate.sessions.clone(),
                bus: substrate.bus.clone(),
                expected_domain_key: domain_key,
            };
            let app = transport::router(state);
            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
            tracing::info!(port, "mxf listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
            substrate.shutdown().await;
            Ok(())
        }
    }
}
