use anyhow::Result;
use clap::{Parser, Subcommand};

use waggle_config::Settings;
use waggle_runtime::App;
use waggle_server::AppState;

#[derive(Parser)]
#[command(
    name = "waggle",
    version,
    about = "WhatsApp-fronted conversational agent platform"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the webhook server, worker pool and monitor")]
    Start {
        #[arg(long, default_value = "0.0.0.0", help = "Bind address")]
        host: String,
        #[arg(long, default_value = "8001", help = "HTTP port")]
        port: u16,
    },
    #[command(about = "One-shot health check against the configured backends")]
    Status,
    #[command(name = "generate-key", about = "Print a fresh encryption passphrase")]
    GenerateKey,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenerateKey => {
            println!("{}", waggle_crypto::generate_key());
        }
        Commands::Start { host, port } => {
            init_tracing();
            let settings = Settings::from_env()?;
            let app = App::new(settings).await?;
            let init = app.orchestrator.initialize().await;
            tracing::info!("integration initialize: {}", init["status"]);

            let state = AppState::from_app(&app);
            let addr = format!("{host}:{port}");
            tokio::select! {
                result = waggle_server::serve(state, &addr) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received ctrl-c, shutting down");
                }
            }

            app.close().await;
        }
        Commands::Status => {
            init_tracing();
            let settings = Settings::from_env()?;
            let app = App::new(settings).await?;
            let health = app.monitor.get_system_health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}
