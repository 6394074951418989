use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use citysense::config::{Provider, Service, Settings, SettingsUpdate};
use citysense::llm_interaction::ConnectionState;
use citysense::web_server::{self, AppState};
use citysense::{chat, ChatSession, LlmService, VectorService};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the CitySense web server.
    Serve {
        #[arg(long, env = "CITYSENSE_PORT", default_value_t = 8501, help = "Port for the web server.")]
        port: u16,
    },
    /// Chat with the configured model in the terminal.
    Chat {
        #[arg(long, help = "Provider to use (openai or gemini).")]
        provider: Option<String>,
        #[arg(long, help = "Model to use; must belong to the provider.")]
        model: Option<String>,
        #[arg(long, help = "Do not use stored conversations as context.")]
        no_context: bool,
    },
    /// Show which API keys are configured.
    Status,
    /// List the models offered for a provider.
    Models {
        #[arg(value_parser = clap::value_parser!(Provider))]
        provider: Provider,
    },
    /// Send a minimal request to check a provider's API key.
    Test {
        #[arg(value_parser = clap::value_parser!(Provider))]
        provider: Provider,
    },
}

async fn build_session(settings: &Settings) -> ChatSession {
    let llm = Arc::new(LlmService::new(settings));
    let vector = Arc::new(VectorService::setup(settings).await);
    ChatSession::new(llm, vector)
}

fn mark(configured: bool) -> &'static str {
    if configured {
        "✅"
    } else {
        "❌"
    }
}

// The main entry point of the application, using tokio's async runtime
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for API keys)
    dotenvy::dotenv().ok();

    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,citysense=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!("CitySense starting with command: {:?}", cli.command);

    let settings = Settings::from_env();

    match cli.command {
        Commands::Serve { port } => {
            let session = build_session(&settings).await;
            let state = AppState::new(settings, session);

            let mut web_server_handle = tokio::spawn(async move {
                if let Err(e) = web_server::start_web_server(port, state).await {
                    error!("Web server failed: {:?}", e);
                }
            });

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Ctrl-C received, initiating shutdown...");
                }
                res = &mut web_server_handle => {
                    match res {
                        Ok(_) => info!("Web server task completed unexpectedly."),
                        Err(e) if e.is_panic() => error!("Web server task panicked: {:?}", e),
                        Err(e) => error!("Web server task failed: {:?}", e),
                    }
                }
            }

            if !web_server_handle.is_finished() {
                info!("Aborting web server task...");
                web_server_handle.abort();
            }
            info!("Shutdown complete.");
        }
        Commands::Chat {
            provider,
            model,
            no_context,
        } => {
            if settings.available_providers().is_empty() {
                anyhow::bail!("No LLM API configured! Set OPENAI_API_KEY or GEMINI_API_KEY.");
            }
            let mut session = build_session(&settings).await;
            session.update_settings(&SettingsUpdate {
                provider,
                model,
                use_context: no_context.then_some(false),
                ..Default::default()
            });
            chat::run_terminal_chat(&mut session)
                .await
                .context("Chat session failed")?;
        }
        Commands::Status => {
            println!("OpenAI:   {}", mark(settings.is_api_configured(Service::OpenAi)));
            println!("Gemini:   {}", mark(settings.is_api_configured(Service::Gemini)));
            println!("Pinecone: {}", mark(settings.is_api_configured(Service::Pinecone)));
            if settings.available_providers().is_empty() {
                println!("⚠️ No LLM API configured!");
            }
        }
        Commands::Models { provider } => {
            for model in provider.models() {
                println!("{}", model);
            }
        }
        Commands::Test { provider } => {
            let llm = LlmService::new(&settings);
            let status = llm.test_api_connection(provider).await;
            println!("{}", status.message);
            if status.status == ConnectionState::Error {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
