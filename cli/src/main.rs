mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kronk")]
#[command(author, version, about = "Local inference server for GGUF models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Host:port to bind to (default: KRONK_WEB_API_HOST or localhost:3000)
        #[arg(long)]
        host: Option<String>,
    },

    /// Model management (list, show, rm)
    Model {
        #[command(subcommand)]
        action: ModelCommands,
    },

    /// One-shot chat with a model
    Chat {
        /// Model id (file stem of the .gguf file)
        model: String,

        /// The user prompt
        prompt: String,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Sampling temperature
        #[arg(long)]
        temperature: Option<f32>,
    },

    /// Compute an embedding vector
    Embed {
        /// Model id
        model: String,

        /// Text to embed
        text: String,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    /// List models on disk
    #[command(alias = "ls")]
    List,

    /// Show a model's card information
    Show {
        /// Model id
        model: String,
    },

    /// Remove a model and its projection file
    #[command(alias = "rm")]
    Remove {
        /// Model id
        model: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host } => {
            commands::serve::execute(host.as_deref()).await?;
        }

        Commands::Model { action } => match action {
            ModelCommands::List => {
                commands::models::execute().await?;
            }
            ModelCommands::Show { model } => {
                commands::show::execute(&model).await?;
            }
            ModelCommands::Remove { model } => {
                commands::remove::execute(&model).await?;
            }
        },

        Commands::Chat {
            model,
            prompt,
            max_tokens,
            temperature,
        } => {
            commands::chat::execute(&model, &prompt, max_tokens, temperature).await?;
        }

        Commands::Embed { model, text } => {
            commands::embed::execute(&model, &text).await?;
        }
    }

    Ok(())
}
