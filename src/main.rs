// src/main.rs — chathub entry point

use clap::Parser;

use chathub::cli::{admin, serve, Cli, Commands};
use chathub::infra::config::Config;
use chathub::infra::logger;

#[tokio::main]
async fn main() {
    // .env is optional
    dotenv::dotenv().ok();

    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from(std::path::Path::new(path))?;
            config.apply_env(|k| std::env::var(k).ok());
            config
        }
        None => Config::load()?,
    };

    logger::init_logging(&config.server.log_level);

    match cli.command {
        None => serve::run_serve(config, Default::default()).await,
        Some(Commands::Serve(args)) => serve::run_serve(config, args).await,
        Some(Commands::CleanupSessions) => admin::cleanup_sessions(&config).await,
        Some(Commands::Models { json }) => admin::show_models(json),
    }
}
