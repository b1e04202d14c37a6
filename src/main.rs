//! codeloop CLI binary entry point.

use clap::Parser;
use codeloop::cli::{chat, Cli, Commands};
use codeloop::util::logging::init_logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    let result = match cli.command {
        Commands::Chat(args) => chat::run_chat(args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
