//! ChatBAZ Cursor Proxy
//!
//! Local proxy that intercepts Cursor's requests to `api.anthropic.com` and
//! rewrites them onto the ChatBAZ upstream (`chatbaz.app/claude`), managing
//! the `x-api-key` credential along the way.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;

use chatbaz_proxy_cli::{commands, logging};

#[derive(Parser, Debug)]
#[command(
    name = "chatbaz-proxy",
    version,
    about = "Forward Cursor's Anthropic API traffic to ChatBAZ",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store the ChatBAZ API key
    SetKey {
        /// Set API key non-interactively (warning: shell history exposure)
        #[arg(long)]
        api_key: Option<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Start the proxy server
    Start {
        /// Proxy port
        #[arg(short, long, default_value_t = 8080)]
        port: u16,

        /// Forward the caller's x-api-key instead of substituting the stored one
        #[arg(long)]
        pass_through: bool,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Test ChatBAZ connectivity with the stored key
    Test {
        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

impl Command {
    const fn verbose(&self) -> bool {
        match self {
            Self::SetKey { verbose, .. } | Self::Start { verbose, .. } | Self::Test { verbose } => {
                *verbose
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Bare invocation starts the proxy with defaults
    let command = cli.command.unwrap_or(Command::Start {
        port: 8080,
        pass_through: false,
        verbose: false,
    });

    if let Err(e) = logging::init(command.verbose()) {
        eprintln!("{} {e:#}", "Error:".bright_red());
        return ExitCode::FAILURE;
    }

    let result = match command {
        Command::SetKey { api_key, .. } => commands::set_key(api_key),
        Command::Start {
            port, pass_through, ..
        } => commands::start(port, pass_through).await,
        Command::Test { .. } => commands::test().await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".bright_red());
            ExitCode::FAILURE
        }
    }
}
