//! Command implementations for the CLI.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{error, info};

use chatbaz_proxy::{
    AuthPolicy, CredentialStore, ProxyConfig, RewriteEngine, validate_api_key,
};

use crate::engine::ProxyServer;

/// Timeout for the connectivity test call.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Longest upstream body preview shown by `test`.
const PREVIEW_LIMIT: usize = 300;

const APP_NAME: &str = "ChatBAZ Cursor";

/// Stores the API key, prompting when not given on the command line.
pub fn set_key(api_key: Option<String>) -> Result<ExitCode> {
    let store = CredentialStore::open_default()?;

    let api_key = match api_key {
        Some(key) => key.trim().to_string(),
        None => {
            println!("{}", format!("{APP_NAME} - API Key Setup").bright_cyan().bold());
            prompt_api_key()?
        }
    };

    if !validate_api_key(&api_key) {
        eprintln!(
            "{}",
            "Invalid API key. Expected at least 10 characters.".bright_red()
        );
        return Ok(ExitCode::FAILURE);
    }

    store.save(&api_key)?;
    info!("API key saved");

    println!("{}", "API key saved successfully".bright_green().bold());
    println!();
    println!("Location:   {}", store.path().display().to_string().cyan());
    println!("Stored key: {}", store.masked_key().yellow());
    println!();
    println!("Start proxy with:");
    println!("  {}", "chatbaz-proxy start".bold());

    Ok(ExitCode::SUCCESS)
}

/// Runs the proxy until interrupted.
pub async fn start(port: u16, pass_through: bool) -> Result<ExitCode> {
    let store = Arc::new(CredentialStore::open_default()?);
    let config = ProxyConfig::default();

    let policy = if pass_through {
        AuthPolicy::PassThrough
    } else {
        if !store.has_key() {
            eprintln!("{}", "No API key configured".bright_red().bold());
            eprintln!();
            eprintln!("Configure key first:");
            eprintln!("  {}", "chatbaz-proxy set-key".bold());
            return Ok(ExitCode::FAILURE);
        }
        AuthPolicy::Substitute {
            store: Arc::clone(&store),
        }
    };

    println!(
        "{}",
        format!("{APP_NAME} Proxy v{}", env!("CARGO_PKG_VERSION"))
            .bright_cyan()
            .bold()
    );
    if !pass_through {
        println!("{} {}", "API key loaded:".green(), store.masked_key().yellow());
    }

    let engine = Arc::new(RewriteEngine::new(config, policy));
    let server = ProxyServer::bind(port, Arc::clone(&engine)).await?;
    let addr = server.local_addr()?;

    println!("{} {}", "Proxy listening on".green(), addr.to_string().bold());
    println!("{}", "━".repeat(50).dimmed());
    println!("Intercepting {}", engine.config().intercept_host.cyan());
    println!("Forwarding to {}", engine.config().upstream_base().cyan());
    println!("{}", "Press Ctrl+C to stop".dimmed());
    println!("{}", "━".repeat(50).dimmed());

    info!("Starting {APP_NAME} proxy on {addr}");

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!("\n{}", "Proxy stopped".yellow());
            info!("Proxy stopped by user");
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Checks that the upstream accepts the stored key.
///
/// Any failure (timeout, connection error, non-200 status) is reported and
/// mapped to a non-zero exit; nothing here is fatal to the caller.
pub async fn test() -> Result<ExitCode> {
    let store = CredentialStore::open_default()?;
    let config = ProxyConfig::default();

    println!("{}", format!("{APP_NAME} - Connection Test").bright_cyan().bold());

    let Some(api_key) = store.get_key() else {
        eprintln!("{}", "No API key configured".bright_red());
        eprintln!("Run: {}", "chatbaz-proxy set-key".bold());
        return Ok(ExitCode::FAILURE);
    };

    println!("{} {}", "API key found:".green(), store.masked_key().yellow());
    println!(
        "{}",
        format!("Testing {} upstream...", config.upstream_name).yellow()
    );

    let url = format!("{}/v1/models", config.upstream_base());
    let client = reqwest::Client::builder()
        .timeout(TEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    match client.get(&url).header("x-api-key", api_key).send().await {
        Ok(response) if response.status().as_u16() == 200 => {
            println!(
                "{}",
                format!(
                    "Connection OK: {} upstream accepted credentials",
                    config.upstream_name
                )
                .green()
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(response) => {
            let status = response.status().as_u16();
            eprintln!("{}", format!("Upstream returned {status}").bright_red());
            let preview = preview_body(&response.text().await.unwrap_or_default());
            if !preview.is_empty() {
                eprintln!("{}", preview.dimmed());
            }
            Ok(ExitCode::FAILURE)
        }
        Err(e) => {
            error!("Test command failed: {e}");
            eprintln!("{}", format!("Connection test failed: {e}").bright_red());
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Reads the key from stdin with a visible prompt.
fn prompt_api_key() -> Result<String> {
    print!("Enter ChatBAZ API key: ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .context("Failed to read API key from stdin")?;
    Ok(input.trim().to_string())
}

/// Truncates an upstream body for display.
fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(PREVIEW_LIMIT).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_preview_body_passes_short_bodies() {
        assert_eq!(preview_body("  {\"ok\":true}  "), "{\"ok\":true}");
    }

    #[test]
    fn test_preview_body_truncates_long_bodies() {
        let long = "x".repeat(PREVIEW_LIMIT * 2);
        let preview = preview_body(&long);
        assert_eq!(preview.chars().count(), PREVIEW_LIMIT + 3);
        assert!(preview.ends_with("..."));
    }
}
