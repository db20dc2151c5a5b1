use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::future::Future;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use cli::render;
use config::Config;
use xenstore_client::Client;

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.log_level.as_deref().unwrap_or("warn")
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let Some(log_file) = &config.log_file {
        if let Some(dir) = log_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).context("Failed to create log directory")?;
        }
        let target = Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .context("Failed to open log file")?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.init();
    info!("Logging initialized at level {}", level);
    Ok(())
}

/// Apply the configured request timeout to a single operation.
async fn timed<T>(
    config: &Config,
    what: &str,
    op: impl Future<Output = xenstore_client::Result<T>>,
) -> Result<T> {
    let result = match config.request_timeout() {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| eyre!("{} timed out after {} ms", what, config.request_timeout_ms))?,
        None => op.await,
    };
    result.context(format!("{} failed", what))
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Connecting via {}", config.transport.transport().describe());
    let client = timed(config, "connect", Client::connect(&config.transport)).await?;

    let result = run_command(&client, &cli.command, config).await;
    if let Err(e) = client.close().await {
        log::debug!("Error closing client: {}", e);
    }
    result
}

async fn run_command(client: &Client, command: &Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Read { path } => {
            let value = timed(config, "read", client.read(path)).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Write { path, value } => {
            timed(config, "write", client.write(path, value)).await?;
            info!("Wrote {}", path);
        }
        Commands::Mkdir { path } => {
            timed(config, "mkdir", client.mkdir(path)).await?;
        }
        Commands::Rm { path } => {
            timed(config, "rm", client.rm(path)).await?;
        }
        Commands::Ls { path, json } => {
            let nodes = timed(config, "ls", client.walk(path)).await?;
            if *json {
                let out = serde_json::to_string_pretty(&render::tree_json(&nodes)).context("Failed to encode JSON")?;
                println!("{}", out);
            } else {
                for line in render::tree_lines(path.as_bytes(), &nodes) {
                    println!("{}", line);
                }
            }
        }
        Commands::Perms { path } => {
            let perms = timed(config, "perms", client.get_permissions(path)).await?;
            for (i, perm) in perms.iter().enumerate() {
                println!("{}", render::permission_line(perm, i == 0));
            }
        }
        Commands::SetPerms { path, perms } => {
            timed(config, "set-perms", client.set_permissions(path, perms.as_slice())).await?;
        }
        Commands::DomainPath { domid } => {
            let path = timed(config, "domain-path", client.get_domain_path(*domid)).await?;
            println!("{}", String::from_utf8_lossy(&path));
        }
        Commands::Watch { paths, token } => watch(client, paths, token, config).await?,
    }
    Ok(())
}

async fn watch(client: &Client, paths: &[String], token: &str, config: &Config) -> Result<()> {
    let monitor = client.monitor().context("Failed to create monitor")?;
    for path in paths {
        timed(config, "watch", monitor.watch(path, token)).await?;
        eprintln!("{} {}", "Watching".green(), path);
    }

    loop {
        match monitor.wait().await {
            Ok(event) => println!("{}", render::event_line(chrono::Local::now(), &event)),
            Err(e) if e.is_connection() => {
                eprintln!("{} {}", "Connection closed:".yellow(), e);
                return Ok(());
            }
            Err(e) => return Err(e).context("watch failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    setup_logging(&config, cli.is_verbose()).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
