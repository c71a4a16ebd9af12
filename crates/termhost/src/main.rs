#![forbid(unsafe_code)]

//! # termhost CLI
//!
//! Serves the demo command set over SSH and WebSocket, or runs a single
//! session in the current terminal.
//!
//! ## Usage
//!
//! ```bash
//! termhost serve                   # SSH on 2222, WebSocket on 8080
//! ssh -p 2222 localhost            # connect
//! termhost console                 # local session, no network
//! ```

mod cli;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use termhost::config::SessionLimits;
use termhost::SessionManager;
use termhost::local::local_pair;
use termhost::prelude::*;
use termhost::session::SessionHostBuilder;

use cli::{Cli, Command};
use demo::HostStatus;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Command::Serve(args) => {
            args.apply(&mut config);
            config.validate()?;
            serve(config).await
        }
        Command::Console => console(config).await,
        Command::Config(args) => {
            args.apply(&mut config);
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli::log_filter(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn session_host(config: &Config, status: &Arc<HostStatus>) -> SessionHostBuilder {
    SessionHost::builder()
        .registry_factory(demo::registry)
        .container(demo::services(status.clone()))
        .shell_config(&config.shell)
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let status = Arc::new(HostStatus::default());
    let host = session_host(&config, &status).build();
    let mut tasks = JoinSet::new();

    let ssh = if config.ssh.enabled {
        let server = Arc::new(SshServer::new(config.ssh.clone(), host.clone())?);
        status.add(server.clone());
        let serving = server.clone();
        tasks.spawn(async move { serving.listen().await });
        Some(server)
    } else {
        None
    };

    let websocket = if config.websocket.enabled {
        let server = Arc::new(WebSocketServer::new(config.websocket.clone(), host.clone())?);
        status.add(server.clone());
        let serving = server.clone();
        tasks.spawn(async move { serving.listen().await });
        Some(server)
    } else {
        None
    };

    if tasks.is_empty() {
        anyhow::bail!("no transport enabled");
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, shutting down");
        }
        Some(result) = tasks.join_next() => {
            result??;
            warn!("A transport stopped unexpectedly, shutting down");
        }
    }

    if let Some(server) = &ssh {
        let remaining = server.shutdown(SHUTDOWN_TIMEOUT).await;
        if remaining > 0 {
            warn!(remaining, "SSH sessions did not close in time");
        }
    }
    if let Some(server) = &websocket {
        let remaining = server.shutdown(SHUTDOWN_TIMEOUT).await;
        if remaining > 0 {
            warn!(remaining, "WebSocket sessions did not close in time");
        }
    }

    while let Some(result) = tasks.join_next().await {
        if let Ok(Err(e)) = result {
            warn!(error = %e, "Transport stopped with error");
        }
    }
    Ok(())
}

async fn console(config: Config) -> anyhow::Result<()> {
    let status = Arc::new(HostStatus::default());
    let manager = Arc::new(SessionManager::new(
        TransportKind::Local,
        SessionLimits::default(),
    ));
    status.add(manager.clone());

    // The local terminal is in cooked mode and echoes on its own.
    let host = session_host(&config, &status)
        .customizer(|settings: &mut ShellSettings| settings.echo = false)
        .build();
    let runner = SessionRunner::new(host, manager);

    let (connection, mut client) = local_pair(TransportKind::Local, Window::default());
    let session = runner.spawn(connection);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            chunk = client.recv() => match chunk {
                Some(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                None => break,
            },
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) => client.send_line(&line),
                None => {
                    stdin_open = false;
                    client.close();
                }
            },
        }
    }

    let outcome = session.await?;
    info!(?outcome, "Console session ended");
    Ok(())
}
