// M4T node: `m4t hub` relays between peers, `m4t peer` chats with one.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use m4t_core::identity::DEFAULT_SALT;
use m4t_core::IdentityToken;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use m4t_node::cli::{Cli, Command, HubArgs, PeerArgs};
use m4t_node::config::{self, Config};
use m4t_node::endpoint::{LineOutcome, PeerEndpoint, StartupError};
use m4t_node::frontend::TerminalFrontend;
use m4t_node::hub::Hub;
use m4t_node::shutdown::Shutdown;

/// Exit status for fatal errors other than missing startup answers.
const FATAL_EXIT: u8 = 3;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let mut cfg = config::load();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start runtime");
            return ExitCode::from(FATAL_EXIT);
        }
    };
    let result = rt.block_on(async {
        match cli.command {
            Command::Hub(args) => run_hub(&mut cfg, args).await,
            Command::Peer(args) => run_peer(&mut cfg, args).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<StartupError>() {
            Some(startup) => {
                eprintln!("{startup}. Shutting down...");
                ExitCode::from(startup.exit_code())
            }
            None => {
                error!("{err:#}");
                ExitCode::from(FATAL_EXIT)
            }
        },
    }
}

async fn run_hub(cfg: &mut Config, args: HubArgs) -> anyhow::Result<()> {
    args.apply(cfg);
    let hub = Hub::bind(cfg, IdentityToken::generate(DEFAULT_SALT)).await?;
    let shutdown = Shutdown::new();
    let task = tokio::spawn(hub.run(shutdown.clone()));
    tokio::select! {
        res = shutdown_signal() => res?,
        _ = shutdown.wait() => {}
    }
    shutdown.trigger();
    task.await.context("hub task panicked")?
}

async fn run_peer(cfg: &mut Config, args: PeerArgs) -> anyhow::Result<()> {
    args.common.apply(cfg);
    let frontend = Arc::new(TerminalFrontend::new(args.port, args.target));
    let shutdown = Shutdown::new();
    let endpoint = PeerEndpoint::start(
        cfg,
        frontend,
        IdentityToken::generate(DEFAULT_SALT),
        shutdown.clone(),
    )
    .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading input")? {
                Some(line) => {
                    if endpoint.handle_line(&line).await? == LineOutcome::Exit {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.wait() => break,
            res = shutdown_signal() => {
                res?;
                break;
            }
        }
    }
    endpoint.shutdown().await
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
