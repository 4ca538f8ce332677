mod config;
mod context;
mod dispatch;
mod transport;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pmxterm_proto::{to_line, Announcement};
use pmxterm_pty::{spawn_sweep_loop, Multiplexer};

use crate::config::BackendArgs;
use crate::context::BackendContext;
use crate::transport::{Channel, Listener};

/// Upper bound on draining tasks after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the announcement; logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = BackendArgs::parse();
    args.validate()?;
    run(args).await
}

async fn run(args: BackendArgs) -> anyhow::Result<()> {
    let (command_endpoint, notify_endpoint) = args.endpoints();
    let commands = Listener::bind(&command_endpoint)
        .await
        .with_context(|| format!("failed to bind command channel {command_endpoint}"))?;
    let notifications = match Listener::bind(&notify_endpoint).await {
        Ok(listener) => listener,
        Err(e) => {
            commands.remove_socket();
            return Err(e).with_context(|| format!("failed to bind notifier {notify_endpoint}"));
        }
    };

    let announcement = Announcement {
        multiplexer: commands.endpoint()?,
        notifier: notifications.endpoint()?,
    };
    announce(&announcement)?;
    log::info!(
        "backend ready: commands on {}, notifications on {}",
        announcement.multiplexer,
        announcement.notifier
    );

    let mux = Arc::new(Multiplexer::new(args.multiplexer_config()));
    let ctx = Arc::new(BackendContext::new(Arc::clone(&mux)));

    let sweep = spawn_sweep_loop(mux, args.sweep_interval(), ctx.shutdown_signal());
    let command_loop = tokio::spawn(transport::run_accept_loop(
        commands,
        Channel::Commands,
        Arc::clone(&ctx),
    ));
    let notify_loop = tokio::spawn(transport::run_accept_loop(
        notifications,
        Channel::Notifications,
        Arc::clone(&ctx),
    ));

    wait_for_shutdown_signal().await?;
    log::info!("shutting down");
    ctx.shutdown();

    // The sweep buries every session on its way out.
    for (name, task) in [("sweep", sweep), ("commands", command_loop), ("notifier", notify_loop)] {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("{name} task failed: {e}"),
            Err(_) => log::warn!("{name} task did not stop within {SHUTDOWN_TIMEOUT:?}"),
        }
    }

    log::info!("backend stopped");
    Ok(())
}

fn announce(announcement: &Announcement) -> anyhow::Result<()> {
    let line = to_line(announcement)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.flush().context("failed to write announcement")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => log::info!("received SIGTERM"),
            _ = sigint.recv() => log::info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        log::info!("received Ctrl+C");
    }

    Ok(())
}
