// pairlink: phone/watch peer link daemon. Plays one role; the console stands in for the UI.

mod actor;
mod config;
mod console;
mod logfile;
mod transport;
mod workout;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use pairlink_core::{PeerSessionManager, Role};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: pairlink-host [--role phone|watch] [--config PATH] [--version]";

#[derive(Debug, Default, PartialEq)]
struct Args {
    role: Option<Role>,
    config: Option<PathBuf>,
    version: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--role" => {
                let v = args.next().ok_or_else(|| anyhow!("--role needs a value"))?;
                out.role = Some(v.parse()?);
            }
            "--config" => {
                let v = args.next().ok_or_else(|| anyhow!("--config needs a path"))?;
                out.config = Some(PathBuf::from(v));
            }
            other => bail!("unknown argument `{}`\n{}", other, USAGE),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("pairlink-host {}", VERSION);
        return Ok(());
    }

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(role) = args.role {
        cfg.role = role;
    }

    let log_dir = cfg.log_dir();
    let log = logfile::RotatingLog::open(&log_dir, cfg.max_log_files, cfg.max_log_file_bytes)
        .with_context(|| format!("opening log directory {}", log_dir.display()))?;
    setup_logging(&log);
    info!(
        role = %cfg.role,
        version = VERSION,
        log_file = ?log.current_file(),
        "starting"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, log))
}

/// stderr `fmt` layer plus the rotating file layer, filtered by `RUST_LOG` (default `info`).
fn setup_logging(log: &logfile::RotatingLog) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(log.layer())
        .init();
}

async fn run(cfg: config::Config, log: logfile::RotatingLog) -> anyhow::Result<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();

    let listener = match transport::bind(cfg.role, cfg.listen_port).await {
        Ok(l) => Some(l),
        Err(e) => {
            error!(port = cfg.listen_port, error = %e, "cannot open link");
            None
        }
    };

    let mut manager = PeerSessionManager::new(
        cfg.role,
        cfg.manager_config(),
        Box::new(log),
        Box::new(workout::SimulatedWorkouts::new(events_tx.clone())),
    );
    let activation = manager.activate(listener.is_some())?;
    let listener = listener.flatten();

    let mut actor = actor::Actor::new(manager, link_tx, ui_tx.clone(), cfg.log_pull_deadline_secs);
    actor.perform(activation);

    let link_config = transport::LinkConfig {
        role: cfg.role,
        peer_addr: cfg.peer_addr,
        reconnect_interval: cfg.reconnect_interval(),
        inbox: cfg.inbox_dir(),
    };
    let link_events = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = transport::run_link(link_config, listener, link_events, link_rx).await {
            error!(error = %e, "link stopped");
        }
    });

    let tick_events = events_tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.tick().await;
        loop {
            interval.tick().await;
            if tick_events.send(actor::HostEvent::Tick).is_err() {
                break;
            }
        }
    });

    tokio::spawn(console::print_loop(ui_rx));
    tokio::spawn(console::read_stdin(events_tx, ui_tx));

    tokio::select! {
        _ = actor.run(events_rx) => info!("quit requested"),
        res = shutdown_signal() => {
            res?;
            info!("shutdown signal received");
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
