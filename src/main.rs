use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use datalink::{Datalink, DatalinkConfig, DatalinkResult};

// Settings come from the JSON file named by DATALINK_CONFIG when set, otherwise
// from the DATALINK_* variables.
fn load_config() -> DatalinkResult<DatalinkConfig> {
    match std::env::var("DATALINK_CONFIG") {
        Ok(path) => DatalinkConfig::load(path),
        Err(_) => DatalinkConfig::from_env(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let cfg = load_config()?;
    info!(
        target: "startup",
        "datalinkd starting: RUST_LOG='{}', base_directory='{}', sweep_interval={}s",
        rust_log, cfg.base_directory.display(), cfg.sweep_interval().as_secs()
    );

    let dl = Datalink::standalone(cfg)?;
    let reaper = dl.spawn_reaper();

    wait_for_shutdown(&dl).await?;

    info!(target: "startup", "datalinkd shutting down");
    reaper.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(dl: &Datalink) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!(target: "startup", "received SIGHUP, reloading configuration");
                match load_config().and_then(|cfg| dl.apply_config(cfg)) {
                    Ok(()) => {}
                    Err(e) => warn!(target: "startup", "configuration reload rejected, keeping current settings: {}", e),
                }
            }
            _ = sigterm.recv() => {
                info!(target: "startup", "received SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!(target: "startup", "received SIGINT");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_dl: &Datalink) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(target: "startup", "received Ctrl-C");
    Ok(())
}
