//! ipp-usb: bridges IPP-over-USB printers and scanners onto loopback
//! HTTP/1.1 and DNS-SD, the way a normal network printer would appear.
//!
//! Entry point: parse args, load config, set up logging, spawn the
//! long-lived PnP controller subsystem (`pnp.rs`), wait for a shutdown
//! signal, tear down.

mod cli;
mod config;
mod ctrl;
mod device_instance;
mod device_state;
mod dnssd;
mod error;
mod ini_ext;
mod ipp;
mod lockfile;
mod metrics;
mod pnp;
mod probe;
mod proxy;
mod quirks;
mod service;
mod usb;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use common::{create_usb_bridge, setup_logging};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cli::{Cli, Command};
use config::Config;
use pnp::{ExitReason, PnpController};
use quirks::QuirksDb;

fn state_dir() -> PathBuf {
    PathBuf::from("/var/ipp-usb/dev")
}

fn log_dir() -> PathBuf {
    PathBuf::from("/var/ipp-usb/log")
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("ipp-usb: failed to start async runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ipp-usb: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load_or_default();
    let default_level = if cli.command.forces_debug_logging() { "debug" } else { "info" };
    setup_logging(default_level, config.logging.console_color).map_err(|e| anyhow::anyhow!("{e}"))?;

    if matches!(cli.command, Command::Check) {
        return run_check();
    }

    let mode_args = cli.command.mode_args().unwrap_or_default();
    if mode_args.background {
        warn!("-bg requested; ipp-usb does not self-daemonize, run it under an init system for background operation");
    }

    let lock_path = lockfile::default_path();
    let mut lock = lockfile::LockFile::acquire(&lock_path)?;
    let _guard = lock.try_guard()?;
    info!("acquired process lock at {}", lock_path.display());

    let state_dir = state_dir();
    let log_dir = log_dir();
    std::fs::create_dir_all(&state_dir)?;
    std::fs::create_dir_all(&log_dir)?;

    let quirks_db = QuirksDb::load_default_dirs()?;
    info!("loaded {} quirks rule(s)", quirks_db.rule_count());

    let context = rusb::Context::new()?;
    let (bridge, worker) = create_usb_bridge();
    let _hotplug_thread = usb::worker::spawn(context.clone(), worker);

    let status = ctrl::new_status_handle();
    let ctrl_cancel = CancellationToken::new();
    let ctrl_path = ctrl::default_path();
    let ctrl_task = {
        let status = status.clone();
        let cancel = ctrl_cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = ctrl::serve(&ctrl_path, status, cancel).await {
                warn!("control socket exited: {e}");
            }
        })
    };

    let controller = PnpController::new(
        context,
        bridge,
        quirks_db,
        config.network.clone(),
        config.logging.clone(),
        state_dir,
        log_dir,
        cli.command.exit_when_idle(),
        status,
    );

    service::notify_ready().ok();
    let watchdog = service::spawn_watchdog_task().await.ok();

    let reason = controller.run().await;
    match reason {
        ExitReason::Signal => info!("shutdown complete"),
        ExitReason::Idle => info!("no devices remained; exiting (udev mode)"),
    }

    service::notify_stopping().ok();
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    ctrl_cancel.cancel();
    let _ = ctrl_task.await;

    Ok(())
}

fn run_check() -> anyhow::Result<()> {
    let config_path = Config::system_path();
    let config_result = if config_path.exists() {
        Config::load(&config_path)
    } else if let Some(adjacent) = Config::adjacent_path().filter(|p| p.exists()) {
        Config::load(&adjacent)
    } else {
        Ok(Config::default())
    };

    let quirks_result = QuirksDb::load_default_dirs();

    let mut ok = true;
    match &config_result {
        Ok(_) => println!("configuration: OK"),
        Err(e) => {
            ok = false;
            println!("configuration: ERROR: {e}");
        }
    }
    match &quirks_result {
        Ok(db) => println!("quirks: OK ({} rule(s) loaded)", db.rule_count()),
        Err(e) => {
            ok = false;
            println!("quirks: ERROR: {e}");
        }
    }

    if ok {
        Ok(())
    } else {
        anyhow::bail!("configuration or quirks validation failed")
    }
}
