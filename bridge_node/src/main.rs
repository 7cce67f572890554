/// Bridge node
///
/// Runs the node firmware loop on a host: bring-up against the loopback
/// agent, then a fixed-rate loop of poll and indicator toggle until Ctrl+C.
/// A failed bring-up enters the fault loop and never returns.
mod agent;

use anyhow::Context;
use bridge_core::communication::loopback;
use bridge_core::error::{CheckFailure, MwError};
use bridge_core::hal::{Clock, ConsoleDiagnostics, Indicator, LogIndicator, PinMode, SystemClock};
use bridge_core::{BridgeConfig, FaultController, NodeRuntime};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bridge_node")]
#[command(about = "Microcontroller bridge node running against a loopback agent", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Inject a control request every N milliseconds
    #[arg(long, value_name = "MS")]
    inject: Option<u64>,

    /// Publisher creations the agent refuses before accepting
    #[arg(long, default_value_t = 0)]
    agent_warmup: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the diagnostic stream
    let default_filter = if args.verbose {
        "bridge_node=debug,bridge_core=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    info!(?config, "configuration loaded");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("\nCtrl+C received! Shutting down bridge node...");
            running.store(false, Ordering::SeqCst);
            std::thread::spawn(|| {
                std::thread::sleep(Duration::from_secs(2));
                eprintln!("Force terminating bridge node...");
                std::process::exit(0);
            });
        }) {
            warn!(error = %e, "failed to set signal handler");
        }
    }

    let (session, agent) = loopback(args.agent_warmup);
    let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
    let pump = agent::spawn(
        agent,
        args.inject.map(Duration::from_millis),
        config.service.topic.clone(),
        shutdown_rx,
    )
    .context("failed to start loopback agent")?;

    let mut indicator = LogIndicator::new(config.runtime.indicator_pin);
    indicator.set_mode(PinMode::Output)?;

    let mut node = NodeRuntime::new(
        session,
        SystemClock::new(),
        Box::new(ConsoleDiagnostics::new()),
        config.clone(),
    );

    node.diagnostics_mut().write_line("Initializing:");
    node.clock().delay(config.runtime.startup_delay());

    if let Err(err) = node.initialize() {
        error!(error = %err, "bring-up failed");
        FaultController::from_config(indicator, &config.runtime).error_loop(&mut node);
    }

    indicator.write(true)?;
    node.diagnostics_mut().write_line("Startup complete!");
    node.diagnostics_mut().write_str("[Looping]");

    let loop_period = config.runtime.loop_period();
    let spin_timeout = config.runtime.spin_timeout();
    while running.load(Ordering::SeqCst) {
        node.clock().delay(loop_period);
        node.diagnostics_mut().write_str("\n. ");
        if let Err(err) = node.spin_some(spin_timeout) {
            let failure = CheckFailure::capture(MwError::new(err.ret_code(), err.to_string()));
            node.diagnostics_mut().report(&failure);
        }
        indicator.toggle()?;
    }

    node.diagnostics_mut().write_line("");
    if let Some(report) = node.teardown() {
        info!(
            code = %report.code,
            buffers = report.buffers_released,
            "node shut down"
        );
    }
    let stats = node.stats().clone();
    info!(
        polls = stats.polls,
        dispatched = stats.dispatched,
        soft_errors = stats.soft_errors,
        published = node.counter().value(),
        "runtime summary"
    );

    drop(shutdown_tx);
    if pump.join().is_err() {
        warn!("loopback agent thread panicked");
    }
    Ok(())
}
