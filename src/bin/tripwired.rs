//! tripwired - tripwire capture and PPE inspection daemon
//!
//! This daemon:
//! 1. Subscribes to the camera's line-crossing alarm stream
//! 2. Captures one snapshot per alarm, at most one per cooldown window
//! 3. Inspects every capture with the configured detectors
//! 4. Records an annotated incident for each capture that shows a violation
//!
//! Both loops restart with backoff until Ctrl-C.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tripwire_inspector::config::TripwireConfig;
use tripwire_inspector::{
    detect, supervise, CaptureGate, DahuaCamera, DetectionConsumer, EventMonitor,
    SqliteIncidentStore, SystemClock,
};

const MONITOR_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file. Every setting has a default.
    #[arg(long, env = "TRIPWIRE_CONFIG")]
    config: Option<PathBuf>,
    /// Load and validate the configuration, then exit.
    #[arg(long)]
    check_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = TripwireConfig::load_from(args.config.as_deref())?;
    if args.check_config {
        log::info!(
            "config ok: camera {} ({} detectors, db {})",
            cfg.camera.base_url(),
            cfg.detectors.len(),
            cfg.db_path
        );
        return Ok(());
    }

    let registry = detect::load_registry(&cfg.detectors)?;
    registry.warm_up()?;
    let policy = cfg.policy.build()?;
    let camera = Arc::new(DahuaCamera::new(cfg.camera.dahua())?);

    // One connection per loop; they meet only in the database.
    let capture_store = SqliteIncidentStore::open(&cfg.db_path)?;
    let consumer_store = SqliteIncidentStore::open(&cfg.db_path)?;

    let gate = Arc::new(CaptureGate::new(
        camera.clone(),
        Arc::new(SystemClock),
        cfg.cooldown,
        capture_store,
    ));
    let mut consumer =
        DetectionConsumer::new(consumer_store, registry, policy, cfg.consumer.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    log::info!(
        "tripwired running: camera {} code={} cooldown={:?} db={}",
        cfg.camera.base_url(),
        cfg.camera.alarm_code,
        cfg.cooldown,
        cfg.db_path
    );

    let monitor = EventMonitor::new(camera, gate, shutdown.clone())
        .with_alarm_code(&cfg.camera.alarm_code);
    let monitor_shutdown = shutdown.clone();
    let monitor_backoff = cfg.supervisor.backoff();
    let monitor_handle = std::thread::spawn(move || {
        supervise("event monitor", &monitor_shutdown, monitor_backoff, || {
            monitor.run()
        })
    });

    let consumer_shutdown = shutdown.clone();
    let consumer_backoff = cfg.supervisor.backoff();
    let consumer_handle = std::thread::spawn(move || {
        supervise(
            "detection consumer",
            &consumer_shutdown,
            consumer_backoff,
            || consumer.run(&consumer_shutdown),
        )
    });

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    log::info!("shutdown signal received, stopping...");

    match consumer_handle.join() {
        Ok(restarts) => log::info!("detection consumer stopped after {} restarts", restarts),
        Err(_) => log::error!("detection consumer thread panicked"),
    }

    // A blocked stream read only returns at the next line or read timeout.
    let deadline = Instant::now() + MONITOR_STOP_GRACE;
    while !monitor_handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if monitor_handle.is_finished() {
        match monitor_handle.join() {
            Ok(restarts) => log::info!("event monitor stopped after {} restarts", restarts),
            Err(_) => log::error!("event monitor thread panicked"),
        }
    } else {
        log::warn!("event monitor still blocked on the alarm stream; exiting anyway");
    }

    Ok(())
}
