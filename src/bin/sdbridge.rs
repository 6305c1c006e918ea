//! sdbridge host simulator
//!
//! Runs the upload engine against a card directory and mirrors day folders
//! into a destination directory. Bus, link and pulse counter are simulated;
//! a restart request rebuilds the controller from persisted state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use sdbridge::bus::SimulatedBus;
use sdbridge::clock::{Clock, SystemClock};
use sdbridge::config::ControllerConfig;
use sdbridge::controller::{Controller, ControllerParts, SimulatedSystem};
use sdbridge::fsm::Command;
use sdbridge::network::{GuardConfig, NetworkGuard, SimulatedLink};
use sdbridge::storage::{FileSystem, LocalFileSystem};
use sdbridge::traffic::SimulatedPulseCounter;
use sdbridge::transfer::{DirectoryBackend, UploadWorker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "sdbridge")]
#[command(about = "Mirror a data card to a destination while sharing its bus", long_about = None)]
struct Args {
    /// Directory standing in for the card (contains DATALOG/)
    #[arg(long)]
    card: PathBuf,

    /// Upload destination directory
    #[arg(long)]
    dest: PathBuf,

    /// Directory standing in for internal flash (state files)
    #[arg(long)]
    state: PathBuf,

    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control loop period in milliseconds
    #[arg(long, default_value = "50")]
    tick_ms: u64,

    /// Queue an immediate upload after each boot
    #[arg(long)]
    upload_now: bool,

    /// Exit after this many restarts instead of rebooting forever
    #[arg(long)]
    max_restarts: Option<u32>,
}

struct Host {
    config: ControllerConfig,
    card: Arc<dyn FileSystem>,
    flash: Arc<dyn FileSystem>,
    dest: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    bus: SimulatedBus,
    link: SimulatedLink,
    system: SimulatedSystem,
}

impl Host {
    fn boot(&self) -> Result<Controller> {
        let guard = Arc::new(NetworkGuard::new(
            Arc::new(self.link.clone()),
            GuardConfig::default(),
        ));
        let worker = UploadWorker::new(
            Arc::clone(&self.card),
            Arc::new(DirectoryBackend::new(Arc::clone(&self.dest))),
            guard,
            WorkerConfig::from(&self.config),
        );
        let controller = Controller::boot(ControllerParts {
            config: self.config.clone(),
            system_fs: Arc::clone(&self.flash),
            worker: Arc::new(worker),
            bus: Box::new(self.bus.clone()),
            counter: Box::new(SimulatedPulseCounter::new()),
            clock: Arc::clone(&self.clock),
            system: Box::new(self.system.clone()),
        })?;
        Ok(controller)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    let host = Host {
        config,
        card: Arc::new(
            LocalFileSystem::new(&args.card)
                .with_context(|| format!("opening card dir {}", args.card.display()))?,
        ),
        flash: Arc::new(
            LocalFileSystem::new(&args.state)
                .with_context(|| format!("opening state dir {}", args.state.display()))?,
        ),
        dest: Arc::new(
            LocalFileSystem::new(&args.dest)
                .with_context(|| format!("opening destination {}", args.dest.display()))?,
        ),
        clock: Arc::new(SystemClock::new()),
        bus: SimulatedBus::new(),
        link: SimulatedLink::new(Duration::from_secs(2)),
        system: SimulatedSystem::new(),
    };

    let mut restarts = 0u32;
    let mut controller = host.boot().context("booting controller")?;
    if args.upload_now {
        controller.commands().send(Command::UploadNow);
    }

    let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted, shutting down in {}", controller.state());
                return Ok(());
            }
        }

        let reason = match controller.tick() {
            Some(reason) => reason,
            None => continue,
        };

        restarts += 1;
        if args.max_restarts.map_or(false, |max| restarts >= max) {
            log::info!("Restart {} ({:?}), limit reached", restarts, reason);
            return Ok(());
        }
        log::info!("Rebooting controller ({:?})", reason);
        drop(controller);
        controller = host.boot().context("rebooting controller")?;
        if args.upload_now {
            controller.commands().send(Command::UploadNow);
        }
    }
}
