use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use nix::fcntl::{flock, FlockArg};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use camnode::camera::FileCamera;
use camnode::clock::InstantClock;
use camnode::config::SystemConfig;
use camnode::controller::NodeController;
use camnode::error::Fault;
use camnode::net::{self, InterfaceLinkProbe};
use camnode::ota::{HttpFirmwareUpdater, OtaPoller};
use camnode::protocol::Identity;
use camnode::status::NodeStatus;
use camnode::timer::{FireSignal, ThreadTimer};
use camnode::traits::{LinkProbe, MonotonicClock};
use camnode::transport::TcpChannel;

const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; missing fields use defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    device_id: Option<String>,

    #[arg(short, long)]
    interface: Option<String>,

    /// Serve this file as the captured frame
    #[arg(long)]
    image: Option<String>,

    /// Enable firmware updates from this server
    #[arg(long)]
    ota_url: Option<String>,
}

fn load_config(args: &Args) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };

    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(id) = &args.device_id {
        config.identity.device_id = Some(id.clone());
    }
    if let Some(iface) = &args.interface {
        config.identity.interface = Some(iface.clone());
    }
    if let Some(image) = &args.image {
        config.capture.image_path = Some(image.clone());
    }
    if let Some(url) = &args.ota_url {
        config.ota.enabled = true;
        config.ota.base_url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

fn acquire_singleton_lock() -> Result<File> {
    lock_file_at(&std::env::temp_dir().join("camnode.lock"))
}

fn lock_file_at(lock_path: &Path) -> Result<File> {
    let file = File::create(lock_path)
        .map_err(|e| anyhow!("Failed to create lock file {}: {}", lock_path.display(), e))?;

    #[cfg(unix)]
    {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(_) => Ok(file),
            Err(nix::errno::Errno::EAGAIN) => Err(anyhow!(
                "Another instance of camnode is already running! (Lockfile: {})",
                lock_path.display()
            )),
            Err(e) => Err(e.into()),
        }
    }
    #[cfg(not(unix))]
    {
        Ok(file)
    }
}

/// Block until the link is usable or the boot timeout runs out.
fn wait_for_link<L: LinkProbe>(probe: &L, timeout: Duration) -> bool {
    let start = Instant::now();
    let mut polls = 0u32;
    while start.elapsed() < timeout {
        if probe.is_link_up() {
            info!("[LINK] Up after {} polls", polls);
            return true;
        }
        polls += 1;
        thread::sleep(Duration::from_millis(500));
    }
    probe.is_link_up()
}

fn build_identity(config: &SystemConfig, iface: Option<&str>) -> Identity {
    let device_id = config
        .identity
        .device_id
        .clone()
        .unwrap_or_else(|| format!("cam-{}", uuid::Uuid::new_v4().simple()));
    let mac = iface
        .and_then(net::read_mac_address)
        .unwrap_or_else(|| "00:00:00:00:00:00".to_string());

    Identity {
        device_id,
        mac,
        firmware_version: FIRMWARE_VERSION.to_string(),
        board_type: config.identity.board_type.clone().unwrap_or_else(|| "HOST".to_string()),
    }
}

fn spawn_ota_thread(config: &SystemConfig, board: String, running: Arc<AtomicBool>) -> Result<()> {
    let base_url = config
        .ota
        .base_url
        .clone()
        .ok_or_else(|| anyhow!("OTA enabled but no base_url configured"))?;
    let updater = HttpFirmwareUpdater::new(
        &base_url,
        &board,
        FIRMWARE_VERSION,
        config.ota.auth_token.clone(),
        PathBuf::from(&config.ota.staging_dir),
    )?;
    let mut poller = OtaPoller::new(updater, config.ota.check_interval_secs);
    info!("[OTA] Checking {} every {:.0}s", base_url, config.ota.check_interval_secs);

    thread::Builder::new().name("ota".to_string()).spawn(move || {
        let clock = InstantClock::new();
        while running.load(Ordering::SeqCst) {
            if let Some(version) = poller.poll(clock.monotonic_secs()) {
                info!("[OTA] Firmware {} staged, restarting", version);
                running.store(false, Ordering::SeqCst);
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }
    })?;
    Ok(())
}

fn notify(state: &str) {
    #[cfg(unix)]
    {
        let result = match state {
            "ready" => sd_notify::notify(false, &[sd_notify::NotifyState::Ready]),
            _ => sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]),
        };
        if let Err(e) = result {
            warn!("sd_notify {} failed: {}", state, e);
        }
    }
    #[cfg(not(unix))]
    let _ = state;
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let mut config = load_config(&args)?;

    let _lock_file = match acquire_singleton_lock() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let link_probe = InterfaceLinkProbe::new(config.identity.interface.clone());
    let link_timeout = Duration::try_from_secs_f64(config.boot.link_timeout_secs)?;
    if !wait_for_link(&link_probe, link_timeout) {
        error!("[LINK] {} after {:.0}s, giving up", Fault::LinkUnavailable, config.boot.link_timeout_secs);
        std::process::exit(1);
    }

    // Name lookup blocks, so it happens once here and never inside the tick
    match config.server.resolve() {
        Ok(server) => {
            info!("Server {}:{} resolved to {}", config.server.host, config.server.port, server.host);
            config.server = server;
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    let iface = match net::get_default_interface(config.identity.interface.as_deref()) {
        Ok((name, ip)) => {
            info!("Selected Interface: {} ({})", name, ip);
            Some(name)
        }
        Err(e) => {
            warn!("Could not resolve interface: {}", e);
            None
        }
    };
    let identity = build_identity(&config, iface.as_deref());

    if config.ota.enabled {
        if let Err(e) = spawn_ota_thread(&config, identity.board_type.clone(), running.clone()) {
            warn!("[OTA] Disabled: {}", e);
        }
    }

    let signal = FireSignal::new();
    let timer = ThreadTimer::new(signal.clone());
    let channel = TcpChannel::new(Duration::try_from_secs_f64(config.session.connect_timeout_secs)?);
    let camera = FileCamera::new(&config.capture);
    let status = Arc::new(RwLock::new(NodeStatus::default()));
    let tick = Duration::from_millis(config.boot.tick_interval_ms);

    let mut controller = NodeController::new(
        link_probe,
        channel,
        camera,
        timer,
        signal,
        InstantClock::new(),
        identity,
        status,
        config,
    );

    notify("ready");
    info!("Starting control loop...");
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        if last_log.elapsed() >= Duration::from_secs(10) {
            controller.log_status();
            last_log = Instant::now();
        }

        if let Err(e) = controller.process_loop_iteration() {
            warn!("Error in loop: {}", e);
        }

        thread::sleep(tick);
    }

    notify("stopping");
    controller.request_close();
    info!("Exiting.");
    Ok(())
}
