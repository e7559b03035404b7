//! Frame-grabber server for a simulated camera.
//!
//! Creates a remote camera backed by the mock device, advertises its
//! segment identifier in the configuration directory, and runs the server
//! loop until a `kill` command (or SIGINT/SIGTERM) arrives.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strehl_camera::{CameraServer, CameraServerOptions, MockCamera};
use strehl_common::config as cfgdir;
use strehl_shm::RemoteObjectInfo;

#[derive(Parser, Debug)]
#[command(name = "strehl_camserver", about = "STREHL mock frame-grabber server")]
struct Args {
    /// Server owner name advertised to clients.
    #[arg(long, default_value = "cam1")]
    owner: String,

    /// Number of output ring buffers.
    #[arg(long, default_value_t = 4)]
    nbufs: i64,

    /// Detector width in pixels.
    #[arg(long, default_value_t = 128)]
    width: i64,

    /// Detector height in pixels.
    #[arg(long, default_value_t = 128)]
    height: i64,

    /// Per-frame acquisition timeout in seconds.
    #[arg(long, default_value_t = 0.1)]
    timeout: f64,

    /// Print a JSON snapshot of the remote camera and exit.
    #[arg(long)]
    probe: bool,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<(), Box<dyn std::error::Error>> {
    let handler = SigHandler::Handler(on_signal);
    unsafe {
        signal::signal(Signal::SIGINT, handler)?;
        signal::signal(Signal::SIGTERM, handler)?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let args = Args::parse();

    if args.probe {
        let shmid = cfgdir::read_shmid(&format!("{}/shmid", args.owner));
        let remote = strehl_shm::RemoteObject::attach(shmid)?;
        println!("{}", RemoteObjectInfo::snapshot(&remote)?.to_json());
        return Ok(());
    }

    install_signal_handlers()?;

    let device = Box::new(MockCamera::new(args.width, args.height));
    let options = CameraServerOptions {
        timeout: args.timeout,
        ..CameraServerOptions::default()
    };
    let mut server = CameraServer::new(&args.owner, device, args.nbufs, options)?;

    // Advertise the shared resource for clients to discover at boot.
    cfgdir::write_shmid(&format!("{}/shmid", args.owner), server.shmid())?;
    info!(owner = %args.owner, shmid = %server.shmid(), "serving");

    // A signal turns into a cooperative kill through the client protocol.
    let watcher = {
        let remote = strehl_camera::RemoteCamera::attach(server.shmid())?;
        std::thread::spawn(move || {
            while remote.is_alive() {
                if INTERRUPTED.load(Ordering::Relaxed) {
                    let _ = remote.kill(1.0);
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        })
    };

    server.run_loop()?;
    INTERRUPTED.store(true, Ordering::Relaxed);
    let _ = watcher.join();
    Ok(())
}
