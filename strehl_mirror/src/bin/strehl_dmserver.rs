//! Deformable mirror server.
//!
//! Creates a remote deformable mirror with a centred actuator layout,
//! advertises its segment identifier in the configuration directory, and
//! runs the telemetry loop until a `kill` command (or SIGINT/SIGTERM)
//! arrives.

use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use nix::sys::signal::{self, SigHandler, Signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strehl_common::config as cfgdir;
use strehl_common::layout::{build_indexed_layout, instantiate_mask};
use strehl_mirror::{MirrorServer, RemoteMirror};
use strehl_shm::ObjectFlags;

#[derive(Parser, Debug)]
#[command(name = "strehl_dmserver", about = "STREHL deformable mirror server")]
struct Args {
    /// Server owner name advertised to clients.
    #[arg(long, default_value = "dm1")]
    owner: String,

    /// Number of telemetry ring buffers.
    #[arg(long, default_value_t = 8)]
    nbufs: i64,

    /// First dimension of the actuator grid.
    #[arg(long, default_value_t = 11)]
    dim1: i64,

    /// Second dimension of the actuator grid.
    #[arg(long, default_value_t = 11)]
    dim2: i64,

    /// Number of active actuators (centred disk); grid cells by default.
    #[arg(long)]
    nacts: Option<i64>,

    /// Minimal actuator command value.
    #[arg(long, default_value_t = -1.0)]
    cmin: f64,

    /// Maximal actuator command value.
    #[arg(long, default_value_t = 1.0)]
    cmax: f64,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();
    let args = Args::parse();

    let handler = SigHandler::Handler(on_signal);
    unsafe {
        signal::signal(Signal::SIGINT, handler)?;
        signal::signal(Signal::SIGTERM, handler)?;
    }

    let nacts = args.nacts.unwrap_or(args.dim1 * args.dim2);
    let mask = instantiate_mask(args.dim1, args.dim2, nacts)?;
    let mut inds = vec![0i64; (args.dim1 * args.dim2) as usize];
    build_indexed_layout(Some(&mut inds), &mask, args.dim1, args.dim2, 0)?;

    let mirror = RemoteMirror::create(
        &args.owner,
        args.nbufs,
        &inds,
        [args.dim1, args.dim2],
        args.cmin,
        args.cmax,
        ObjectFlags::empty(),
    )?;
    cfgdir::write_shmid(&format!("{}/shmid", args.owner), mirror.shmid())?;
    info!(owner = %args.owner, shmid = %mirror.shmid(), nacts = mirror.nacts(), "serving");

    let watcher = {
        let remote = RemoteMirror::attach(mirror.shmid())?;
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

    let mut server = MirrorServer::new(mirror);
    server.run_loop(&mut |_, _effective| Ok(()))?;
    INTERRUPTED.store(true, Ordering::Relaxed);
    let _ = watcher.join();
    Ok(())
}
