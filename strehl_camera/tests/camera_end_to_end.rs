//! End-to-end tests of the camera server through the client protocol.

use std::thread;
use std::time::Duration;

use strehl_camera::{
    CameraConfig, CameraServer, CameraServerOptions, MockCamera, RemoteCamera,
};
use strehl_common::{ElType, Shmid};
use strehl_shm::{ServerState, SharedArray, WaitOutput};

fn spawn_server(width: i64, height: i64, nbufs: i64) -> (Shmid, thread::JoinHandle<()>) {
    let device = Box::new(MockCamera::new(width, height));
    let mut server = CameraServer::new(
        "cam-e2e",
        device,
        nbufs,
        CameraServerOptions {
            timeout: 0.05,
            ..CameraServerOptions::default()
        },
    )
    .unwrap();
    let shmid = server.shmid();
    let handle = thread::spawn(move || server.run_loop().unwrap());
    (shmid, handle)
}

fn fast_mono16(width: i64, height: i64) -> CameraConfig {
    let mut cfg = CameraConfig::new(width, height).mono_buffer(16);
    cfg.pixeltype = ElType::U16;
    cfg.framerate = 200.0;
    cfg.exposuretime = 0.001;
    cfg
}

#[test]
fn single_frame_capture() {
    let (shmid, server) = spawn_server(128, 128, 4);
    let cam = RemoteCamera::attach(shmid).unwrap();

    // Slow enough that the 4-slot ring cannot wrap past the frame under
    // inspection while the test is looking at it.
    let mut cfg = fast_mono16(128, 128);
    cfg.framerate = 25.0;
    let num = cam
        .configure(&cfg, 5.0)
        .unwrap()
        .expect("configure queued");
    assert!(!cam.wait_command(num, 5.0).unwrap().timed_out());

    // The configuration now in effect is visible to every client.
    let cfg = cam.config().unwrap();
    assert_eq!(cfg.pixeltype, ElType::U16);
    assert_eq!(cfg.roi.width, 128);

    cam.start(5.0).unwrap().expect("start queued");

    let serial = match cam.wait_output(0, 5.0).unwrap() {
        WaitOutput::Ready(s) => s,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert!(serial >= 1);

    let image_shmid = cam.image_shmid(serial);
    assert!(image_shmid.is_valid());
    let image = SharedArray::attach(image_shmid).unwrap();
    assert_eq!(image.dims(), &[128, 128]);
    assert_eq!(image.eltype(), ElType::U16);
    assert_eq!(image.serial(), serial);

    // The frame holds the deterministic mock gradient.
    image.rdlock().unwrap();
    let data = image.data::<u16>().unwrap();
    let base = data[0] as i64;
    assert_eq!(data[1] as i64, base + 1);
    assert_eq!(data[128] as i64, base + 1);
    image.unlock_read().unwrap();

    cam.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn overwrite_detection_on_short_ring() {
    let (shmid, server) = spawn_server(32, 32, 2);
    let cam = RemoteCamera::attach(shmid).unwrap();

    let num = cam
        .configure(&fast_mono16(32, 32), 5.0)
        .unwrap()
        .expect("configure queued");
    assert!(!cam.wait_command(num, 5.0).unwrap().timed_out());
    cam.start(5.0).unwrap().expect("start queued");

    let first = match cam.wait_output(0, 5.0).unwrap() {
        WaitOutput::Ready(s) => s,
        other => panic!("unexpected outcome {other:?}"),
    };

    // Sleep roughly ten frame periods so the 2-slot ring wraps.
    thread::sleep(Duration::from_millis(100));

    let mut payload = [0xAAu8; 4];
    let info = cam.fetch_frame(first, &mut payload).unwrap();
    assert_eq!(info.serial, -1, "stale ring entry must read as overwritten");
    assert_eq!(payload, [0u8; 4], "outputs must be zero-filled");
    assert_eq!(cam.image_shmid(first), Shmid::BAD);

    cam.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn kill_wakes_blocked_waiters() {
    let (shmid, server) = spawn_server(16, 16, 4);
    let cam = RemoteCamera::attach(shmid).unwrap();

    let waiter = {
        let cam = RemoteCamera::attach(shmid).unwrap();
        thread::spawn(move || cam.wait_output(cam.serial() + 1, 60.0).unwrap())
    };
    thread::sleep(Duration::from_millis(50));

    cam.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
    assert_eq!(waiter.join().unwrap(), WaitOutput::ServerGone);

    let third = RemoteCamera::attach(shmid).unwrap();
    assert_eq!(third.state(), ServerState::Unreachable);
}

#[test]
fn bad_configuration_leaves_the_camera_unchanged() {
    let (shmid, server) = spawn_server(64, 64, 2);
    let cam = RemoteCamera::attach(shmid).unwrap();
    let before = cam.config().unwrap();

    // A ROI beyond the detector is rejected client-side, before queueing.
    let mut bad = fast_mono16(64, 64);
    bad.roi.width = 65;
    assert!(cam.configure(&bad, 5.0).is_err());
    assert_eq!(cam.ncmds(), 0);

    let after = cam.config().unwrap();
    assert_eq!(after.roi, before.roi);

    cam.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}
