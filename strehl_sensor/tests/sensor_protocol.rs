//! End-to-end tests of the wavefront sensor server.

use std::thread;

use strehl_common::Shmid;
use strehl_sensor::{
    BoundingBox, Position, RemoteSensor, SensorConfig, SensorServer, ShackConfig, ShackData,
    SubImage,
};
use strehl_shm::{ObjectFlags, ServerState, WaitOutput};

fn sample_config() -> SensorConfig {
    SensorConfig {
        shack: ShackConfig::new([2, 1], 2),
        camera_owner: "cam1".to_string(),
        camera_shmid: Shmid::BAD,
        camera_width: 16,
        camera_height: 8,
        inds: vec![0, 1],
        subs: vec![
            SubImage {
                bbox: BoundingBox { xmin: 0, xmax: 7, ymin: 0, ymax: 7 },
                refpos: Position { x: 3.5, y: 3.5 },
            },
            SubImage {
                bbox: BoundingBox { xmin: 8, xmax: 15, ymin: 0, ymax: 7 },
                refpos: Position { x: 11.5, y: 3.5 },
            },
        ],
    }
}

fn spawn_sensor() -> (Shmid, thread::JoinHandle<()>) {
    let wfs = RemoteSensor::create("wfs-e2e", 4, 16, 8, ObjectFlags::empty()).unwrap();
    let shmid = wfs.shmid();
    let handle = thread::spawn(move || {
        let mut server = SensorServer::new(wfs);
        let mut tick: i64 = 0;
        server
            .run_loop(&mut |_cfg, data| {
                // Synthetic measurements: a slope growing with time.
                tick += 1;
                for (k, d) in data.iter_mut().enumerate() {
                    *d = ShackData::default();
                    d.pos.x = 0.01 * tick as f64;
                    d.pos.y = -0.01 * tick as f64;
                    d.alpha = 100.0 + k as f64;
                    d.eta = 1.0;
                }
                Ok(Some(tick))
            })
            .unwrap();
    });
    (shmid, handle)
}

#[test]
fn configure_start_measure_fetch() {
    let (shmid, server) = spawn_sensor();
    let wfs = RemoteSensor::attach(shmid).unwrap();

    let num = wfs
        .configure(&sample_config(), 5.0)
        .unwrap()
        .expect("configure queued");
    assert!(!wfs.wait_command(num, 5.0).unwrap().timed_out());

    // wait_command is sufficient to observe the new layout.
    let installed = wfs.config().unwrap();
    assert_eq!(installed.subs.len(), 2);
    assert_eq!(installed.camera_owner, "cam1");

    wfs.start(5.0).unwrap().expect("start queued");
    let serial = match wfs.wait_output(0, 5.0).unwrap() {
        WaitOutput::Ready(s) => s,
        other => panic!("unexpected outcome {other:?}"),
    };
    let (info, data) = wfs.fetch_data(serial).unwrap();
    assert_eq!(info.serial, serial);
    assert_eq!(data.len(), 2);
    assert_eq!(data[0].eta, 1.0);
    assert_eq!(data[1].alpha, 101.0);

    wfs.stop(5.0).unwrap().expect("stop queued");
    wfs.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
    assert_eq!(wfs.state(), ServerState::Unreachable);
}

#[test]
fn invalid_proposals_never_reach_the_server() {
    let (shmid, server) = spawn_sensor();
    let wfs = RemoteSensor::attach(shmid).unwrap();

    // Out-of-capacity grid.
    let mut too_big = sample_config();
    too_big.shack.dims = [5, 4];
    too_big.inds = vec![-1; 20];
    assert!(wfs.configure(&too_big, 5.0).is_err());

    // Bounding box outside the camera frame.
    let mut bad_box = sample_config();
    bad_box.subs[1].bbox.xmax = 100;
    assert!(wfs.configure(&bad_box, 5.0).is_err());

    // Grid entry naming a nonexistent sub-image.
    let mut bad_ind = sample_config();
    bad_ind.inds[0] = 7;
    assert!(wfs.configure(&bad_ind, 5.0).is_err());

    // Nothing was queued and the primary configuration is untouched.
    assert_eq!(wfs.ncmds(), 0);
    assert_eq!(wfs.config().unwrap().subs.len(), 1);

    wfs.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn reconfiguration_replaces_the_layout() {
    let (shmid, server) = spawn_sensor();
    let wfs = RemoteSensor::attach(shmid).unwrap();

    let num = wfs
        .configure(&sample_config(), 5.0)
        .unwrap()
        .expect("configure queued");
    assert!(!wfs.wait_command(num, 5.0).unwrap().timed_out());
    assert_eq!(wfs.config().unwrap().subs.len(), 2);

    let mut smaller = sample_config();
    smaller.shack.dims = [1, 1];
    smaller.shack.nsubs = 1;
    smaller.inds = vec![0];
    smaller.subs.truncate(1);
    let num = wfs.configure(&smaller, 5.0).unwrap().expect("queued");
    assert!(!wfs.wait_command(num, 5.0).unwrap().timed_out());

    let now = wfs.config().unwrap();
    assert_eq!(now.subs.len(), 1);
    assert_eq!(now.shack.dims, [1, 1]);

    wfs.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn tuning_applies_without_a_command() {
    let (shmid, server) = spawn_sensor();
    let wfs = RemoteSensor::attach(shmid).unwrap();

    let num = wfs
        .configure(&sample_config(), 5.0)
        .unwrap()
        .expect("configure queued");
    assert!(!wfs.wait_command(num, 5.0).unwrap().timed_out());

    let mut tuned = wfs.config().unwrap().shack;
    tuned.forgetting_factor = 0.125;
    tuned.max_excursion = 2.0;
    wfs.tune_config(&tuned).unwrap();
    let now = wfs.config().unwrap().shack;
    assert_eq!(now.forgetting_factor, 0.125);
    assert_eq!(now.max_excursion, 2.0);

    wfs.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}
