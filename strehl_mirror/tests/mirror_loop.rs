//! Closed-loop tests of the deformable mirror server.

use std::thread;

use strehl_common::layout::{build_indexed_layout, instantiate_mask};
use strehl_common::Shmid;
use strehl_mirror::{MirrorServer, RemoteMirror};
use strehl_shm::{ObjectFlags, ServerState, WaitOutput};

fn spawn_mirror(nacts_grid: i64, cmin: f64, cmax: f64) -> (Shmid, thread::JoinHandle<()>) {
    let dim = nacts_grid;
    let mask = instantiate_mask(dim, dim, dim * dim).unwrap();
    let mut inds = vec![0i64; (dim * dim) as usize];
    build_indexed_layout(Some(&mut inds), &mask, dim, dim, 0).unwrap();
    let dm = RemoteMirror::create("dm-e2e", 4, &inds, [dim, dim], cmin, cmax, ObjectFlags::empty())
        .unwrap();
    let shmid = dm.shmid();
    let handle = thread::spawn(move || {
        let mut server = MirrorServer::new(dm);
        server
            .run_loop(&mut |_, _effective| Ok(()))
            .unwrap();
    });
    (shmid, handle)
}

#[test]
fn commands_clamp_to_the_actuator_range() {
    // 10x10 grid, 100 actuators, commands bounded to [-1, +1].
    let (shmid, server) = spawn_mirror(10, -1.0, 1.0);
    let dm = RemoteMirror::attach(shmid).unwrap();
    let nacts = dm.nacts() as usize;
    assert_eq!(nacts, 100);

    // Reference starts at the midpoint, zero here.
    assert!(dm.reference().unwrap().iter().all(|&v| v == 0.0));

    let request = vec![1.5; nacts];
    let (cmdnum, datnum) = dm
        .send_commands(&request, 42, 1.0)
        .unwrap()
        .expect("send queued");
    assert!(!dm.wait_command(cmdnum, 5.0).unwrap().timed_out());

    match dm.wait_output(datnum, 5.0).unwrap() {
        WaitOutput::Ready(s) => assert_eq!(s, datnum),
        other => panic!("unexpected outcome {other:?}"),
    }
    let (info, frame) = dm.fetch_data(datnum).unwrap();
    assert_eq!(info.serial, datnum);
    assert_eq!(info.mark, 42);
    assert!(frame.effective.iter().all(|&v| v == 1.0), "clamped to +1");
    assert!(frame.requested.iter().all(|&v| v == 1.5));

    dm.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn new_reference_applies_to_subsequent_frames() {
    let (shmid, server) = spawn_mirror(4, -2.0, 2.0);
    let dm = RemoteMirror::attach(shmid).unwrap();
    let nacts = dm.nacts() as usize;

    let reference = vec![0.25; nacts];
    let (cmdnum, _datnum) = dm
        .set_reference(&reference, 1.0)
        .unwrap()
        .expect("reference queued");
    assert!(!dm.wait_command(cmdnum, 5.0).unwrap().timed_out());

    let (_, datnum) = dm
        .send_commands(&vec![0.5; nacts], 7, 1.0)
        .unwrap()
        .expect("send queued");
    match dm.wait_output(datnum, 5.0).unwrap() {
        WaitOutput::Ready(_) => {}
        other => panic!("unexpected outcome {other:?}"),
    }
    let (_, frame) = dm.fetch_data(datnum).unwrap();
    assert!(frame.reference.iter().all(|&v| v == 0.25));
    assert!(frame.effective.iter().all(|&v| v == 0.75));

    dm.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn perturbation_is_consumed_by_one_send() {
    let (shmid, server) = spawn_mirror(4, -1.0, 1.0);
    let dm = RemoteMirror::attach(shmid).unwrap();
    let nacts = dm.nacts() as usize;

    let (cmdnum, _) = dm
        .set_perturbation(&vec![0.5; nacts], 1.0)
        .unwrap()
        .expect("perturbation queued");
    assert!(!dm.wait_command(cmdnum, 5.0).unwrap().timed_out());

    // First send sees the perturbation.
    let (_, d1) = dm.send_commands(&vec![0.0; nacts], 1, 1.0).unwrap().unwrap();
    assert!(matches!(dm.wait_output(d1, 5.0).unwrap(), WaitOutput::Ready(_)));
    let (_, f1) = dm.fetch_data(d1).unwrap();
    assert!(f1.perturbation.iter().all(|&v| v == 0.5));
    assert!(f1.effective.iter().all(|&v| v == 0.5));

    // The next send runs without it.
    let (_, d2) = dm.send_commands(&vec![0.0; nacts], 2, 1.0).unwrap().unwrap();
    assert!(matches!(dm.wait_output(d2, 5.0).unwrap(), WaitOutput::Ready(_)));
    let (_, f2) = dm.fetch_data(d2).unwrap();
    assert!(f2.perturbation.iter().all(|&v| v == 0.0));
    assert!(f2.effective.iter().all(|&v| v == 0.0));

    dm.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn reset_is_an_all_zero_send() {
    let (shmid, server) = spawn_mirror(4, -1.0, 1.0);
    let dm = RemoteMirror::attach(shmid).unwrap();
    let nacts = dm.nacts() as usize;

    let (_, d1) = dm.send_commands(&vec![0.9; nacts], 1, 1.0).unwrap().unwrap();
    assert!(matches!(dm.wait_output(d1, 5.0).unwrap(), WaitOutput::Ready(_)));

    let (_, d2) = dm.reset(9, 1.0).unwrap().unwrap();
    assert!(matches!(dm.wait_output(d2, 5.0).unwrap(), WaitOutput::Ready(_)));
    let (info, frame) = dm.fetch_data(d2).unwrap();
    assert_eq!(info.mark, 9);
    assert!(frame.requested.iter().all(|&v| v == 0.0));

    dm.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
}

#[test]
fn server_callback_may_clip_further() {
    let dim = 3i64;
    let mask = instantiate_mask(dim, dim, dim * dim).unwrap();
    let mut inds = vec![0i64; (dim * dim) as usize];
    build_indexed_layout(Some(&mut inds), &mask, dim, dim, 0).unwrap();
    let dm = RemoteMirror::create("dm-clip", 2, &inds, [dim, dim], -1.0, 1.0, ObjectFlags::empty())
        .unwrap();
    let shmid = dm.shmid();
    let server = thread::spawn(move || {
        let mut server = MirrorServer::new(dm);
        server
            .run_loop(&mut |_, effective| {
                for v in effective.iter_mut() {
                    *v = v.clamp(-0.5, 0.5);
                }
                Ok(())
            })
            .unwrap();
    });

    let client = RemoteMirror::attach(shmid).unwrap();
    let nacts = client.nacts() as usize;
    let (_, datnum) = client
        .send_commands(&vec![1.0; nacts], 0, 1.0)
        .unwrap()
        .expect("send queued");
    assert!(matches!(
        client.wait_output(datnum, 5.0).unwrap(),
        WaitOutput::Ready(_)
    ));
    let (_, frame) = client.fetch_data(datnum).unwrap();
    assert!(frame.effective.iter().all(|&v| v == 0.5));

    client.kill(5.0).unwrap().expect("kill queued");
    server.join().unwrap();
    assert_eq!(client.state(), ServerState::Unreachable);
}
