//! Ring publication benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use strehl_shm::{
    align_up, ObjectFlags, ObjectType, RemoteObject, ServerState, WaitOutput, DATA_ALIGNMENT,
    FRAME_HEADER_SIZE, REMOTE_HEADER_SIZE,
};

fn new_remote(nbufs: i64, payload: usize) -> RemoteObject {
    let offset = align_up(REMOTE_HEADER_SIZE, DATA_ALIGNMENT);
    let stride = align_up(FRAME_HEADER_SIZE + payload, DATA_ALIGNMENT);
    let obj = RemoteObject::create(
        "bench",
        ObjectType::RemoteObject,
        nbufs,
        offset,
        stride,
        offset + nbufs as usize * stride,
        ObjectFlags::empty(),
    )
    .unwrap();
    obj.announce_state(ServerState::Waiting).unwrap();
    obj
}

fn bench_publish(c: &mut Criterion) {
    let obj = new_remote(16, 4096);
    let frame = vec![0x5Au8; 4096];

    c.bench_function("publish_4k_frame", |b| {
        b.iter(|| {
            let serial = obj
                .publish_frame(0, |payload| {
                    payload[..frame.len()].copy_from_slice(&frame);
                    Ok(())
                })
                .unwrap();
            black_box(serial);
        });
    });
}

fn bench_publish_and_fetch(c: &mut Criterion) {
    let obj = new_remote(16, 4096);
    let mut out = vec![0u8; 4096];

    c.bench_function("publish_then_fetch_4k", |b| {
        b.iter(|| {
            let serial = obj.publish_frame(0, |payload| {
                payload[0] = 1;
                Ok(())
            })
            .unwrap();
            match obj.wait_output(serial, 1.0).unwrap() {
                WaitOutput::Ready(s) => {
                    let info = obj.fetch_frame(s, &mut out).unwrap();
                    black_box(info.serial);
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        });
    });
}

criterion_group!(benches, bench_publish, bench_publish_and_fetch);
criterion_main!(benches);
