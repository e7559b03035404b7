//! Lifecycle tests for the shared object hierarchy.

use strehl_shm::{segment, ObjectFlags, ObjectType, RwLockedObject, SharedArray, SharedObject};

use strehl_common::ElType;

#[test]
fn refcount_drives_destruction() {
    let obj = SharedObject::create(ObjectType::SharedObject, 8192, ObjectFlags::empty()).unwrap();
    let shmid = obj.shmid();
    assert_eq!(obj.nrefs(), 1);

    let a = SharedObject::attach(shmid).unwrap();
    let b = SharedObject::attach(shmid).unwrap();
    assert_eq!(obj.nrefs(), 3);

    drop(a);
    drop(obj);
    assert_eq!(b.nrefs(), 1);
    // Still attachable while one reference remains.
    let c = SharedObject::attach(shmid).unwrap();
    drop(b);
    drop(c);

    // Destruction happened exactly once, on the last detach.
    assert!(segment::stat(shmid).is_err());
    assert!(SharedObject::attach(shmid).is_err());
}

#[test]
fn persistent_objects_survive_the_last_detach() {
    let obj = SharedObject::create(
        ObjectType::SharedObject,
        4096,
        ObjectFlags::PERSISTENT,
    )
    .unwrap();
    let shmid = obj.shmid();
    drop(obj);

    // The segment is still there; re-attach and clean up manually.
    let again = SharedObject::attach(shmid).unwrap();
    assert_eq!(again.nrefs(), 1);
    segment::destroy(shmid).unwrap();
    drop(again);
}

#[test]
fn attach_by_guessed_shmid_fails_cleanly() {
    // A raw segment without an object header must be rejected.
    let (ptr, shmid) = segment::create(4096, ObjectFlags::empty()).unwrap();
    assert!(SharedObject::attach(shmid).is_err());
    segment::destroy(shmid).unwrap();
    unsafe { segment::detach(ptr).unwrap() };
}

#[test]
fn typed_attachments_share_state() {
    let arr = SharedArray::create(ElType::I32, &[16], ObjectFlags::empty()).unwrap();
    let shmid = arr.shmid();

    // The array is attachable as its exact type and as its family.
    let typed = SharedArray::attach(shmid).unwrap();
    let family = RwLockedObject::attach(shmid).unwrap();
    assert_eq!(arr.nrefs(), 3);
    assert_eq!(typed.eltype(), ElType::I32);

    // The rwlock is shared across handles.
    family.wrlock().unwrap();
    assert!(typed.try_rdlock().unwrap().timed_out());
    family.unlock_write().unwrap();
    assert!(!typed.try_rdlock().unwrap().timed_out());
    typed.unlock_read().unwrap();
}
