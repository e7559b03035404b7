//! # STREHL process-shared object substrate
//!
//! Reference-counted objects living in System V shared memory segments, the
//! process-shared synchronization primitives protecting them, and the
//! asynchronous command/response protocol and cyclic output-frame ring that
//! servers use to talk to their clients.
//!
//! The object hierarchy is a header-prefix ladder:
//!
//! ```text
//! SharedObject ── RwLockedObject ── SharedArray
//!            └──── RemoteObject ─── (camera / mirror / sensor, in their
//!                                    own crates)
//! ```
//!
//! Every object occupies one shared segment whose identifier is the only
//! cross-process name; attaching increments the object's reference count and
//! the last detacher destroys the segment unless the object is persistent.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod info;
pub mod object;
pub mod remote;
pub mod rwlocked;
pub mod segment;
pub mod shared_array;
pub mod sync;

pub use array::{convert_elements, copy_region, Array, MAX_NDIMS};
pub use info::RemoteObjectInfo;
pub use object::{align_up, ObjectType, SharedObject, DATA_ALIGNMENT, SHARED_MAGIC};
pub use remote::{
    Command, CommandGuard, FrameHeader, FrameInfo, RemoteObject, ServerState, WaitOutput,
    FRAME_HEADER_SIZE, OWNER_SIZE, REMOTE_HEADER_SIZE,
};
pub use rwlocked::RwLockedObject;
pub use segment::ObjectFlags;
pub use shared_array::{SharedArray, TIMESTAMPS};
pub use sync::{SharedCond, SharedMutex, SharedSem, Sharing};
