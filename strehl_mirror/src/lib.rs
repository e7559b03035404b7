//! # STREHL remote deformable mirror
//!
//! The deformable mirror side of the STREHL substrate: the remote mirror
//! shared object (actuator layout, reference/perturbation/requested/
//! effective command vectors, cyclic telemetry ring) and the server event
//! loop that applies client commands and publishes telemetry frames.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod remote;
pub mod server;

pub use remote::{MirrorFrame, RemoteMirror, MIRROR_BODY_OFFSET};
pub use server::{MirrorServer, OnSend};
