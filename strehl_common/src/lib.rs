//! # STREHL common definitions
//!
//! Shared types for the STREHL real-time substrate: the error model, clocks
//! and deadline arithmetic, array element types, pixel encoding descriptors,
//! 2-D layouts of active nodes, segment identifiers, and the configuration
//! directory used by servers to advertise their shared resources.
//!
//! This crate is the single source of truth for these definitions; the
//! substrate crates (`strehl_shm`, `strehl_camera`, `strehl_mirror`,
//! `strehl_sensor`) all build on it.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod encoding;
pub mod eltype;
pub mod error;
pub mod layout;
pub mod shmid;
pub mod time;

pub use encoding::{Colorant, Encoding, EncodingFlags};
pub use eltype::{ElType, Scalar};
pub use error::{Error, ErrorKind, Result, Wait};
pub use shmid::Shmid;
pub use time::{Deadline, TimeSpec, MAX_TIME_SECONDS, sleep_secs};

/// Serial number of commands and data-frames.
///
/// A signed 64-bit integer: large enough to count frames at 1 kHz for
/// hundreds of millions of years, signed so that sentinel arithmetic stays
/// simple.
pub type Serial = i64;
