//! # STREHL remote wavefront sensor
//!
//! The Shack-Hartmann side of the STREHL substrate: sensor configuration
//! (sub-image layout, bounding boxes, reference positions), the remote
//! sensor shared object with its primary/secondary configuration blocks,
//! and the server event loop publishing measurement frames.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod remote;
pub mod server;

pub use config::{
    Algorithm, BoundingBox, MeasuredPosition, Position, SensorConfig, ShackConfig, ShackData,
    SubImage,
};
pub use remote::RemoteSensor;
pub use server::{center_of_gravity, Measure, SensorServer};
