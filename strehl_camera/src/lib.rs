//! # STREHL remote camera
//!
//! The camera side of the STREHL substrate: camera configuration, the pixel
//! conversion and preprocessing kernels, the generic camera device
//! abstraction with its run-level machine, the remote camera shared object,
//! and the camera server event loop that turns a [`device::CameraDevice`]
//! implementation into a frame grabber publishing preprocessed frames.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod mock;
pub mod pixels;
pub mod remote;
pub mod server;

pub use config::{Attr, AttrValue, CameraConfig, Preprocessing, Roi, ATTR_COUNT};
pub use device::{AcquisitionBuffer, Camera, CameraDevice, DropPolicy, RunLevel};
pub use mock::MockCamera;
pub use pixels::{is_supported, PixelProcessor, PreprocParams};
pub use remote::RemoteCamera;
pub use server::{CameraServer, CameraServerOptions};
