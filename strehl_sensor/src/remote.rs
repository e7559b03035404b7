//! The remote wavefront sensor shared object.
//!
//! Layout of the shared segment:
//!
//! ```text
//! [ remote object header | sensor body |
//!   primary configuration | secondary configuration | ring ]
//! ```
//!
//! The two configuration blocks have identical layout and capacities.  The
//! primary is written by the server and read by everybody; clients proposing
//! a new configuration fill the secondary under the command lock and send a
//! `Config` command, and the server validates and copies the secondary into
//! the primary before advancing the processed-command count
//! (publish-then-swap).

use std::ops::Deref;

use strehl_common::{Error, ErrorKind, Result, Serial, Shmid};
use strehl_shm::{
    align_up, Command, FrameInfo, ObjectFlags, ObjectType, RemoteObject, DATA_ALIGNMENT,
    FRAME_HEADER_SIZE, OWNER_SIZE, REMOTE_HEADER_SIZE,
};

use crate::config::{SensorConfig, ShackConfig, ShackData, SubImage};

/// Offset of the sensor body within the shared segment.
pub const SENSOR_BODY_OFFSET: usize = align_up(REMOTE_HEADER_SIZE, DATA_ALIGNMENT);

#[repr(C)]
struct SensorBody {
    max_ninds: i64,
    max_nsubs: i64,
    config2_offset: i64,
}

/// Fixed-size head of a configuration block.
#[repr(C)]
struct ConfigFixed {
    shack: ShackConfig,
    camera_width: i64,
    camera_height: i64,
    camera_shmid: i32,
    _pad: i32,
    camera_owner: [u8; OWNER_SIZE],
}

/// Byte layout of one configuration block for the given capacities.
fn block_layout(max_ninds: i64, max_nsubs: i64) -> (usize, usize, usize) {
    let inds_off = align_up(std::mem::size_of::<ConfigFixed>(), DATA_ALIGNMENT);
    let subs_off = align_up(inds_off + max_ninds as usize * 8, DATA_ALIGNMENT);
    let size = align_up(
        subs_off + max_nsubs as usize * std::mem::size_of::<SubImage>(),
        DATA_ALIGNMENT,
    );
    (inds_off, subs_off, size)
}

/// Handle on a remote Shack-Hartmann wavefront sensor.
pub struct RemoteSensor {
    base: RemoteObject,
}

impl Deref for RemoteSensor {
    type Target = RemoteObject;

    fn deref(&self) -> &RemoteObject {
        &self.base
    }
}

impl RemoteSensor {
    /// Create the shared resources of a remote wavefront sensor.
    ///
    /// `max_ninds` and `max_nsubs` bound every later configuration; they are
    /// immutable for the life of the object.
    pub fn create(
        owner: &str,
        nbufs: i64,
        max_ninds: i64,
        max_nsubs: i64,
        flags: ObjectFlags,
    ) -> Result<RemoteSensor> {
        if max_ninds < 1 || max_nsubs < 1 {
            return Err(Error::new("remote_sensor_create", ErrorKind::BadSize));
        }
        let (_, _, block_size) = block_layout(max_ninds, max_nsubs);
        let config1 = align_up(
            SENSOR_BODY_OFFSET + std::mem::size_of::<SensorBody>(),
            DATA_ALIGNMENT,
        );
        let config2 = config1 + block_size;
        let ring_offset = config2 + block_size;
        let stride = align_up(
            FRAME_HEADER_SIZE + 8 + max_nsubs as usize * std::mem::size_of::<ShackData>(),
            DATA_ALIGNMENT,
        );
        let size = ring_offset + nbufs.max(0) as usize * stride;

        let base = RemoteObject::create(
            owner,
            ObjectType::RemoteSensor,
            nbufs,
            ring_offset,
            stride,
            size,
            flags,
        )?;
        let sensor = RemoteSensor { base };
        // SAFETY: freshly created object, not yet shared.
        unsafe {
            let body = sensor.body();
            (*body).max_ninds = max_ninds;
            (*body).max_nsubs = max_nsubs;
            (*body).config2_offset = config2 as i64;
            // Both blocks start with an empty but decodable configuration.
            let empty = ShackConfig::new([1, 1], 1);
            (*sensor.fixed(config1)).shack = empty;
            (*sensor.fixed(config2)).shack = empty;
            (*sensor.fixed(config1)).camera_shmid = Shmid::BAD.0;
            (*sensor.fixed(config2)).camera_shmid = Shmid::BAD.0;
        }
        Ok(sensor)
    }

    /// Attach an existing remote wavefront sensor.
    pub fn attach(shmid: Shmid) -> Result<RemoteSensor> {
        let base = RemoteObject::attach_as(shmid, ObjectType::RemoteSensor)?;
        let sensor = RemoteSensor { base };
        let (max_ninds, max_nsubs) = (sensor.max_ninds(), sensor.max_nsubs());
        if max_ninds < 1 || max_nsubs < 1 {
            return Err(Error::new("remote_sensor_attach", ErrorKind::Corrupted));
        }
        let need = FRAME_HEADER_SIZE
            + 8
            + max_nsubs as usize * std::mem::size_of::<ShackData>();
        if sensor.stride() < need {
            return Err(Error::new("remote_sensor_attach", ErrorKind::Corrupted));
        }
        Ok(sensor)
    }

    fn body(&self) -> *mut SensorBody {
        // SAFETY: the segment extends past the body by the creation checks.
        unsafe {
            self.base
                .as_ptr()
                .as_ptr()
                .add(SENSOR_BODY_OFFSET)
                .cast::<SensorBody>()
        }
    }

    fn fixed(&self, block: usize) -> *mut ConfigFixed {
        // SAFETY: block offsets stay inside the segment by construction.
        unsafe { self.base.as_ptr().as_ptr().add(block).cast::<ConfigFixed>() }
    }

    fn primary_offset(&self) -> usize {
        align_up(
            SENSOR_BODY_OFFSET + std::mem::size_of::<SensorBody>(),
            DATA_ALIGNMENT,
        )
    }

    fn secondary_offset(&self) -> usize {
        unsafe { (*self.body()).config2_offset as usize }
    }

    /// Capacity of the sub-image grid.
    pub fn max_ninds(&self) -> i64 {
        unsafe { (*self.body()).max_ninds }
    }

    /// Capacity of the sub-image table.
    pub fn max_nsubs(&self) -> i64 {
        unsafe { (*self.body()).max_nsubs }
    }

    /// Copy one configuration block out of the segment.
    ///
    /// Caller must hold the object mutex.
    fn read_block(&self, block: usize) -> SensorConfig {
        let (inds_off, subs_off, _) = block_layout(self.max_ninds(), self.max_nsubs());
        // SAFETY: reads guarded by the object mutex; geometry fixed at
        // creation.
        unsafe {
            let fixed = &*self.fixed(block);
            let owner_end = fixed
                .camera_owner
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(OWNER_SIZE);
            let ninds = fixed.shack.ninds().clamp(0, self.max_ninds()) as usize;
            let nsubs = fixed.shack.nsubs.clamp(0, self.max_nsubs()) as usize;
            let base = self.base.as_ptr().as_ptr().add(block);
            let inds =
                std::slice::from_raw_parts(base.add(inds_off).cast::<i64>(), ninds).to_vec();
            let subs =
                std::slice::from_raw_parts(base.add(subs_off).cast::<SubImage>(), nsubs).to_vec();
            SensorConfig {
                shack: fixed.shack,
                camera_owner: std::str::from_utf8(&fixed.camera_owner[..owner_end])
                    .unwrap_or("")
                    .to_string(),
                camera_shmid: Shmid(fixed.camera_shmid),
                camera_width: fixed.camera_width,
                camera_height: fixed.camera_height,
                inds,
                subs,
            }
        }
    }

    /// Write one configuration block.
    ///
    /// Caller must hold the object mutex (or own a freshly created object).
    fn write_block(&self, block: usize, cfg: &SensorConfig) {
        let (inds_off, subs_off, _) = block_layout(self.max_ninds(), self.max_nsubs());
        // SAFETY: writes guarded by the object mutex; `cfg` validated
        // against the capacities beforehand.
        unsafe {
            let fixed = self.fixed(block);
            (*fixed).shack = cfg.shack;
            (*fixed).camera_width = cfg.camera_width;
            (*fixed).camera_height = cfg.camera_height;
            (*fixed).camera_shmid = cfg.camera_shmid.0;
            (*fixed).camera_owner = [0; OWNER_SIZE];
            let len = cfg.camera_owner.len().min(OWNER_SIZE - 1);
            (&mut (*fixed).camera_owner)[..len]
                .copy_from_slice(&cfg.camera_owner.as_bytes()[..len]);
            let base = self.base.as_ptr().as_ptr().add(block);
            std::ptr::copy_nonoverlapping(
                cfg.inds.as_ptr(),
                base.add(inds_off).cast::<i64>(),
                cfg.inds.len(),
            );
            std::ptr::copy_nonoverlapping(
                cfg.subs.as_ptr(),
                base.add(subs_off).cast::<SubImage>(),
                cfg.subs.len(),
            );
        }
    }

    /// Snapshot of the configuration currently in effect.
    pub fn config(&self) -> Result<SensorConfig> {
        self.lock()?;
        let cfg = self.read_block(self.primary_offset());
        self.unlock()?;
        Ok(cfg)
    }

    /// Propose a new configuration.
    ///
    /// The configuration is validated against the capacities, written into
    /// the secondary block under the command lock, and installed by the
    /// server before the command completes; `wait_command` is therefore
    /// sufficient for any client to observe the new layout.
    pub fn configure(&self, cfg: &SensorConfig, secs: f64) -> Result<Option<Serial>> {
        cfg.check(self.max_ninds(), self.max_nsubs())?;
        let Some(guard) = self.lock_for_command(Command::Config, secs)? else {
            return Ok(None);
        };
        self.write_block(self.secondary_offset(), cfg);
        Ok(Some(guard.serial()))
    }

    /// Adjust the run-time tunable parameters of the primary configuration.
    ///
    /// Layout-defining fields must match the current configuration; the
    /// update happens under the mutex, without a command round-trip.
    pub fn tune_config(&self, shack: &ShackConfig) -> Result<()> {
        self.lock()?;
        // SAFETY: reads and writes guarded by the object mutex.
        let result = unsafe {
            let fixed = self.fixed(self.primary_offset());
            (*fixed).shack.tune_from(shack)
        };
        if result.is_ok() {
            self.broadcast()?;
        }
        self.unlock()?;
        result
    }

    /// Start measuring.
    pub fn start(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Start, secs)
    }

    /// Stop measuring.
    pub fn stop(&self, secs: f64) -> Result<Option<Serial>> {
        self.send_simple_command(Command::Stop, secs)
    }

    /// Fetch the measurements of frame `serial`.
    pub fn fetch_data(&self, serial: Serial) -> Result<(FrameInfo, Vec<ShackData>)> {
        let mut bytes = vec![0u8; self.payload_capacity()];
        let info = self.fetch_frame(serial, &mut bytes)?;
        if info.serial != serial {
            return Ok((info, Vec::new()));
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[..8]);
        let nsubs = i64::from_ne_bytes(count).clamp(0, self.max_nsubs()) as usize;
        let mut data = vec![ShackData::default(); nsubs];
        // SAFETY: the payload holds `nsubs` ShackData records past the
        // leading count.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(8),
                data.as_mut_ptr().cast::<u8>(),
                nsubs * std::mem::size_of::<ShackData>(),
            );
        }
        Ok((info, data))
    }

    // ----- server side ------------------------------------------------------

    /// Copy the proposed (secondary) configuration out (server side).
    pub fn proposed_config(&self) -> Result<SensorConfig> {
        self.lock()?;
        let cfg = self.read_block(self.secondary_offset());
        self.unlock()?;
        Ok(cfg)
    }

    /// Install `cfg` as the primary configuration (server side).
    pub fn install_config(&self, cfg: &SensorConfig) -> Result<()> {
        self.lock()?;
        self.write_block(self.primary_offset(), cfg);
        self.broadcast()?;
        self.unlock()
    }

    /// Publish one measurement frame (server side).
    pub fn publish_data(&self, mark: i64, data: &[ShackData]) -> Result<Serial> {
        if data.len() as i64 > self.max_nsubs() {
            return Err(Error::new("sensor_publish_data", ErrorKind::BadNumber));
        }
        self.publish_frame(mark, |payload| {
            payload[..8].copy_from_slice(&(data.len() as i64).to_ne_bytes());
            // SAFETY: capacity checked against max_nsubs above.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().cast::<u8>(),
                    payload.as_mut_ptr().add(8),
                    std::mem::size_of_val(data),
                );
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoundingBox, Position};

    fn sample_config() -> SensorConfig {
        SensorConfig {
            shack: ShackConfig::new([2, 1], 2),
            camera_owner: "cam1".to_string(),
            camera_shmid: Shmid(5),
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

    #[test]
    fn create_and_capacities() {
        let wfs = RemoteSensor::create("wfs-ut", 2, 16, 8, ObjectFlags::empty()).unwrap();
        assert_eq!(wfs.max_ninds(), 16);
        assert_eq!(wfs.max_nsubs(), 8);
        assert!(RemoteSensor::create("wfs", 2, 0, 8, ObjectFlags::empty()).is_err());
    }

    #[test]
    fn secondary_then_primary_swap() {
        let wfs = RemoteSensor::create("wfs-ut2", 2, 16, 8, ObjectFlags::empty()).unwrap();
        let cfg = sample_config();

        // Simulate the server-side half of the configure round trip.
        wfs.lock().unwrap();
        wfs.write_block(wfs.secondary_offset(), &cfg);
        wfs.unlock().unwrap();
        let proposed = wfs.proposed_config().unwrap();
        assert_eq!(proposed, cfg);

        wfs.install_config(&proposed).unwrap();
        let installed = wfs.config().unwrap();
        assert_eq!(installed.camera_owner, "cam1");
        assert_eq!(installed.subs.len(), 2);
        assert_eq!(installed.inds, vec![0, 1]);
    }

    #[test]
    fn configure_validates_against_capacities() {
        let wfs = RemoteSensor::create("wfs-ut3", 2, 2, 1, ObjectFlags::empty()).unwrap();
        let cfg = sample_config();
        // Two sub-images exceed max_nsubs = 1.
        assert_eq!(
            wfs.configure(&cfg, 0.1).unwrap_err().kind,
            ErrorKind::BadNumber
        );
    }

    #[test]
    fn tuning_preserves_the_layout() {
        let wfs = RemoteSensor::create("wfs-ut4", 2, 16, 8, ObjectFlags::empty()).unwrap();
        let cfg = sample_config();
        wfs.install_config(&cfg).unwrap();

        let mut tuned = cfg.shack;
        tuned.forgetting_factor = 0.25;
        wfs.tune_config(&tuned).unwrap();
        assert_eq!(wfs.config().unwrap().shack.forgetting_factor, 0.25);

        let mut reshaped = tuned;
        reshaped.nsubs = 3;
        assert_eq!(
            wfs.tune_config(&reshaped).unwrap_err().kind,
            ErrorKind::ForbiddenChange
        );
    }

    #[test]
    fn publish_and_fetch_round_trip() {
        let wfs = RemoteSensor::create("wfs-ut5", 2, 16, 8, ObjectFlags::empty()).unwrap();
        let mut datum = ShackData::default();
        datum.pos.x = 0.5;
        datum.alpha = 100.0;
        let serial = wfs.publish_data(3, &[datum, datum]).unwrap();
        assert_eq!(serial, 1);

        let (info, data) = wfs.fetch_data(1).unwrap();
        assert_eq!(info.serial, 1);
        assert_eq!(info.mark, 3);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].pos.x, 0.5);
        assert_eq!(data[1].alpha, 100.0);
    }
}
