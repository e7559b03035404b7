//! Diagnostic snapshots of shared objects.
//!
//! Monitoring tools want a one-shot, lock-free picture of a remote object:
//! who owns it, how many processes are attached, how far the serials have
//! advanced.  The snapshot is serializable so that command-line tools can
//! dump it as JSON.

use serde::{Deserialize, Serialize};
use strehl_common::{Result, Serial};

use crate::remote::RemoteObject;
use crate::segment;

/// One-shot description of a remote object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteObjectInfo {
    /// Segment identifier.
    pub shmid: i32,
    /// Owner name advertised by the server.
    pub owner: String,
    /// Raw type tag.
    pub object_type: u32,
    /// Total segment size in bytes.
    pub size: usize,
    /// Kernel attachment count.
    pub nattch: i64,
    /// Object-level reference count.
    pub nrefs: i64,
    /// Ring length.
    pub nbufs: i64,
    /// Serial of the last published frame.
    pub serial: Serial,
    /// Number of processed commands.
    pub ncmds: Serial,
    /// Server state name.
    pub state: String,
}

impl RemoteObjectInfo {
    /// Take a snapshot of `obj` using only lock-free reads.
    pub fn snapshot(obj: &RemoteObject) -> Result<RemoteObjectInfo> {
        let (_, nattch) = segment::stat(obj.shmid())?;
        Ok(RemoteObjectInfo {
            shmid: obj.shmid().0,
            owner: obj.owner().to_string(),
            object_type: obj.object_type()? as u32,
            size: obj.size(),
            nattch,
            nrefs: obj.nrefs(),
            nbufs: obj.nbufs(),
            serial: obj.serial(),
            ncmds: obj.ncmds(),
            state: obj.state().name().to_string(),
        })
    }

    /// Render the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
