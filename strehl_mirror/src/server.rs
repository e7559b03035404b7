//! The deformable mirror server event loop.
//!
//! The server consumes commands from the remote mirror in order.  Every
//! `Send` publishes exactly one telemetry frame *before* the command
//! completes, so the data serial reported to the client at queueing time
//! (`serial + 1`) names the frame produced by that command.

use strehl_common::{Result, Serial};
use strehl_shm::{Command, ServerState};
use tracing::{debug, info, warn};

use crate::remote::{RemoteMirror, EFFECTIVE, PERTURBATION, REFERENCE, REQUESTED};

/// Callback invoked with the effective commands before publication.
///
/// The device driver may clip further; whatever it leaves in the slice is
/// published as the effective command vector.
pub type OnSend<'a> = dyn FnMut(&RemoteMirror, &mut [f64]) -> Result<()> + 'a;

/// The server side of a remote deformable mirror.
pub struct MirrorServer {
    remote: RemoteMirror,
}

impl MirrorServer {
    /// Wrap a freshly created remote mirror.
    pub fn new(remote: RemoteMirror) -> MirrorServer {
        MirrorServer { remote }
    }

    /// The remote mirror object.
    pub fn remote(&self) -> &RemoteMirror {
        &self.remote
    }

    /// Run the event loop until a `kill` command arrives.
    ///
    /// `on_send` receives the clamped effective commands of every frame and
    /// may clip them further (a real driver would talk to the hardware
    /// here).
    pub fn run_loop(&mut self, on_send: &mut OnSend<'_>) -> Result<()> {
        info!(owner = %self.remote.owner(), shmid = %self.remote.shmid(), "mirror server ready");
        self.remote.announce_state(ServerState::Waiting)?;
        loop {
            let Some((cmd, num)) = self.remote.take_command(0.05)? else {
                continue;
            };
            debug!(command = cmd.name(), serial = num, "executing command");
            match cmd {
                Command::Send => {
                    let state = match self.apply_commands(on_send) {
                        Ok(_) => ServerState::Waiting,
                        Err(err) => {
                            warn!(%err, "send failed");
                            ServerState::Error
                        }
                    };
                    self.remote.finish_command(num, state)?;
                }
                Command::Config | Command::Start | Command::Stop | Command::Abort => {
                    // Vector updates are written by the client under the
                    // command lock; acknowledging them is enough.
                    self.remote.finish_command(num, ServerState::Waiting)?;
                }
                Command::Kill => {
                    self.remote.finish_command(num, ServerState::Quitting)?;
                    break;
                }
                Command::None | Command::Reset => {
                    // A reset arrives as an all-zero `Send`; nothing sends
                    // these tags.
                    self.remote.finish_command(num, ServerState::Error)?;
                }
            }
        }
        self.remote.mark_unreachable()?;
        info!(owner = %self.remote.owner(), "mirror server exited");
        Ok(())
    }

    /// Compute, clip and publish one telemetry frame.
    fn apply_commands(&self, on_send: &mut OnSend<'_>) -> Result<Serial> {
        let nacts = self.remote.nacts() as usize;
        let (cmin, cmax) = (self.remote.cmin(), self.remote.cmax());

        let mut reference = vec![0.0; nacts];
        let mut perturbation = vec![0.0; nacts];
        let mut requested = vec![0.0; nacts];

        self.remote.lock()?;
        self.remote.read_vector(REFERENCE, &mut reference);
        self.remote.read_vector(PERTURBATION, &mut perturbation);
        self.remote.read_vector(REQUESTED, &mut requested);
        // The perturbation is consumed by this frame.
        self.remote.write_vector(PERTURBATION, &vec![0.0; nacts]);
        let mark = self.remote.take_mark();
        self.remote.unlock()?;

        let mut effective: Vec<f64> = (0..nacts)
            .map(|k| (reference[k] + perturbation[k] + requested[k]).clamp(cmin, cmax))
            .collect();
        on_send(&self.remote, &mut effective)?;

        self.remote.lock()?;
        self.remote.write_vector(EFFECTIVE, &effective);
        self.remote.unlock()?;

        self.remote.publish_frame(mark, |payload| {
            let vectors = [&reference, &perturbation, &requested, &effective];
            for (which, vals) in vectors.iter().enumerate() {
                let start = which * nacts * 8;
                // SAFETY: the payload spans 4 * nacts doubles by creation.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        vals.as_ptr().cast::<u8>(),
                        payload.as_mut_ptr().add(start),
                        nacts * 8,
                    );
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strehl_common::layout::{build_indexed_layout, instantiate_mask};
    use strehl_shm::ObjectFlags;

    #[test]
    fn apply_publishes_the_current_vectors() {
        let mask = instantiate_mask(3, 3, 9).unwrap();
        let mut inds = vec![0i64; 9];
        build_indexed_layout(Some(&mut inds), &mask, 3, 3, 0).unwrap();
        let dm =
            RemoteMirror::create("dm-srv-ut", 2, &inds, [3, 3], -1.0, 1.0, ObjectFlags::empty())
                .unwrap();
        let server = MirrorServer::new(dm);

        // Fresh mirror: reference at the midpoint (zero here), requested and
        // perturbation zero.
        let serial = server.apply_commands(&mut |_, _| Ok(())).unwrap();
        assert_eq!(serial, 1);
        let (info, frame) = server.remote().fetch_data(1).unwrap();
        assert_eq!(info.serial, 1);
        assert!(frame.requested.iter().all(|&v| v == 0.0));
        assert!(frame.effective.iter().all(|&v| v == 0.0));
    }
}
