//! Shared memory segment identifiers.

use serde::{Deserialize, Serialize};

/// Identifier of a System V shared memory segment.
///
/// Segment identifiers are the sole cross-process naming mechanism of the
/// substrate: servers advertise them through the configuration directory and
/// clients attach by value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shmid(pub i32);

impl Shmid {
    /// The invalid identifier.
    pub const BAD: Shmid = Shmid(-1);

    /// Whether the identifier is (syntactically) valid.
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for Shmid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
