//! Error kinds and the crate-wide `Result` type.
//!
//! The error code space merges the host's `errno` values (positive) with a
//! disjoint negative space of STREHL-specific kinds.  A failing operation
//! reports the name of the operation together with the kind; callers decide
//! whether to propagate (`?`), recover, or report.

use thiserror::Error;

/// Kinds of errors raised by the STREHL substrate.
///
/// Every variant maps to a stable code: STREHL-specific kinds are strictly
/// negative, system errors carry the positive `errno` value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Acquisition running
    #[error("acquisition running")]
    AcquisitionRunning,
    /// Destination already exists
    #[error("destination already exists")]
    AlreadyExist,
    /// Resource already in use
    #[error("resource already in use")]
    AlreadyInUse,
    /// Assertion failed
    #[error("assertion failed")]
    AssertionFailed,
    /// Invalid address
    #[error("invalid address")]
    BadAddress,
    /// Invalid algorithm
    #[error("invalid algorithm")]
    BadAlgorithm,
    /// Invalid argument
    #[error("invalid argument")]
    BadArgument,
    /// Invalid number of attachments
    #[error("invalid number of attachments")]
    BadAttachments,
    /// Invalid detector bias
    #[error("invalid detector bias")]
    BadBias,
    /// Invalid bounding box
    #[error("invalid bounding box")]
    BadBoundingBox,
    /// Bad number of buffers
    #[error("bad number of buffers")]
    BadBuffers,
    /// Invalid number of channels
    #[error("invalid number of channels")]
    BadChannels,
    /// Illegal character
    #[error("illegal character")]
    BadCharacter,
    /// Invalid command
    #[error("invalid command")]
    BadCommand,
    /// Invalid connection
    #[error("invalid connection")]
    BadConnection,
    /// Invalid bits per pixel
    #[error("invalid bits per pixel")]
    BadDepth,
    /// Invalid device
    #[error("invalid device")]
    BadDevice,
    /// Bad pixel encoding
    #[error("bad encoding")]
    BadEncoding,
    /// Unknown escape sequence
    #[error("unknown escape sequence")]
    BadEscape,
    /// Invalid exposure time
    #[error("invalid exposure time")]
    BadExposureTime,
    /// Invalid fan speed
    #[error("invalid fan speed")]
    BadFanSpeed,
    /// Invalid file name
    #[error("invalid file name")]
    BadFileName,
    /// Invalid forgetting factor
    #[error("invalid forgetting factor")]
    BadForgettingFactor,
    /// Invalid acquisition frame rate
    #[error("invalid frame rate")]
    BadFrameRate,
    /// Invalid detector gain
    #[error("invalid detector gain")]
    BadGain,
    /// Invalid magic number
    #[error("invalid magic number")]
    BadMagic,
    /// Invalid maximum excursion
    #[error("invalid maximum excursion")]
    BadMaxExcursion,
    /// Bad parameter name
    #[error("bad parameter name")]
    BadName,
    /// Invalid number of values
    #[error("invalid number of values")]
    BadNumber,
    /// Bad pixel type
    #[error("bad pixel type")]
    BadPixelType,
    /// Bad pre-processing settings
    #[error("bad pre-processing settings")]
    BadPreprocessing,
    /// Invalid interval of values
    #[error("invalid range")]
    BadRange,
    /// Invalid number of dimensions
    #[error("invalid number of dimensions")]
    BadRank,
    /// Invalid reference
    #[error("invalid reference")]
    BadReference,
    /// Invalid restoring force
    #[error("invalid restoring force")]
    BadRestoringForce,
    /// Invalid region of interest
    #[error("invalid region of interest")]
    BadRoi,
    /// Invalid serial number
    #[error("invalid serial number")]
    BadSerial,
    /// Invalid size
    #[error("invalid size")]
    BadSize,
    /// Invalid connection speed
    #[error("invalid connection speed")]
    BadSpeed,
    /// Invalid or unexpected stage
    #[error("invalid or unexpected stage")]
    BadStage,
    /// Invalid temperature
    #[error("invalid temperature")]
    BadTemperature,
    /// Invalid type
    #[error("invalid type")]
    BadType,
    /// Invalid parameter value
    #[error("invalid parameter value")]
    BadValue,
    /// Broken cycle or unordered operations
    #[error("broken cycle or unordered operations")]
    BrokenCycle,
    /// Corrupted structure
    #[error("corrupted structure")]
    Corrupted,
    /// Resource has been destroyed
    #[error("resource has been destroyed")]
    Destroyed,
    /// Resource exhausted
    #[error("resource exhausted")]
    Exhausted,
    /// Forbidden change of parameter(s)
    #[error("forbidden change of parameters")]
    ForbiddenChange,
    /// Inexact conversion
    #[error("inexact conversion")]
    InexactConversion,
    /// Separator missing
    #[error("separator missing")]
    MissingSeparator,
    /// Device must be reset
    #[error("device must be reset")]
    MustReset,
    /// Acquisition not started
    #[error("acquisition not started")]
    NotAcquiring,
    /// Item not found
    #[error("item not found")]
    NotFound,
    /// Resource not locked by caller
    #[error("resource not locked by caller")]
    NotLocked,
    /// Device not ready
    #[error("device not ready")]
    NotReady,
    /// Server or thread is not running
    #[error("server or thread is not running")]
    NotRunning,
    /// Not yet implemented
    #[error("not yet implemented")]
    NotYetImplemented,
    /// No data available
    #[error("no data available")]
    NoData,
    /// Out of range argument
    #[error("out of range argument")]
    OutOfRange,
    /// Contents has been overwritten
    #[error("contents has been overwritten")]
    Overwritten,
    /// Unknown system error
    #[error("unknown system error")]
    SystemError,
    /// Unclosed string
    #[error("unclosed string")]
    UnclosedString,
    /// Not readable
    #[error("not readable")]
    Unreadable,
    /// Unrecoverable error
    #[error("unrecoverable error")]
    Unrecoverable,
    /// Unsupported feature
    #[error("unsupported feature")]
    Unsupported,
    /// Not writable
    #[error("not writable")]
    Unwritable,
    /// Host system error (`errno` value)
    #[error("system error (errno {0})")]
    Errno(i32),
}

impl ErrorKind {
    /// Stable numeric code: strictly negative for STREHL kinds, the positive
    /// `errno` value for system errors.
    pub fn code(self) -> i32 {
        use ErrorKind::*;
        match self {
            AcquisitionRunning => -1,
            AlreadyExist => -2,
            AlreadyInUse => -3,
            AssertionFailed => -4,
            BadAddress => -5,
            BadAlgorithm => -6,
            BadArgument => -7,
            BadAttachments => -8,
            BadBias => -9,
            BadBoundingBox => -10,
            BadBuffers => -11,
            BadChannels => -12,
            BadCharacter => -13,
            BadCommand => -14,
            BadConnection => -15,
            BadDepth => -16,
            BadDevice => -17,
            BadEncoding => -18,
            BadEscape => -19,
            BadExposureTime => -20,
            BadFanSpeed => -21,
            BadFileName => -22,
            BadForgettingFactor => -23,
            BadFrameRate => -24,
            BadGain => -25,
            BadMagic => -26,
            BadMaxExcursion => -27,
            BadName => -28,
            BadNumber => -29,
            BadPixelType => -30,
            BadPreprocessing => -31,
            BadRange => -32,
            BadRank => -33,
            BadReference => -34,
            BadRestoringForce => -35,
            BadRoi => -36,
            BadSerial => -37,
            BadSize => -38,
            BadSpeed => -39,
            BadStage => -40,
            BadTemperature => -41,
            BadType => -42,
            BadValue => -43,
            BrokenCycle => -44,
            Corrupted => -46,
            Destroyed => -47,
            Exhausted => -48,
            ForbiddenChange => -49,
            InexactConversion => -50,
            MissingSeparator => -51,
            MustReset => -52,
            NotAcquiring => -53,
            NotFound => -54,
            NotLocked => -55,
            NotReady => -56,
            NotRunning => -57,
            NotYetImplemented => -58,
            NoData => -59,
            OutOfRange => -61,
            Overwritten => -62,
            SystemError => -63,
            UnclosedString => -64,
            Unreadable => -65,
            Unrecoverable => -66,
            Unsupported => -67,
            Unwritable => -68,
            Errno(e) => e,
        }
    }
}

/// An error raised by a named operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{func}: {kind}")]
pub struct Error {
    /// Name of the failing operation.
    pub func: &'static str,
    /// Kind of failure.
    pub kind: ErrorKind,
}

impl Error {
    /// Create a new error for operation `func`.
    pub fn new(func: &'static str, kind: ErrorKind) -> Self {
        Self { func, kind }
    }

    /// Capture the current `errno` as the failure of operation `func`.
    pub fn last_os_error(func: &'static str) -> Self {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self {
            func,
            kind: ErrorKind::Errno(code),
        }
    }
}

/// Result type for STREHL operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a timed wait.
///
/// Timed acquisitions and waits distinguish success from deadline expiry;
/// hard failures travel through `Result`'s error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Wait {
    /// The awaited condition was met before the deadline.
    Done,
    /// The deadline elapsed first.
    TimedOut,
}

impl Wait {
    /// Whether the deadline elapsed before the condition was met.
    pub fn timed_out(self) -> bool {
        matches!(self, Wait::TimedOut)
    }
}
