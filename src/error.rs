//! Error kinds shared across the crate.

use thiserror::Error;

/// Low-level packet decoding failures. Kept distinct so the retry policy can
/// tell a corrupted frame from a dead link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("incorrect frame start")]
    PreambleMismatch,
    #[error("frame length out of range")]
    LengthOutOfRange,
    #[error("packet checksum mismatch")]
    ChecksumMismatch,
    #[error("incorrect frame end")]
    TerminatorMissing,
    #[error("truncated frame")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("link lost: {0}")]
    LinkLost(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Device answered, but with something other than the expected packet.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Explicit rejection status from the BSL (e.g. MCU locked).
    #[error("device rejected request: {0}")]
    DeviceNak(String),

    #[error("unknown model 0x{0:04X}")]
    UnknownModel(u16),

    #[error("autodetect ambiguous, candidates: {}; force one with -P", .0.join(", "))]
    AutodetectAmbiguous(Vec<String>),

    #[error("{0} is not supported by this protocol")]
    Unsupported(&'static str),

    #[error("bad option: {0}")]
    BadOption(String),

    #[error("bad image: {0}")]
    BadImage(String),

    #[error("frequency trim failed: {0}")]
    TrimFailed(String),

    #[error("interrupted by user")]
    UserAbort,

    /// Single read deadline expiry. Three in a row at the same state are
    /// escalated to `LinkLost` by the link layer.
    #[error("read timeout")]
    Timeout,

    #[error(transparent)]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Usb(#[from] rusb::Error),

    #[error("malformed packet: {0}")]
    Packet(#[from] scroll::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Process exit status for the CLI: 2 for user interrupt, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UserAbort => 2,
            _ => 1,
        }
    }
}
