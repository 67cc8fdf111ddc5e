use thiserror::Error;

use crate::wire::FrameKind;

/// A malformed TCP frame: bad preamble, unknown type tag, short remainder,
/// or a checksum mismatch.
#[derive(Debug, Error)]
#[error("framing error on {kind:?} frame: {reason}")]
pub struct FramingError {
    pub kind: FrameKind,
    pub reason: FramingReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingReason {
    UnknownTypeTag,
    ChecksumMismatch,
    UnexpectedIndex,
}

impl std::fmt::Display for FramingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingReason::UnknownTypeTag => write!(f, "unknown type tag"),
            FramingReason::ChecksumMismatch => write!(f, "checksum mismatch"),
            FramingReason::UnexpectedIndex => write!(f, "unexpected data index"),
        }
    }
}

/// Failures talking to the Harp sound card over USB.
#[derive(Debug, Error)]
pub enum UsbError {
    /// Write or read timed out / the transport returned an I/O error.
    /// Recoverable: the device channel reconnects and retries once.
    #[error("transient USB I/O error: {0}")]
    Transient(#[from] rusb::Error),

    /// The device was not found during enumeration.
    #[error("Harp sound card not found (vid={vid:#06x}, pid={pid:#06x})")]
    DeviceNotFound { vid: u16, pid: u16 },

    /// Device responded but the reply nonce didn't match the request,
    /// a short write/read occurred, or the device reported a non-zero
    /// error code. Unrecoverable for the current command.
    #[error("fatal USB device error: {0}")]
    Fatal(String),
}

/// Errors surfaced by the per-connection session state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Usb(#[from] UsbError),

    /// A frame arrived in a state that does not accept it
    /// (e.g. DATA before HEADER). The session closes without a reply.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Clean EOF or broken pipe while reading a frame.
    #[error("client disconnected")]
    ClientDisconnect,
}
