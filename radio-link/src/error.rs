use std::fmt::Debug;

use crate::address::Node;
use crate::frame::FrameError;

/// Errors of the protocol layer, `R` being the error type of the underlying device.
#[derive(thiserror::Error, Debug)]
pub enum LinkError<R>
where
    R: Debug,
{
    #[error("No acknowledgement of command {command:#04x} from {node} after {attempts} attempts.")]
    NoAcknowledgement { node: Node, command: u8, attempts: usize },

    #[error("Transfer of {size}B does not fit in a session ({packets} packets, max: {max}).")]
    TransferTooLarge {
        size: usize,
        packets: usize,
        max: usize,
    },

    #[error("Receive buffer too small (is: {available}B, needed: {needed}B).")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Acknowledgement of {command:#04x} carries no timestamp.")]
    MissingTimestamp { command: u8 },

    #[error("Invalid channel {0}, channels go up to 127.")]
    InvalidChannel(u8),

    #[error("Every assignable node id is already in use.")]
    NodeIdsExhausted,

    #[error("Bad frame error.")]
    FrameError(#[from] FrameError),

    #[error("Internal radio error.")]
    InternalRadioError(R),
}
