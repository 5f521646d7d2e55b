//! Top-level error types.
//!
//! Per the error-handling design, nothing here is meant to cross a slot
//! boundary: transient radio conditions never appear as a `CoreError`,
//! they are folded into "treat this slot as silent" handling at the call
//! site. This enum exists for conditions that a caller of the management
//! API genuinely needs to observe or that abort an in-progress operation.

use crate::frame::{DecodeError, Frame};
use crate::sixlo::CompressError;

/// Core errors, generic over the underlying radio's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// The frame pool had nothing free and eviction did not make room.
    PoolExhausted,

    /// Transmission buffer full, caller should retry.
    TransmitPending,

    /// Transmission failed at the radio.
    TransmitFailed(Frame),

    /// Frame decoding error.
    DecodeError(DecodeError),

    /// IPv6-header-compression / fragmentation error.
    CompressError(CompressError),

    /// Wrapper for unhandled / underlying radio errors.
    Radio(E),

    Timeout,

    Busy,
}

impl<E> From<DecodeError> for CoreError<E> {
    fn from(e: DecodeError) -> Self {
        CoreError::DecodeError(e)
    }
}

impl<E> From<CompressError> for CoreError<E> {
    fn from(e: CompressError) -> Self {
        CoreError::CompressError(e)
    }
}
