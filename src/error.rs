//! Error types for canflash.

use std::io;
use thiserror::Error;

/// Result type for canflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for canflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (CAN socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration (unknown part, malformed reset frame, bad image).
    #[error("configuration error: {0}")]
    Config(String),

    /// CAN transport failure outside of plain I/O.
    #[error("CAN transport error: {0}")]
    Transport(String),

    /// Intel HEX parse or serialization failure.
    #[error("Intel HEX error: {0}")]
    Hex(String),

    /// Signature or protocol version disagreement with the target.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The target reported an error command.
    #[error("bootloader error: {0}")]
    Peer(String),

    /// Read-back byte differs from the flashed image.
    #[error("verify mismatch at 0x{address:04X}: expected 0x{expected:02X}, got 0x{actual:02X}")]
    VerifyMismatch {
        /// Flash address of the differing byte.
        address: u32,
        /// Byte expected from the image.
        expected: u8,
        /// Byte reported by the target.
        actual: u8,
    },

    /// The target violated a protocol invariant (e.g. address fragment mismatch).
    #[error("protocol invariant violated: {0}")]
    InvariantViolation(String),

    /// The operator cancelled the session.
    #[error("operation cancelled")]
    Cancelled,
}
