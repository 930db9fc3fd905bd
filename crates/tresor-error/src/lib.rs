#![forbid(unsafe_code)]
//! Error types for the Tresor engine.
//!
//! # Error taxonomy
//!
//! The engine distinguishes two disjoint failure classes:
//!
//! | Class | Type | Reported via |
//! |-------|------|--------------|
//! | Protocol violation | [`ProtocolError`] | `Err` from a lifecycle call |
//! | Domain failure | `success = false` on the request | normal completion path |
//!
//! A protocol violation means the caller or the composition misused the
//! module contract: submitting to a module with no free channel, dropping a
//! request from a channel that is not in a terminal state, referencing an
//! unknown channel, or delivering a completion the channel never asked for.
//! Callers must treat these as unrecoverable and must not retry.
//!
//! Domain failures (hash mismatch, unexpected node validity, allocator
//! exhaustion, backend I/O trouble) never surface as `Err`: the owning
//! module marks the request unsuccessful, moves its channel to the terminal
//! state, and the caller learns the outcome when it drains the completion.
//!
//! This crate depends on no other `tresor-*` crate so that every layer can
//! name these types without cycles.

use thiserror::Error;

/// Unrecoverable misuse of the module/channel protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// `submit_request` was called while no channel is `Inactive`.
    #[error("{module}: submit without a free channel")]
    NoFreeChannel { module: &'static str },

    /// A request referenced a channel id the module does not have.
    #[error("{module}: unknown channel id {id}")]
    UnknownChannel { module: &'static str, id: u64 },

    /// `drop_completed_request` targeted a channel not in a terminal state.
    #[error("{module}: channel {id} has no completed request")]
    NotComplete { module: &'static str, id: u64 },

    /// `drop_generated_request` targeted a channel with nothing outstanding.
    #[error("{module}: channel {id} has no generated request to drop")]
    NoGeneratedRequest { module: &'static str, id: u64 },

    /// A completion arrived that the channel never asked for, or that does
    /// not match the sub-request it has outstanding.
    #[error("{module}: channel {id} unexpected completion: {detail}")]
    UnexpectedCompletion {
        module: &'static str,
        id: u64,
        detail: &'static str,
    },

    /// A request of the wrong kind was routed to a module.
    #[error("request for {expected} routed to {got}")]
    WrongModule {
        expected: &'static str,
        got: &'static str,
    },

    /// A module id was addressed that the composition has no module for.
    #[error("no module registered for {module}")]
    ModuleNotRegistered { module: &'static str },

    /// A module id was registered twice in one composition.
    #[error("module {module} already registered")]
    ModuleAlreadyRegistered { module: &'static str },
}

/// Errors of the symmetric-crypto collaborator interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A caller-provided output buffer is smaller than one block.
    #[error("crypto buffer too small: need {need} bytes, got {got}")]
    BufferTooSmall { need: usize, got: usize },

    /// A key value does not have the expected length.
    #[error("key value size mismatch: need {need} bytes, got {got}")]
    KeyValueSizeMismatch { need: usize, got: usize },

    /// All key slots are occupied.
    #[error("no free key slot")]
    NoFreeKeySlot,

    /// An operation referenced a key id that is not loaded.
    #[error("unknown key id {id}")]
    UnknownKey { id: u32 },
}

/// Errors of the raw block backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Operating system I/O error.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A block range falls outside the device.
    #[error("block out of range: pba {pba} count {count} capacity {capacity}")]
    OutOfRange { pba: u64, count: u64, capacity: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = ProtocolError::NoFreeChannel { module: "ft_check" };
        assert_eq!(err.to_string(), "ft_check: submit without a free channel");

        let err = ProtocolError::UnexpectedCompletion {
            module: "ft_check",
            id: 0,
            detail: "pba mismatch",
        };
        assert_eq!(
            err.to_string(),
            "ft_check: channel 0 unexpected completion: pba mismatch"
        );

        let err = CryptoError::KeyValueSizeMismatch { need: 32, got: 16 };
        assert_eq!(
            err.to_string(),
            "key value size mismatch: need 32 bytes, got 16"
        );

        let err = BackendError::OutOfRange {
            pba: 10,
            count: 2,
            capacity: 11,
        };
        assert_eq!(
            err.to_string(),
            "block out of range: pba 10 count 2 capacity 11"
        );
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::other("disk gone");
        let err = BackendError::from(io);
        assert!(matches!(err, BackendError::Io(_)));
    }
}
