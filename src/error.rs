// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types returned by the Totem ring core.
//!
//! Mirrors the error-kind taxonomy the protocol distinguishes internally:
//! most of these never reach a caller (the ring absorbs them as state
//! transitions) but a handful are surfaced synchronously.

use std::fmt;

/// Errors returned by ring-core operations.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Buffer errors
    // ========================================================================
    /// Sequence number falls outside the buffer's active window.
    OutOfRange(u32),
    /// Slot for this sequence number is already occupied.
    AlreadyPresent(u32),

    // ========================================================================
    // Frame / transport errors
    // ========================================================================
    /// HMAC verification failed on a received datagram; dropped.
    FrameAuthFail,
    /// Datagram too short to contain a security header.
    FrameTooShort,
    /// Datagram's ring_id does not match the local ring.
    ForeignRing,
    /// Generic I/O error with underlying cause.
    Io(std::io::Error),
    /// Failed to bind a socket to the configured address.
    BindFailed(String),
    /// Failed to join the configured multicast group.
    MulticastJoinFailed(String),
    /// No reachable successor for a token/commit-token hop: either the
    /// candidate list has no next member, or its network address is unknown.
    NoSuccessor,

    // ========================================================================
    // Queue / flow-control errors
    // ========================================================================
    /// The send queue has no room for another message.
    SendQueueFull,

    // ========================================================================
    // Wire decode errors
    // ========================================================================
    /// A wire structure could not be decoded (short buffer or bad length field).
    Malformed(&'static str),
    /// Unknown message type code in a datagram header.
    UnknownMessageType(u8),

    // ========================================================================
    // Persistence errors
    // ========================================================================
    /// Failed to read or write the persisted ring sequence file.
    PersistFailure(std::io::Error),

    // ========================================================================
    // Configuration errors
    // ========================================================================
    /// A `RingConfig` field failed validation.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfRange(seq) => write!(f, "seq {} outside buffer window", seq),
            Error::AlreadyPresent(seq) => write!(f, "seq {} already present in buffer", seq),
            Error::FrameAuthFail => write!(f, "frame authentication failed"),
            Error::FrameTooShort => write!(f, "datagram shorter than security header"),
            Error::ForeignRing => write!(f, "datagram belongs to a foreign ring"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::MulticastJoinFailed(msg) => write!(f, "multicast join failed: {}", msg),
            Error::NoSuccessor => write!(f, "no reachable successor for token hop"),
            Error::SendQueueFull => write!(f, "send queue full"),
            Error::Malformed(what) => write!(f, "malformed {}", what),
            Error::UnknownMessageType(ty) => write!(f, "unknown message type code {}", ty),
            Error::PersistFailure(e) => write!(f, "failed to persist ring sequence: {}", e),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::PersistFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
