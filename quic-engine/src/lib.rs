//! Low-level buffer and key-state logic for QUIC transports
//!
//! quic-engine contains the two pieces of a QUIC implementation that sit on every send and
//! receive path but know nothing about the wire: a vectored buffer engine that carves and
//! reassembles scatter-gather segment arrays without copying the bytes they describe, and a key
//! state machine that records, per encryption level and direction, whether packet protection
//! keys have been installed.
//!
//! Neither component performs I/O or owns connection state beyond its own bookkeeping. A packet
//! writer typically checks [`EncryptionKeys::is_level_active`] before using [`vec::split`] or
//! [`vec::merge`] to carve the next chunk of pending stream or crypto data that fits the current
//! packet.
//!
//! TLS itself is not implemented here. Key derivation goes through a [`crypto::Backend`]; the
//! `ring` feature provides one in [`crypto::ring`].

#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]
#![forbid(unsafe_code)]

use std::{fmt, ops};

mod config;
pub use crate::config::KeyConfig;

pub mod crypto;
pub use crate::crypto::{
    AeadAlgorithm, Backend, CryptoContext, CryptoError, Direction, KeyMaterial, KeyPair, Level,
};

mod keys;
pub use crate::keys::{EncryptionKeys, KeyDerivationError, KeyUnavailable};

mod secret_log;
pub use crate::secret_log::{LoggedSecrets, NoSecretLog, SecretLog, TracingSecretLog};

pub mod vec;
pub use crate::vec::{CapacityError, Segment, SegmentArray};

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}
