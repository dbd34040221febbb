//! Traits and datatypes for pluggable key derivation
//!
//! [`EncryptionKeys`](crate::EncryptionKeys) never talks to a TLS library directly. Whenever the
//! handshake yields a new traffic secret, it asks a [`Backend`] to describe the AEAD negotiated
//! for that level and to expand the secret into packet protection keys. Implementations typically
//! wrap whichever TLS stack drives the handshake; [`ring::RingBackend`] derives keys from raw
//! secrets with `ring`.

use thiserror::Error;

#[cfg(feature = "ring")]
pub mod ring;

/// Encryption level of a QUIC packet, in the order levels become available during a handshake
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// Keys derived from the client's first destination connection ID
    Initial,
    /// 0-RTT keys
    Early,
    /// Keys protecting the rest of the TLS handshake
    Handshake,
    /// 1-RTT keys
    Application,
}

impl Level {
    /// Every level, in order
    pub const ALL: [Self; 4] = [
        Self::Initial,
        Self::Early,
        Self::Handshake,
        Self::Application,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Whether keys protect incoming or outgoing packets
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Direction {
    /// Keys that remove protection from received packets
    Receive,
    /// Keys that protect packets we send
    Transmit,
}

impl Direction {
    /// Both directions
    pub const ALL: [Self; 2] = [Self::Receive, Self::Transmit];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// AEAD used for packet protection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AeadAlgorithm {
    /// AES-128-GCM, paired with SHA-256
    Aes128Gcm,
    /// AES-256-GCM, paired with SHA-384
    Aes256Gcm,
    /// ChaCha20-Poly1305, paired with SHA-256
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    /// Length of the packet protection key in bytes
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    /// Length of the IV, and therefore of every nonce, in bytes
    pub fn iv_len(self) -> usize {
        12
    }

    /// Length of the header protection key in bytes
    pub fn header_key_len(self) -> usize {
        self.key_len()
    }

    /// Length of the authentication tag appended to each packet payload
    pub fn tag_len(self) -> usize {
        16
    }

    /// Output length of the suite's hash, which is also the length of its traffic secrets
    pub fn secret_len(self) -> usize {
        match self {
            Self::Aes256Gcm => 48,
            Self::Aes128Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    /// Number of packets that may be protected with a single key
    pub fn confidentiality_limit(self) -> u64 {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm => 1 << 23,
            Self::ChaCha20Poly1305 => 1 << 62,
        }
    }

    /// Number of forged packets that may be rejected before the connection must be closed
    pub fn integrity_limit(self) -> u64 {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm => 1 << 52,
            Self::ChaCha20Poly1305 => 1 << 36,
        }
    }
}

/// Cryptographic parameters negotiated for one encryption level
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CryptoContext {
    aead: AeadAlgorithm,
}

impl CryptoContext {
    /// Describe a level protected with `aead`
    pub fn new(aead: AeadAlgorithm) -> Self {
        Self { aead }
    }

    /// The negotiated AEAD
    pub fn aead(&self) -> AeadAlgorithm {
        self.aead
    }

    /// Length of packet protection keys at this level
    pub fn key_len(&self) -> usize {
        self.aead.key_len()
    }

    /// Length of IVs at this level
    pub fn iv_len(&self) -> usize {
        self.aead.iv_len()
    }
}

/// Packet protection keys derived from one traffic secret
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: Vec<u8>,
    iv: Vec<u8>,
    header_key: Vec<u8>,
}

impl KeyMaterial {
    /// Bundle derived keys
    pub fn new(key: Vec<u8>, iv: Vec<u8>, header_key: Vec<u8>) -> Self {
        Self {
            key,
            iv,
            header_key,
        }
    }

    /// AEAD key for packet payloads
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// IV from which per-packet nonces are formed
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Key for header protection
    pub fn header_key(&self) -> &[u8] {
        &self.header_key
    }

    /// Nonce for the packet numbered `packet_number`
    ///
    /// The packet number is encoded big-endian, left-padded to the IV length and XORed with it.
    pub fn nonce(&self, packet_number: u64) -> Vec<u8> {
        let mut nonce = self.iv.clone();
        for (out, pn) in nonce
            .iter_mut()
            .rev()
            .zip(packet_number.to_be_bytes().iter().rev())
        {
            *out ^= pn;
        }
        nonce
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_len", &self.key.len())
            .field("iv_len", &self.iv.len())
            .finish_non_exhaustive()
    }
}

/// A pair of keys for bidirectional communication
#[derive(Debug, Clone)]
pub struct KeyPair<T> {
    /// Key for encrypting data
    pub local: T,
    /// Key for decrypting data
    pub remote: T,
}

/// Key derivation interface for a TLS library
///
/// A backend is fixed for the lifetime of the [`EncryptionKeys`](crate::EncryptionKeys) that uses
/// it. Derivation must be deterministic: the same context, level and secret always yield the same
/// key material.
pub trait Backend {
    /// Cryptographic parameters negotiated for `level`, or `None` if nothing has been negotiated
    fn crypto_context(&self, level: Level) -> Option<CryptoContext>;

    /// Expand `secret` into keys for removing protection from packets received at `level`
    fn derive_receive_key(
        &self,
        ctx: &CryptoContext,
        level: Level,
        secret: &[u8],
    ) -> Result<KeyMaterial, CryptoError>;

    /// Expand `secret` into keys for protecting packets sent at `level`
    fn derive_transmit_key(
        &self,
        ctx: &CryptoContext,
        level: Level,
        secret: &[u8],
    ) -> Result<KeyMaterial, CryptoError>;
}

/// Errors produced by a [`Backend`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptoError {
    /// The traffic secret does not match the suite's hash length
    #[error("secret is {actual} bytes, expected {expected}")]
    SecretLength {
        /// Length required by the suite
        expected: usize,
        /// Length supplied
        actual: usize,
    },
    /// No cipher suite has been negotiated for the level
    #[error("no cipher suite negotiated")]
    NoCipherSuite,
    /// The underlying cryptographic library rejected an operation
    #[error("unspecified cryptographic error")]
    Unspecified,
}
