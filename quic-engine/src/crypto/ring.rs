//! Key derivation from raw TLS 1.3 traffic secrets using `ring`

use ring::{aead, error, hkdf};

use super::{AeadAlgorithm, Backend, CryptoContext, CryptoError, KeyMaterial, KeyPair, Level};
use crate::Side;

/// A [`Backend`] that expands traffic secrets with HKDF as described in RFC 9001 §5.1
///
/// The backend is told which suite the handshake negotiated; Initial packets always use
/// AES-128-GCM.
#[derive(Debug, Clone)]
pub struct RingBackend {
    suite: AeadAlgorithm,
    early_suite: Option<AeadAlgorithm>,
}

impl RingBackend {
    /// Protect the Handshake and Application levels with `suite`
    pub fn new(suite: AeadAlgorithm) -> Self {
        Self {
            suite,
            early_suite: None,
        }
    }

    /// Also offer 0-RTT keys, protected with `suite`
    pub fn with_early_suite(mut self, suite: AeadAlgorithm) -> Self {
        self.early_suite = Some(suite);
        self
    }
}

impl Backend for RingBackend {
    fn crypto_context(&self, level: Level) -> Option<CryptoContext> {
        let aead = match level {
            Level::Initial => AeadAlgorithm::Aes128Gcm,
            Level::Early => self.early_suite?,
            Level::Handshake | Level::Application => self.suite,
        };
        Some(CryptoContext::new(aead))
    }

    fn derive_receive_key(
        &self,
        ctx: &CryptoContext,
        _level: Level,
        secret: &[u8],
    ) -> Result<KeyMaterial, CryptoError> {
        derive_keys(ctx.aead(), secret)
    }

    fn derive_transmit_key(
        &self,
        ctx: &CryptoContext,
        _level: Level,
        secret: &[u8],
    ) -> Result<KeyMaterial, CryptoError> {
        derive_keys(ctx.aead(), secret)
    }
}

/// Expand a traffic secret into the packet protection key, IV and header protection key
pub fn derive_keys(aead: AeadAlgorithm, secret: &[u8]) -> Result<KeyMaterial, CryptoError> {
    let prk = traffic_prk(aead, secret)?;

    let mut key = vec![0; aead.key_len()];
    hkdf_expand_label(&prk, b"quic key", &mut key)?;
    let mut iv = vec![0; aead.iv_len()];
    hkdf_expand_label(&prk, b"quic iv", &mut iv)?;
    let mut header_key = vec![0; aead.header_key_len()];
    hkdf_expand_label(&prk, b"quic hp", &mut header_key)?;

    let (packet_alg, header_alg) = match aead {
        AeadAlgorithm::Aes128Gcm => (&aead::AES_128_GCM, &aead::quic::AES_128),
        AeadAlgorithm::Aes256Gcm => (&aead::AES_256_GCM, &aead::quic::AES_256),
        AeadAlgorithm::ChaCha20Poly1305 => (&aead::CHACHA20_POLY1305, &aead::quic::CHACHA20),
    };
    aead::UnboundKey::new(packet_alg, &key)?;
    aead::quic::HeaderProtectionKey::new(header_alg, &header_key)?;

    Ok(KeyMaterial::new(key, iv, header_key))
}

/// Derive the Initial keys for a connection whose client chose `dst_cid`
///
/// `local` holds the keys `side` protects its own packets with.
pub fn initial_keys(dst_cid: &[u8], side: Side) -> Result<KeyPair<KeyMaterial>, CryptoError> {
    let client = derive_keys(
        AeadAlgorithm::Aes128Gcm,
        &initial_secret(dst_cid, b"client in")?,
    )?;
    let server = derive_keys(
        AeadAlgorithm::Aes128Gcm,
        &initial_secret(dst_cid, b"server in")?,
    )?;
    Ok(match side {
        Side::Client => KeyPair {
            local: client,
            remote: server,
        },
        Side::Server => KeyPair {
            local: server,
            remote: client,
        },
    })
}

/// Derive the secret for the next key phase from the current one
pub fn next_secret(ctx: &CryptoContext, secret: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let prk = traffic_prk(ctx.aead(), secret)?;
    let mut next = vec![0; secret.len()];
    hkdf_expand_label(&prk, b"quic ku", &mut next)?;
    Ok(next)
}

fn initial_secret(dst_cid: &[u8], label: &[u8]) -> Result<[u8; 32], CryptoError> {
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(dst_cid);
    let mut secret = [0; 32];
    hkdf_expand_label(&prk, label, &mut secret)?;
    Ok(secret)
}

fn traffic_prk(aead: AeadAlgorithm, secret: &[u8]) -> Result<hkdf::Prk, CryptoError> {
    if secret.len() != aead.secret_len() {
        return Err(CryptoError::SecretLength {
            expected: aead.secret_len(),
            actual: secret.len(),
        });
    }
    let hash = match aead {
        AeadAlgorithm::Aes256Gcm => hkdf::HKDF_SHA384,
        AeadAlgorithm::Aes128Gcm | AeadAlgorithm::ChaCha20Poly1305 => hkdf::HKDF_SHA256,
    };
    Ok(hkdf::Prk::new_less_safe(hash, secret))
}

/// HKDF-Expand-Label from RFC 8446 §7.1, with an empty context
fn hkdf_expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    const PREFIX: &[u8] = b"tls13 ";
    let out_len = (out.len() as u16).to_be_bytes();
    let label_len = [(PREFIX.len() + label.len()) as u8];
    let info: [&[u8]; 5] = [&out_len, &label_len, PREFIX, label, &[0]];
    prk.expand(&info, OkmLen(out.len()))?.fill(out)?;
    Ok(())
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

impl From<error::Unspecified> for CryptoError {
    fn from(_: error::Unspecified) -> Self {
        Self::Unspecified
    }
}

/// QUIC v1 Initial salt, RFC 9001 §5.2
const INITIAL_SALT: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c, 0xad,
    0xcc, 0xbb, 0x7f, 0x0a,
];
