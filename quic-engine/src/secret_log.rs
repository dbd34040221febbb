use tracing::debug;

use crate::crypto::{Direction, Level};

/// Receives traffic secrets and derived keys as they are installed
///
/// Only consulted when [`KeyConfig::show_secrets`](crate::KeyConfig::show_secrets) is enabled.
/// Implementations must not retain the secrets longer than needed for diagnostics.
pub trait SecretLog: Send + Sync {
    /// Record the keys just installed for `level` and `direction`
    fn log(&self, level: Level, direction: Direction, secrets: &LoggedSecrets<'_>);

    /// Whether calls to [`log`](Self::log) have any effect
    fn will_log(&self) -> bool {
        true
    }
}

/// Secret and derived key material handed to a [`SecretLog`]
#[derive(Clone, Copy)]
pub struct LoggedSecrets<'a> {
    /// Raw traffic secret supplied by the handshake
    pub secret: &'a [u8],
    /// Packet protection key
    pub key: &'a [u8],
    /// Packet protection IV
    pub iv: &'a [u8],
    /// Header protection key
    pub header_key: &'a [u8],
}

/// A [`SecretLog`] that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecretLog;

impl SecretLog for NoSecretLog {
    fn log(&self, _: Level, _: Direction, _: &LoggedSecrets<'_>) {}

    fn will_log(&self) -> bool {
        false
    }
}

/// A [`SecretLog`] that emits hex-encoded secrets as `tracing` debug events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSecretLog;

impl SecretLog for TracingSecretLog {
    fn log(&self, level: Level, direction: Direction, secrets: &LoggedSecrets<'_>) {
        let title = match level {
            Level::Initial => "initial",
            Level::Early => "early_traffic",
            Level::Handshake => "handshake_traffic",
            Level::Application => "application_traffic",
        };
        let dir = match direction {
            Direction::Receive => "rx",
            Direction::Transmit => "tx",
        };
        debug!(
            secret = %hex::encode(secrets.secret),
            key = %hex::encode(secrets.key),
            iv = %hex::encode(secrets.iv),
            hp = %hex::encode(secrets.header_key),
            "{title}_{dir} secrets"
        );
    }
}
