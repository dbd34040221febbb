//! Per-level packet protection key state
//!
//! The handshake hands over one traffic secret per encryption level and direction.
//! [`EncryptionKeys`] expands each through a [`Backend`], keeps the resulting keys, and answers
//! whether a level can be used yet. A packet writer asks before building a packet at a level; a
//! receiver asks before trying to unprotect one.

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::KeyConfig,
    crypto::{
        AeadAlgorithm, Backend, CryptoContext, CryptoError, Direction, KeyMaterial, KeyPair, Level,
    },
    secret_log::LoggedSecrets,
};

/// Packet protection keys installed for each encryption level and direction of one connection
///
/// Initial keys are known before the handshake starts and are supplied at construction. Keys for
/// every other level are installed from traffic secrets as the handshake produces them, each
/// (level, direction) pair independently. Once a pair is installed it stays installed: installing
/// it again, as happens during a key update, replaces the keys in place.
pub struct EncryptionKeys<B> {
    backend: B,
    config: KeyConfig,
    /// Recorded on the first install at each level
    contexts: [Option<CryptoContext>; 4],
    /// `Some` once installed, indexed by level then direction
    keys: [[Option<KeyMaterial>; 2]; 4],
}

impl<B: Backend> EncryptionKeys<B> {
    /// Start tracking keys for a new connection
    ///
    /// `initial.local` protects outgoing Initial packets and `initial.remote` incoming ones.
    pub fn new(backend: B, initial: KeyPair<KeyMaterial>, config: KeyConfig) -> Self {
        let mut this = Self {
            backend,
            config,
            contexts: Default::default(),
            keys: Default::default(),
        };
        let initial_level = Level::Initial.index();
        this.contexts[initial_level] = Some(CryptoContext::new(AeadAlgorithm::Aes128Gcm));
        this.keys[initial_level][Direction::Transmit.index()] = Some(initial.local);
        this.keys[initial_level][Direction::Receive.index()] = Some(initial.remote);
        this
    }

    /// Derive and install keys for packets received at `level` from the peer's traffic `secret`
    ///
    /// On failure nothing changes: a pair that was not installed stays inactive, and a pair that
    /// was keeps its current keys.
    pub fn install_receive_key(
        &mut self,
        level: Level,
        secret: &[u8],
    ) -> Result<(), KeyDerivationError> {
        self.install(level, Direction::Receive, secret)
    }

    /// Derive and install keys for packets sent at `level` from our traffic `secret`
    ///
    /// On failure nothing changes: a pair that was not installed stays inactive, and a pair that
    /// was keeps its current keys.
    pub fn install_transmit_key(
        &mut self,
        level: Level,
        secret: &[u8],
    ) -> Result<(), KeyDerivationError> {
        self.install(level, Direction::Transmit, secret)
    }

    fn install(
        &mut self,
        level: Level,
        direction: Direction,
        secret: &[u8],
    ) -> Result<(), KeyDerivationError> {
        let derived = self.context(level).and_then(|ctx| {
            let material = match direction {
                Direction::Receive => self.backend.derive_receive_key(&ctx, level, secret),
                Direction::Transmit => self.backend.derive_transmit_key(&ctx, level, secret),
            }?;
            Ok((ctx, material))
        });
        let (ctx, material) = match derived {
            Ok(x) => x,
            Err(source) => {
                debug!(?level, ?direction, %source, "key derivation failed");
                return Err(KeyDerivationError {
                    level,
                    direction,
                    source,
                });
            }
        };

        self.contexts[level.index()].get_or_insert(ctx);
        if self.config.logs_secrets() {
            self.config.secret_log.log(
                level,
                direction,
                &LoggedSecrets {
                    secret,
                    key: material.key(),
                    iv: material.iv(),
                    header_key: material.header_key(),
                },
            );
        }
        let update = self.keys[level.index()][direction.index()]
            .replace(material)
            .is_some();
        trace!(?level, ?direction, aead = ?ctx.aead(), update, "installed keys");
        Ok(())
    }

    fn context(&self, level: Level) -> Result<CryptoContext, CryptoError> {
        match self.contexts[level.index()] {
            Some(ctx) => Ok(ctx),
            None => self
                .backend
                .crypto_context(level)
                .ok_or(CryptoError::NoCipherSuite),
        }
    }
}

impl<B> EncryptionKeys<B> {
    /// Whether keys for `level` and `direction` have been installed
    pub fn is_level_active(&self, level: Level, direction: Direction) -> bool {
        self.keys[level.index()][direction.index()].is_some()
    }

    /// Keys to protect or unprotect a packet at `level` travelling in `direction`
    pub fn keys(
        &self,
        level: Level,
        direction: Direction,
    ) -> Result<&KeyMaterial, KeyUnavailable> {
        self.keys[level.index()][direction.index()]
            .as_ref()
            .ok_or(KeyUnavailable { level, direction })
    }

    /// Cryptographic parameters of `level`, once any keys have been installed there
    pub fn crypto_context(&self, level: Level) -> Option<&CryptoContext> {
        self.contexts[level.index()].as_ref()
    }

    /// The backend keys are derived with
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The configuration in effect
    pub fn config(&self) -> &KeyConfig {
        &self.config
    }
}

impl<B> std::fmt::Debug for EncryptionKeys<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut installed = f.debug_map();
        for level in Level::ALL {
            let dirs = Direction::ALL.map(|dir| self.is_level_active(level, dir));
            installed.entry(&level, &dirs);
        }
        installed.finish()
    }
}

/// A traffic secret could not be turned into packet protection keys
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to derive {direction:?} keys for {level:?} level")]
pub struct KeyDerivationError {
    /// Level the keys were meant for
    pub level: Level,
    /// Direction the keys were meant for
    pub direction: Direction,
    /// Why the backend failed
    pub source: CryptoError,
}

impl KeyDerivationError {
    /// Whether the connection must be closed
    ///
    /// 0-RTT keys are optional; a connection can carry on without them and send its data
    /// once 1-RTT keys are available.
    pub fn is_fatal(&self) -> bool {
        self.level != Level::Early
    }
}

/// Keys were requested for a level and direction that has none installed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("no {direction:?} keys installed for {level:?} level")]
pub struct KeyUnavailable {
    /// Level requested
    pub level: Level,
    /// Direction requested
    pub direction: Direction,
}

#[cfg(test)]
mod tests {
    use std::{
        cell::Cell,
        io::{self, Write},
        str,
        sync::{Arc, Mutex},
    };

    use assert_matches::assert_matches;
    use proptest::{collection::vec, prelude::*};
    use tracing_subscriber::EnvFilter;

    use super::*;
    use crate::{SecretLog, TracingSecretLog};

    /// Derives keys by copying the secret, unless told to fail
    struct TestBackend {
        early: bool,
        fail: Cell<bool>,
    }

    impl TestBackend {
        fn new() -> Self {
            Self {
                early: false,
                fail: Cell::new(false),
            }
        }

        fn failing() -> Self {
            let backend = Self::new();
            backend.fail.set(true);
            backend
        }

        fn derive(&self, tag: u8, secret: &[u8]) -> Result<KeyMaterial, CryptoError> {
            if self.fail.get() {
                return Err(CryptoError::Unspecified);
            }
            Ok(KeyMaterial::new(secret.to_vec(), vec![tag; 12], secret.to_vec()))
        }
    }

    impl Backend for TestBackend {
        fn crypto_context(&self, level: Level) -> Option<CryptoContext> {
            match level {
                Level::Early if !self.early => None,
                _ => Some(CryptoContext::new(AeadAlgorithm::Aes128Gcm)),
            }
        }

        fn derive_receive_key(
            &self,
            _: &CryptoContext,
            _: Level,
            secret: &[u8],
        ) -> Result<KeyMaterial, CryptoError> {
            self.derive(b'r', secret)
        }

        fn derive_transmit_key(
            &self,
            _: &CryptoContext,
            _: Level,
            secret: &[u8],
        ) -> Result<KeyMaterial, CryptoError> {
            self.derive(b't', secret)
        }
    }

    #[derive(Default)]
    struct RecordingLog(Mutex<Vec<(Level, Direction, Vec<u8>)>>);

    impl SecretLog for RecordingLog {
        fn log(&self, level: Level, direction: Direction, secrets: &LoggedSecrets<'_>) {
            self.0
                .lock()
                .unwrap()
                .push((level, direction, secrets.secret.to_vec()));
        }
    }

    fn initial() -> KeyPair<KeyMaterial> {
        KeyPair {
            local: KeyMaterial::new(vec![1; 16], vec![1; 12], vec![1; 16]),
            remote: KeyMaterial::new(vec![2; 16], vec![2; 12], vec![2; 16]),
        }
    }

    fn keys(backend: TestBackend) -> EncryptionKeys<TestBackend> {
        EncryptionKeys::new(backend, initial(), KeyConfig::default())
    }

    #[test]
    fn initial_installed_at_construction() {
        let keys = keys(TestBackend::new());
        for level in Level::ALL {
            for dir in Direction::ALL {
                assert_eq!(keys.is_level_active(level, dir), level == Level::Initial);
            }
        }
        let tx = keys.keys(Level::Initial, Direction::Transmit).unwrap();
        assert_eq!(tx.key(), [1; 16]);
        let rx = keys.keys(Level::Initial, Direction::Receive).unwrap();
        assert_eq!(rx.key(), [2; 16]);
        assert_eq!(
            keys.crypto_context(Level::Initial).map(|c| c.aead()),
            Some(AeadAlgorithm::Aes128Gcm)
        );
        assert!(keys.crypto_context(Level::Handshake).is_none());
    }

    #[test]
    fn directions_install_independently() {
        let _guard = subscribe();
        let mut keys = keys(TestBackend::new());

        keys.install_receive_key(Level::Handshake, &[7; 32])
            .unwrap();

        assert!(keys.is_level_active(Level::Handshake, Direction::Receive));
        assert!(!keys.is_level_active(Level::Handshake, Direction::Transmit));
        assert!(!keys.is_level_active(Level::Application, Direction::Receive));
        let rx = keys.keys(Level::Handshake, Direction::Receive).unwrap();
        assert_eq!(rx.iv(), [b'r'; 12]);
        assert!(keys.crypto_context(Level::Handshake).is_some());
    }

    #[test]
    fn failed_derivation_leaves_level_inactive() {
        let _guard = subscribe();
        let mut keys = keys(TestBackend::failing());

        let err = keys
            .install_receive_key(Level::Handshake, &[7; 32])
            .unwrap_err();

        assert_eq!(err.level, Level::Handshake);
        assert_eq!(err.direction, Direction::Receive);
        assert_matches!(err.source, CryptoError::Unspecified);
        assert!(err.is_fatal());
        assert!(!keys.is_level_active(Level::Handshake, Direction::Receive));
        assert!(keys.crypto_context(Level::Handshake).is_none());
    }

    #[test]
    fn key_update_replaces_keys() {
        let mut keys = keys(TestBackend::new());
        keys.install_transmit_key(Level::Application, &[1; 32])
            .unwrap();

        keys.install_transmit_key(Level::Application, &[2; 32])
            .unwrap();

        assert!(keys.is_level_active(Level::Application, Direction::Transmit));
        let tx = keys.keys(Level::Application, Direction::Transmit).unwrap();
        assert_eq!(tx.key(), [2; 32]);
    }

    #[test]
    fn failed_key_update_keeps_previous_keys() {
        let mut keys = keys(TestBackend::new());
        keys.install_receive_key(Level::Application, &[1; 32])
            .unwrap();

        keys.backend().fail.set(true);
        let result = keys.install_receive_key(Level::Application, &[2; 32]);
        assert!(result.is_err());

        assert!(keys.is_level_active(Level::Application, Direction::Receive));
        let rx = keys.keys(Level::Application, Direction::Receive).unwrap();
        assert_eq!(rx.key(), [1; 32]);
    }

    #[test]
    fn early_failure_is_not_fatal() {
        let mut keys = keys(TestBackend::new());

        let err = keys
            .install_transmit_key(Level::Early, &[3; 32])
            .unwrap_err();

        assert_matches!(err.source, CryptoError::NoCipherSuite);
        assert!(!err.is_fatal());
        assert!(!keys.is_level_active(Level::Early, Direction::Transmit));

        let mut keys = self::keys(TestBackend {
            early: true,
            ..TestBackend::new()
        });
        keys.install_transmit_key(Level::Early, &[3; 32]).unwrap();
        assert!(keys.is_level_active(Level::Early, Direction::Transmit));
    }

    #[test]
    fn keys_unavailable_before_install() {
        let keys = keys(TestBackend::new());
        assert_matches!(
            keys.keys(Level::Handshake, Direction::Transmit),
            Err(KeyUnavailable {
                level: Level::Handshake,
                direction: Direction::Transmit
            })
        );
    }

    #[test]
    fn secrets_logged_only_when_enabled() {
        let log = Arc::new(RecordingLog::default());
        let mut config = KeyConfig::default();
        config.secret_log(log.clone());
        let mut keys = EncryptionKeys::new(TestBackend::new(), initial(), config.clone());
        keys.install_receive_key(Level::Handshake, &[4; 32])
            .unwrap();
        assert!(log.0.lock().unwrap().is_empty());

        config.show_secrets(true);
        let mut keys = EncryptionKeys::new(TestBackend::new(), initial(), config);
        keys.install_receive_key(Level::Handshake, &[4; 32])
            .unwrap();
        keys.backend().fail.set(true);
        keys.install_transmit_key(Level::Handshake, &[5; 32])
            .unwrap_err();
        assert_eq!(
            *log.0.lock().unwrap(),
            [(Level::Handshake, Direction::Receive, vec![4; 32])]
        );
    }

    #[test]
    fn tracing_secret_log() {
        let (_guard, output) = capture();
        let mut config = KeyConfig::default();
        config
            .show_secrets(true)
            .secret_log(Arc::new(TracingSecretLog));
        let backend = TestBackend {
            early: true,
            ..TestBackend::new()
        };
        let mut keys = EncryptionKeys::new(backend, initial(), config);

        keys.install_transmit_key(Level::Application, &[6; 32])
            .unwrap();
        keys.install_receive_key(Level::Early, &[7; 32]).unwrap();
        keys.install_transmit_key(Level::Initial, &[8; 32]).unwrap();
        keys.install_receive_key(Level::Handshake, &[9; 32])
            .unwrap();

        let output = String::from_utf8(output.lock().unwrap().clone()).unwrap();
        for title in [
            "application_traffic_tx secrets",
            "early_traffic_rx secrets",
            "initial_tx secrets",
            "handshake_traffic_rx secrets",
        ] {
            assert!(output.contains(title), "missing {title:?} in {output}");
        }
        // Keys from `TestBackend` repeat the secret, and IVs carry the direction
        assert!(output.contains(&format!("secret={}", hex::encode([6u8; 32]))));
        assert!(output.contains(&format!("key={}", hex::encode([7u8; 32]))));
        assert!(output.contains(&format!("iv={}", hex::encode([b't'; 12]))));
        assert!(output.contains(&format!("hp={}", hex::encode([9u8; 32]))));
    }

    proptest! {
        #[test]
        fn installed_never_regresses(
            ops in vec((0usize..4, any::<bool>(), any::<bool>()), 0..32),
        ) {
            let mut keys = keys(TestBackend::new());
            let mut active = [[false; 2]; 4];
            for level in Level::ALL {
                for dir in Direction::ALL {
                    active[level.index()][dir.index()] = keys.is_level_active(level, dir);
                }
            }

            for (level, transmit, fail) in ops {
                let level = Level::ALL[level];
                let dir = if transmit { Direction::Transmit } else { Direction::Receive };
                keys.backend().fail.set(fail);
                let result = match dir {
                    Direction::Receive => keys.install_receive_key(level, &[9; 32]),
                    Direction::Transmit => keys.install_transmit_key(level, &[9; 32]),
                };
                let expect_ok = !fail && level != Level::Early;
                prop_assert_eq!(result.is_ok(), expect_ok);
                active[level.index()][dir.index()] |= expect_ok;

                for level in Level::ALL {
                    for dir in Direction::ALL {
                        prop_assert_eq!(
                            keys.is_level_active(level, dir),
                            active[level.index()][dir.index()]
                        );
                    }
                }
            }
        }
    }

    fn subscribe() -> tracing::subscriber::DefaultGuard {
        let sub = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(|| TestWriter)
            .finish();
        tracing::subscriber::set_default(sub)
    }

    /// Like `subscribe`, but collects every event at `debug` and above for inspection
    fn capture() -> (tracing::subscriber::DefaultGuard, Arc<Mutex<Vec<u8>>>) {
        let writer = CaptureWriter::default();
        let output = writer.0.clone();
        let sub = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::new("debug"))
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        (tracing::subscriber::set_default(sub), output)
    }

    #[derive(Clone, Default)]
    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct TestWriter;

    impl Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            print!(
                "{}",
                str::from_utf8(buf).expect("tried to log invalid UTF-8")
            );
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            io::stdout().flush()
        }
    }
}
