use std::{fmt, sync::Arc};

use crate::secret_log::{NoSecretLog, SecretLog};

/// Parameters governing key installation
///
/// The default configuration never exposes secrets. Enabling [`show_secrets`](Self::show_secrets)
/// hands every installed secret and its derived keys to the configured [`SecretLog`], which is
/// useful when decrypting captures of a test connection and must never be done in production.
#[derive(Clone)]
pub struct KeyConfig {
    pub(crate) show_secrets: bool,
    pub(crate) secret_log: Arc<dyn SecretLog>,
}

impl KeyConfig {
    /// Whether newly installed secrets and keys are passed to the secret log
    ///
    /// Defaults to `false`.
    pub fn show_secrets(&mut self, value: bool) -> &mut Self {
        self.show_secrets = value;
        self
    }

    /// Sink that receives secrets when [`show_secrets`](Self::show_secrets) is enabled
    ///
    /// Defaults to [`NoSecretLog`].
    pub fn secret_log(&mut self, value: Arc<dyn SecretLog>) -> &mut Self {
        self.secret_log = value;
        self
    }

    /// Whether an install should be reported to the secret log
    pub(crate) fn logs_secrets(&self) -> bool {
        self.show_secrets && self.secret_log.will_log()
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            show_secrets: false,
            secret_log: Arc::new(NoSecretLog),
        }
    }
}

impl fmt::Debug for KeyConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            show_secrets,
            secret_log: _,
        } = self;
        fmt.debug_struct("KeyConfig")
            .field("show_secrets", show_secrets)
            .finish_non_exhaustive()
    }
}
