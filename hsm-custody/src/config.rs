//! Credentials and engine settings.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Signing attempts made by [`LowSStrategy::Resign`] unless configured otherwise.
pub const DEFAULT_RESIGN_ATTEMPTS: u32 = 20;

/// Credentials used against every token.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    /// Name of the crypto user.
    pub operator_user: String,
    /// Password of the crypto user.
    pub operator_password: String,
    /// Security officer PIN, used only while provisioning a token.
    pub so_pin: String,
}

impl Credentials {
    /// Creates a set of credentials.
    pub fn new(
        operator_user: impl Into<String>,
        operator_password: impl Into<String>,
        so_pin: impl Into<String>,
    ) -> Self {
        Self {
            operator_user: operator_user.into(),
            operator_password: operator_password.into(),
            so_pin: so_pin.into(),
        }
    }

    /// The user PIN, in the `user:password` form crypto-user logins expect.
    pub fn operator_pin(&self) -> String {
        format!("{}:{}", self.operator_user, self.operator_password)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("operator_user", &self.operator_user)
            .field("operator_password", &"<redacted>")
            .field("so_pin", &"<redacted>")
            .finish()
    }
}

/// How a high-S signature from the device is turned into a low-S one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum LowSStrategy {
    /// Replace `s` by `n - s`. A single device signature is always enough.
    #[default]
    Normalize,
    /// Ask the device for a new signature until `s` is low, at most
    /// `max_attempts` times.
    Resign {
        /// Upper bound on device signatures per transaction. At least 1.
        #[serde(deserialize_with = "deserialize_attempts")]
        max_attempts: u32,
    },
}

impl LowSStrategy {
    /// Re-signing with the default attempt bound.
    pub fn resign() -> Self {
        LowSStrategy::Resign {
            max_attempts: DEFAULT_RESIGN_ATTEMPTS,
        }
    }
}

/// Tuning of the signing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct EngineConfig {
    /// Low-S handling.
    #[serde(default)]
    pub low_s: LowSStrategy,
    /// Deadline for a whole operation, checked between device steps. Accepts
    /// humantime strings such as `"30s"`.
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub operation_timeout: Option<Duration>,
}

fn deserialize_attempts<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match u32::deserialize(deserializer)? {
        0 => Err(serde::de::Error::custom("max_attempts must be at least 1")),
        attempts => Ok(attempts),
    }
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|value| humantime::parse_duration(&value).map_err(serde::de::Error::custom))
        .transpose()
}

/// Everything needed to reach and operate an HSM.
#[derive(Debug, Clone, Deserialize)]
pub struct HsmConfig {
    /// Path of the PKCS#11 module.
    pub library_path: PathBuf,
    /// Token credentials.
    pub credentials: Credentials,
    /// Engine tuning.
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl HsmConfig {
    /// A configuration with default engine settings.
    pub fn new(library_path: impl Into<PathBuf>, credentials: Credentials) -> Self {
        Self {
            library_path: library_path.into(),
            credentials,
            engine: EngineConfig::default(),
        }
    }

    /// Sets the low-S strategy.
    pub fn with_low_s(mut self, low_s: LowSStrategy) -> Self {
        self.engine.low_s = low_s;
        self
    }

    /// Sets the per-operation deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.engine.operation_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_secrets() {
        let credentials = Credentials::new("crypto-user", "hunter2", "so-secret");
        let rendered = format!("{:?}", HsmConfig::new("/opt/lib.so", credentials.clone()));
        assert!(rendered.contains("crypto-user"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("so-secret"));
        assert_eq!(credentials.operator_pin(), "crypto-user:hunter2");
    }

    #[test]
    fn deserializes_from_json() {
        let config: HsmConfig = serde_json::from_value(serde_json::json!({
            "library_path": "/opt/cloudhsm/lib/libcloudhsm_pkcs11.so",
            "credentials": {
                "operator_user": "cu",
                "operator_password": "pw",
                "so_pin": "so"
            },
            "low_s": { "strategy": "resign", "max_attempts": 5 },
            "operation_timeout": "1m 30s"
        }))
        .unwrap();
        assert_eq!(config.engine.low_s, LowSStrategy::Resign { max_attempts: 5 });
        assert_eq!(
            config.engine.operation_timeout,
            Some(Duration::from_secs(90))
        );

        let config: HsmConfig = serde_json::from_value(serde_json::json!({
            "library_path": "/usr/lib/softhsm/libsofthsm2.so",
            "credentials": { "operator_user": "cu", "operator_password": "pw", "so_pin": "so" }
        }))
        .unwrap();
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn resigning_needs_at_least_one_attempt() {
        let err = serde_json::from_value::<EngineConfig>(serde_json::json!({
            "low_s": { "strategy": "resign", "max_attempts": 0 }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("max_attempts must be at least 1"));

        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "low_s": { "strategy": "resign", "max_attempts": 1 }
        }))
        .unwrap();
        assert_eq!(config.low_s, LowSStrategy::Resign { max_attempts: 1 });
    }
}
