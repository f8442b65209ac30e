//! Bridge configuration read from the JSON descriptor bundled with the host app

use std::{fmt, fs, io, path::Path, str::FromStr};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Runtime type id reported to the native SDK
pub const RUNTIME_TYPE: u32 = 9;
/// SDK type id reported to the native SDK
pub const SDK_TYPE: u32 = 11;

/// Errors raised while loading the descriptor
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The descriptor could not be read
    #[error("failed to read bridge config: {0}")]
    Io(#[from] io::Error),

    /// The descriptor is not valid JSON or has mistyped fields
    #[error("failed to parse bridge config: {0}")]
    Parse(#[from] serde_json::Error),

    /// `apiKey` or `secretKey` is missing or empty
    #[error("bridge config is missing apiKey or secretKey")]
    MissingCredentials,
}

/// How users are enrolled into in-app messaging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAppConsentStrategy {
    /// Every install is enrolled automatically
    AutoEnroll,
    /// The app asks the user and reports consent explicitly
    ExplicitByUser,
}

impl InAppConsentStrategy {
    /// The descriptor spelling of this strategy
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoEnroll => "auto-enroll",
            Self::ExplicitByUser => "explicit-by-user",
        }
    }
}

impl fmt::Display for InAppConsentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InAppConsentStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto-enroll" => Ok(Self::AutoEnroll),
            "explicit-by-user" => Ok(Self::ExplicitByUser),
            other => Err(format!("unknown in-app consent strategy `{other}`")),
        }
    }
}

/// Deferred deep linking settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeepLinkingConfig {
    /// Custom scheme/host used instead of the default link domain
    pub cname: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    enable_crash_reporting: bool,
    #[serde(default)]
    in_app_consent_strategy: Option<String>,
    #[serde(default)]
    enable_deferred_deep_linking: Option<Value>,
}

/// Parsed descriptor, reduced to what the bridge needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    api_key: String,
    secret_key: String,
    crash_reporting: bool,
    in_app: Option<InAppConsentStrategy>,
    deep_linking: Option<DeepLinkingConfig>,
}

impl BridgeConfig {
    /// Loads and parses the descriptor at `path`
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Reading bridge config from {}", path.display());
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Parses a descriptor held in memory
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(json)?;

        let (api_key, secret_key) = match (raw.api_key, raw.secret_key) {
            (Some(api), Some(secret)) if !api.is_empty() && !secret.is_empty() => (api, secret),
            _ => return Err(ConfigError::MissingCredentials),
        };

        let in_app = raw
            .in_app_consent_strategy
            .and_then(|strategy| match strategy.parse() {
                Ok(strategy) => Some(strategy),
                Err(err) => {
                    warn!("In-app messaging disabled: {}", err);
                    None
                }
            });

        let deep_linking = match raw.enable_deferred_deep_linking {
            Some(Value::Bool(true)) => Some(DeepLinkingConfig::default()),
            Some(Value::String(cname)) => Some(DeepLinkingConfig { cname: Some(cname) }),
            _ => None,
        };

        let config = Self {
            api_key,
            secret_key,
            crash_reporting: raw.enable_crash_reporting,
            in_app,
            deep_linking,
        };
        info!(
            "Bridge config loaded: crash reporting {}, in-app {}, deep linking {}",
            config.crash_reporting,
            config.in_app.map_or("off", InAppConsentStrategy::as_str),
            config.deep_linking.is_some()
        );
        Ok(config)
    }

    /// API key for the native SDK
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Secret key for the native SDK
    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    /// Whether crashes are forwarded to analytics
    pub fn crash_reporting_enabled(&self) -> bool {
        self.crash_reporting
    }

    /// In-app consent strategy, `None` when in-app messaging is off
    pub fn in_app_strategy(&self) -> Option<InAppConsentStrategy> {
        self.in_app
    }

    /// Deferred deep linking settings, `None` when disabled
    pub fn deep_linking(&self) -> Option<&DeepLinkingConfig> {
        self.deep_linking.as_ref()
    }
}

/// Identifies a runtime or SDK layer to the native SDK
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerInfo {
    /// Numeric layer type
    pub id: u32,
    /// Free-form version string
    pub version: String,
}

impl LayerInfo {
    /// The embedded runtime; its version is not discoverable from here
    pub fn runtime() -> Self {
        Self {
            id: RUNTIME_TYPE,
            version: "unknown".to_owned(),
        }
    }

    /// This bridge crate
    pub fn sdk() -> Self {
        Self {
            id: SDK_TYPE,
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn full_descriptor() {
        let config = BridgeConfig::from_json_str(
            r#"{
                "apiKey": "api",
                "secretKey": "secret",
                "enableCrashReporting": true,
                "inAppConsentStrategy": "explicit-by-user",
                "enableDeferredDeepLinking": "links.example.com",
                "somethingElse": [1, 2, 3]
            }"#,
        )
        .unwrap();

        assert_eq!(config.api_key(), "api");
        assert_eq!(config.secret_key(), "secret");
        assert!(config.crash_reporting_enabled());
        assert_eq!(
            config.in_app_strategy(),
            Some(InAppConsentStrategy::ExplicitByUser)
        );
        assert_eq!(
            config.deep_linking(),
            Some(&DeepLinkingConfig {
                cname: Some("links.example.com".to_owned())
            })
        );
    }

    #[rstest]
    #[case(r#"{"secretKey": "s"}"#)]
    #[case(r#"{"apiKey": "", "secretKey": "s"}"#)]
    #[case(r#"{"apiKey": "a"}"#)]
    fn missing_credentials(#[case] json: &str) {
        assert!(matches!(
            BridgeConfig::from_json_str(json),
            Err(ConfigError::MissingCredentials)
        ));
    }

    #[rstest]
    #[case("true", Some(DeepLinkingConfig { cname: None }))]
    #[case("false", None)]
    #[case("42", None)]
    #[case(r#""example.link""#, Some(DeepLinkingConfig { cname: Some("example.link".to_owned()) }))]
    fn deep_linking_flag_forms(#[case] value: &str, #[case] expected: Option<DeepLinkingConfig>) {
        let json = format!(
            r#"{{"apiKey": "a", "secretKey": "s", "enableDeferredDeepLinking": {value}}}"#
        );
        let config = BridgeConfig::from_json_str(&json).unwrap();
        assert_eq!(config.deep_linking().cloned(), expected);
    }

    #[test]
    fn unknown_consent_strategy_disables_in_app() {
        let config = BridgeConfig::from_json_str(
            r#"{"apiKey": "a", "secretKey": "s", "inAppConsentStrategy": "sometimes"}"#,
        )
        .unwrap();
        assert_eq!(config.in_app_strategy(), None);
        assert!(!config.crash_reporting_enabled());
    }

    #[test]
    fn mistyped_flag_is_a_parse_error() {
        assert!(matches!(
            BridgeConfig::from_json_str(
                r#"{"apiKey": "a", "secretKey": "s", "enableCrashReporting": "yes"}"#
            ),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn layer_info() {
        assert_eq!(
            serde_json::to_value(LayerInfo::runtime()).unwrap(),
            serde_json::json!({ "id": 9, "version": "unknown" })
        );
        assert_eq!(LayerInfo::sdk().id, SDK_TYPE);
    }
}
