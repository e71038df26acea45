//! Broker configuration from the environment.
//!
//! | Variable               | Default                  |
//! |------------------------|--------------------------|
//! | `EDAS_BROKER_HOST`     | `localhost`              |
//! | `EDAS_BROKER_PORT`     | `5672` (`5671` with TLS) |
//! | `EDAS_BROKER_VHOST`    | `/`                      |
//! | `EDAS_BROKER_USERNAME` | `guest`                  |
//! | `EDAS_BROKER_PASSWORD` | `guest`                  |
//! | `EDAS_ENVIRONMENT_TAG` | unset                    |
//! | `EDAS_ENVIRONMENT`     | `local`                  |
//! | `EDAS_PREFETCH`        | `5`                      |
//! | `EDAS_HEARTBEAT_SECS`  | `600`                    |

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tracing::info;

use edas_core::ErrorKind;
use edas_events::broker::{ClientSettings, DEFAULT_PREFETCH, MIN_HEARTBEAT};

pub const HOST_VAR: &str = "EDAS_BROKER_HOST";
pub const PORT_VAR: &str = "EDAS_BROKER_PORT";
pub const VHOST_VAR: &str = "EDAS_BROKER_VHOST";
pub const USERNAME_VAR: &str = "EDAS_BROKER_USERNAME";
pub const PASSWORD_VAR: &str = "EDAS_BROKER_PASSWORD";
pub const ENVIRONMENT_TAG_VAR: &str = "EDAS_ENVIRONMENT_TAG";
pub const ENVIRONMENT_VAR: &str = "EDAS_ENVIRONMENT";
pub const PREFETCH_VAR: &str = "EDAS_PREFETCH";
pub const HEARTBEAT_VAR: &str = "EDAS_HEARTBEAT_SECS";

const PLAIN_PORT: u16 = 5672;
const TLS_PORT: u16 = 5671;

/// Preview environments are tagged like `ab-1234` or `abc-1234-feature`.
static ENVIRONMENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2,3}-\d{4}-?").expect("environment tag pattern is valid"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Local,
    Production,
}

impl FromStr for Environment {
    type Err = std::convert::Infallible;

    /// Anything but `production` is treated as a local environment.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Local
        })
    }
}

/// TLS policy for production connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub min_version: &'static str,
    pub ciphers: &'static str,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            min_version: "1.2",
            ciphers: "ECDHE+AESGCM:!ECDSA",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Effective vhost, environment tag already applied.
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub environment: Environment,
    pub tls: Option<TlsSettings>,
    pub prefetch: u16,
    pub heartbeat: Duration,
}

impl core::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"***")
            .field("environment", &self.environment)
            .field("tls", &self.tls)
            .field("prefetch", &self.prefetch)
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: PLAIN_PORT,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            environment: Environment::Local,
            tls: None,
            prefetch: DEFAULT_PREFETCH,
            heartbeat: MIN_HEARTBEAT,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source (`from_env` uses the process
    /// environment). Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let environment = get(ENVIRONMENT_VAR)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let tls = (environment == Environment::Production).then(TlsSettings::default);

        let port = match get(PORT_VAR) {
            Some(raw) => parse_number(PORT_VAR, &raw)?,
            None if tls.is_some() => TLS_PORT,
            None => PLAIN_PORT,
        };
        let prefetch = match get(PREFETCH_VAR) {
            Some(raw) => parse_number::<u16>(PREFETCH_VAR, &raw)?.max(1),
            None => DEFAULT_PREFETCH,
        };
        let heartbeat = match get(HEARTBEAT_VAR) {
            Some(raw) => Duration::from_secs(parse_number(HEARTBEAT_VAR, &raw)?).max(MIN_HEARTBEAT),
            None => MIN_HEARTBEAT,
        };

        let base_vhost = get(VHOST_VAR).unwrap_or_else(|| "/".to_string());
        let vhost = derive_vhost(&base_vhost, get(ENVIRONMENT_TAG_VAR).as_deref());

        Ok(Self {
            host: get(HOST_VAR).unwrap_or_else(|| "localhost".to_string()),
            port,
            vhost,
            username: get(USERNAME_VAR).unwrap_or_else(|| "guest".to_string()),
            password: get(PASSWORD_VAR).unwrap_or_else(|| "guest".to_string()),
            environment,
            tls,
            prefetch,
            heartbeat,
        })
    }

    pub fn uses_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Transport-independent subset handed to the broker client.
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings::default()
            .with_prefetch(self.prefetch)
            .with_heartbeat(self.heartbeat)
    }
}

/// Apply a preview environment tag to the base vhost.
///
/// `/` + `ab-1234` → `ab-1234`; `edas` + `ab-1234` → `edas-ab-1234`. Tags
/// that do not look like preview tags are ignored.
pub fn derive_vhost(base: &str, tag: Option<&str>) -> String {
    let Some(tag) = tag.map(str::trim).filter(|t| !t.is_empty()) else {
        return base.to_string();
    };

    if !ENVIRONMENT_TAG.is_match(tag) {
        info!(tag, "environment tag ignored; not a preview tag");
        return base.to_string();
    }

    let base = base.trim_matches('/');
    if base.is_empty() {
        tag.to_string()
    } else {
        format!("{base}-{tag}")
    }
}

fn parse_number<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use edas_observability::LogCapture;
    use tracing::Level;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<BrokerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BrokerConfig::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_describe_a_local_broker() {
        let config = config(&[]).unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert!(!config.uses_tls());
        assert_eq!(config.client_settings(), ClientSettings::default());
    }

    #[test]
    fn production_enables_tls_on_the_tls_port() {
        let config = config(&[(ENVIRONMENT_VAR, "production")]).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.port, 5671);
        let tls = config.tls.unwrap();
        assert_eq!(tls.min_version, "1.2");
        assert_eq!(tls.ciphers, "ECDHE+AESGCM:!ECDSA");
    }

    #[test]
    fn explicit_port_wins_over_tls_default() {
        let config = config(&[(ENVIRONMENT_VAR, "production"), (PORT_VAR, "25671")]).unwrap();
        assert_eq!(config.port, 25671);
    }

    #[test]
    fn heartbeat_is_never_below_the_minimum() {
        let low = config(&[(HEARTBEAT_VAR, "30")]).unwrap();
        assert_eq!(low.heartbeat, Duration::from_secs(600));
        let high = config(&[(HEARTBEAT_VAR, "900")]).unwrap();
        assert_eq!(high.heartbeat, Duration::from_secs(900));
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = config(&[(PREFETCH_VAR, "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                var: PREFETCH_VAR,
                value: "lots".to_string()
            }
        );
        assert!(err.to_string().contains("EDAS_PREFETCH"));
    }

    #[test]
    fn environment_tag_extends_the_vhost() {
        assert_eq!(derive_vhost("/", Some("ab-1234")), "ab-1234");
        assert_eq!(derive_vhost("edas", Some("ab-1234")), "edas-ab-1234");
        assert_eq!(derive_vhost("edas", Some("abc-1234-login")), "edas-abc-1234-login");
        assert_eq!(derive_vhost("edas", None), "edas");

        let config = config(&[(VHOST_VAR, "edas"), (ENVIRONMENT_TAG_VAR, "ab-1234")]).unwrap();
        assert_eq!(config.vhost, "edas-ab-1234");
    }

    #[test]
    fn non_preview_tags_are_ignored_with_a_log() {
        let capture = LogCapture::new();
        let vhost = tracing::subscriber::with_default(capture.subscriber(), || {
            derive_vhost("edas", Some("staging"))
        });
        assert_eq!(vhost, "edas");
        let infos = capture.at_level(Level::INFO);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].field("tag"), Some("staging"));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config = config(&[(PASSWORD_VAR, "s3cret")]).unwrap();
        assert!(!format!("{config:?}").contains("s3cret"));
    }
}
