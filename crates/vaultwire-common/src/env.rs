//! Environment variables and their parsing.
//!
//! Reading goes through [`ReadEnv`] so tests can supply a plain map instead
//! of touching the process environment. [`EnvSettings::read`] parses every
//! recognized variable up front and fails on the first malformed one; the
//! result is applied to a client configuration in a single step afterwards.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::tls::TlsConfig;

/// Server address.
pub const VAULT_ADDR: &str = "VAULT_ADDR";
/// Local agent address; takes precedence over `VAULT_ADDR`.
pub const VAULT_AGENT_ADDR: &str = "VAULT_AGENT_ADDR";
/// CA certificate file.
pub const VAULT_CACERT: &str = "VAULT_CACERT";
/// CA certificate directory.
pub const VAULT_CAPATH: &str = "VAULT_CAPATH";
/// Client certificate file.
pub const VAULT_CLIENT_CERT: &str = "VAULT_CLIENT_CERT";
/// Client key file.
pub const VAULT_CLIENT_KEY: &str = "VAULT_CLIENT_KEY";
/// Per-request timeout.
pub const VAULT_CLIENT_TIMEOUT: &str = "VAULT_CLIENT_TIMEOUT";
/// Disable server certificate verification.
pub const VAULT_SKIP_VERIFY: &str = "VAULT_SKIP_VERIFY";
/// Hostname used for certificate verification.
pub const VAULT_TLS_SERVER_NAME: &str = "VAULT_TLS_SERVER_NAME";
/// Retry bound for transient failures.
pub const VAULT_MAX_RETRIES: &str = "VAULT_MAX_RETRIES";
/// Explicit token.
pub const VAULT_TOKEN: &str = "VAULT_TOKEN";
/// Client-side rate limit, `rate[:burst]`.
pub const VAULT_RATE_LIMIT: &str = "VAULT_RATE_LIMIT";
/// Namespace header value.
pub const VAULT_NAMESPACE: &str = "VAULT_NAMESPACE";
/// Wrap TTL applied to every request.
pub const VAULT_WRAP_TTL: &str = "VAULT_WRAP_TTL";
/// Single MFA credential.
pub const VAULT_MFA: &str = "VAULT_MFA";
/// Token sink file to poll.
pub const VAULT_TOKEN_FILE_SINK_PATH: &str = "VAULT_TOKEN_FILE_SINK_PATH";
/// Name of the agent sink to ask for.
pub const VAULT_AGENT_SINK_NAME: &str = "VAULT_AGENT_SINK_NAME";

/// Source of environment variables.
pub trait ReadEnv {
    /// The value of `key`, or `None` when it is unset.
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl<S: BuildHasher> ReadEnv for HashMap<String, String, S> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl<T: ReadEnv + ?Sized> ReadEnv for &T {
    fn var(&self, key: &str) -> Option<String> {
        (**self).var(key)
    }
}

/// A parsed `VAULT_RATE_LIMIT`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitSpec {
    /// Requests admitted per second.
    pub rate: f64,
    /// Requests admitted in a single burst.
    pub burst: u32,
}

/// Every recognized variable, parsed.
///
/// Fields are `None` when the variable is unset or empty.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    /// `VAULT_ADDR`.
    pub address: Option<String>,
    /// `VAULT_AGENT_ADDR`.
    pub agent_address: Option<String>,
    /// `VAULT_MAX_RETRIES`.
    pub max_retries: Option<u32>,
    /// `VAULT_CLIENT_TIMEOUT`.
    pub timeout: Option<Duration>,
    /// `VAULT_RATE_LIMIT`.
    pub rate_limit: Option<RateLimitSpec>,
    /// TLS variables, present when at least one of them is set.
    pub tls: Option<TlsConfig>,
    /// `VAULT_TOKEN`.
    pub token: Option<SecretString>,
    /// `VAULT_NAMESPACE`.
    pub namespace: Option<String>,
    /// `VAULT_WRAP_TTL`.
    pub wrap_ttl: Option<String>,
    /// `VAULT_MFA`.
    pub mfa: Option<String>,
    /// `VAULT_TOKEN_FILE_SINK_PATH`.
    pub token_file_sink_path: Option<PathBuf>,
    /// `VAULT_AGENT_SINK_NAME`.
    pub agent_sink_name: Option<String>,
}

impl EnvSettings {
    /// Parse every recognized variable from `env`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] encountered: a malformed duration,
    /// boolean, integer or rate limit, or a client certificate without its
    /// key (or the reverse).
    pub fn read<E: ReadEnv + ?Sized>(env: &E) -> Result<Self, ConfigError> {
        let var = |key: &str| env.var(key).filter(|v| !v.is_empty());

        let max_retries = var(VAULT_MAX_RETRIES)
            .map(|v| {
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidInteger {
                        var: VAULT_MAX_RETRIES,
                        value: v.clone(),
                    })
            })
            .transpose()?;

        let timeout = var(VAULT_CLIENT_TIMEOUT)
            .map(|v| parse_duration_second(VAULT_CLIENT_TIMEOUT, &v))
            .transpose()?;

        let rate_limit = var(VAULT_RATE_LIMIT)
            .map(|v| parse_rate_limit(&v))
            .transpose()?;

        let insecure = var(VAULT_SKIP_VERIFY)
            .map(|v| parse_bool(VAULT_SKIP_VERIFY, &v))
            .transpose()?;

        let ca_cert = var(VAULT_CACERT);
        let ca_path = var(VAULT_CAPATH);
        let client_cert = var(VAULT_CLIENT_CERT);
        let client_key = var(VAULT_CLIENT_KEY);
        let server_name = var(VAULT_TLS_SERVER_NAME);

        let tls_requested = insecure.is_some()
            || ca_cert.is_some()
            || ca_path.is_some()
            || client_cert.is_some()
            || client_key.is_some()
            || server_name.is_some();

        let tls = if tls_requested {
            let tls = TlsConfig {
                ca_cert: ca_cert.map(PathBuf::from),
                ca_path: ca_path.map(PathBuf::from),
                client_cert: client_cert.map(PathBuf::from),
                client_key: client_key.map(PathBuf::from),
                server_name,
                insecure: insecure.unwrap_or(false),
            };
            tls.validate()?;
            Some(tls)
        } else {
            None
        };

        Ok(Self {
            address: var(VAULT_ADDR),
            agent_address: var(VAULT_AGENT_ADDR),
            max_retries,
            timeout,
            rate_limit,
            tls,
            token: var(VAULT_TOKEN).map(SecretString::from),
            namespace: var(VAULT_NAMESPACE),
            wrap_ttl: var(VAULT_WRAP_TTL),
            mfa: var(VAULT_MFA),
            token_file_sink_path: var(VAULT_TOKEN_FILE_SINK_PATH).map(PathBuf::from),
            agent_sink_name: var(VAULT_AGENT_SINK_NAME),
        })
    }
}

/// Parse a rate limit given as `rate:burst` or as a bare rate.
///
/// A bare rate uses its integer part as the burst.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidRateLimit`] for anything else, including
/// negative or non-finite rates.
pub fn parse_rate_limit(value: &str) -> Result<RateLimitSpec, ConfigError> {
    let value = value.trim();
    let parse_rate = |raw: &str| {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|rate| rate.is_finite() && *rate >= 0.0)
            .ok_or(ConfigError::InvalidRateLimit)
    };

    if let Some((rate, burst)) = value.split_once(':') {
        let rate = parse_rate(rate)?;
        let burst = burst
            .trim()
            .parse::<u32>()
            .map_err(|_| ConfigError::InvalidRateLimit)?;
        return Ok(RateLimitSpec { rate, burst });
    }

    let rate = parse_rate(value)?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let burst = rate.trunc().min(f64::from(u32::MAX)) as u32;
    Ok(RateLimitSpec { rate, burst })
}

/// Parse a duration where a bare integer means seconds.
///
/// Otherwise the value is a sequence of number and unit pairs such as `90s`,
/// `1m30s`, `1.5h` or `250ms`. Recognized units are `ns`, `us`, `µs`, `ms`,
/// `s`, `m` and `h`, plus a single trailing `d` for whole days.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDuration`] naming `var` when the value is
/// not understood.
pub fn parse_duration_second(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Duration::ZERO);
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    if let Some(days) = trimmed.strip_suffix('d')
        && let Ok(days) = days.parse::<u64>()
    {
        return days
            .checked_mul(24 * 60 * 60)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::InvalidDuration {
                var,
                value: value.to_string(),
            });
    }

    parse_unit_duration(trimmed).ok_or_else(|| ConfigError::InvalidDuration {
        var,
        value: value.to_string(),
    })
}

fn parse_unit_duration(input: &str) -> Option<Duration> {
    if input == "0" {
        return Some(Duration::ZERO);
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut rest = input;
    let mut nanos = 0f64;

    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let amount: f64 = rest[..number_end].parse().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        nanos += amount * scale;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(nanos / 1e9).ok()
}

/// Parse a boolean the way the server's own tooling does.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidBool`] naming `var` for anything outside
/// `1 t T TRUE true True 0 f F FALSE false False`.
pub fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use secrecy::ExposeSecret;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn rate_limit_with_burst() {
        let spec = parse_rate_limit("5:10").unwrap();
        assert!((spec.rate - 5.0).abs() < f64::EPSILON);
        assert_eq!(spec.burst, 10);
    }

    #[test]
    fn rate_limit_bare_number_uses_rate_as_burst() {
        let spec = parse_rate_limit("5").unwrap();
        assert!((spec.rate - 5.0).abs() < f64::EPSILON);
        assert_eq!(spec.burst, 5);

        let spec = parse_rate_limit("2.75").unwrap();
        assert_eq!(spec.burst, 2);
    }

    #[test]
    fn rate_limit_rejects_garbage() {
        for bad in ["fast", "5:", ":3", "5:ten", "-1", "NaN"] {
            assert_eq!(
                parse_rate_limit(bad),
                Err(ConfigError::InvalidRateLimit),
                "{bad}"
            );
        }
    }

    #[test]
    fn durations() {
        let parse = |v| parse_duration_second(VAULT_CLIENT_TIMEOUT, v).unwrap();
        assert_eq!(parse("30"), Duration::from_secs(30));
        assert_eq!(parse("90s"), Duration::from_secs(90));
        assert_eq!(parse("1m30s"), Duration::from_secs(90));
        assert_eq!(parse("250ms"), Duration::from_millis(250));
        assert_eq!(parse("1.5h"), Duration::from_secs(5400));
        assert_eq!(parse("2d"), Duration::from_secs(172_800));
        assert_eq!(parse("0"), Duration::ZERO);
    }

    #[test]
    fn bad_durations() {
        for bad in ["soon", "10x", "s", "1..5s", "-3s"] {
            assert!(
                parse_duration_second(VAULT_CLIENT_TIMEOUT, bad).is_err(),
                "{bad}"
            );
        }
    }

    #[test]
    fn bools() {
        assert!(parse_bool(VAULT_SKIP_VERIFY, "T").unwrap());
        assert!(!parse_bool(VAULT_SKIP_VERIFY, "False").unwrap());
        assert!(parse_bool(VAULT_SKIP_VERIFY, "yes").is_err());
    }

    #[test]
    fn read_settings() {
        let vars = env(&[
            (VAULT_ADDR, "https://vault.example.com:8200"),
            (VAULT_MAX_RETRIES, "4"),
            (VAULT_CLIENT_TIMEOUT, "15s"),
            (VAULT_RATE_LIMIT, "5:10"),
            (VAULT_SKIP_VERIFY, "true"),
            (VAULT_TOKEN, "s.abc"),
            (VAULT_NAMESPACE, "ns1/"),
            (VAULT_TOKEN_FILE_SINK_PATH, "/run/agent/token"),
        ]);
        let settings = EnvSettings::read(&vars).unwrap();

        assert_eq!(
            settings.address.as_deref(),
            Some("https://vault.example.com:8200")
        );
        assert_eq!(settings.max_retries, Some(4));
        assert_eq!(settings.timeout, Some(Duration::from_secs(15)));
        assert_eq!(settings.rate_limit.unwrap().burst, 10);
        assert!(settings.tls.as_ref().unwrap().insecure);
        assert_eq!(settings.token.unwrap().expose_secret(), "s.abc");
        assert_eq!(settings.namespace.as_deref(), Some("ns1/"));
        assert_eq!(
            settings.token_file_sink_path,
            Some(PathBuf::from("/run/agent/token"))
        );
    }

    #[test]
    fn empty_values_are_unset() {
        let vars = env(&[(VAULT_TOKEN, ""), (VAULT_RATE_LIMIT, "")]);
        let settings = EnvSettings::read(&vars).unwrap();
        assert!(settings.token.is_none());
        assert!(settings.rate_limit.is_none());
        assert!(settings.tls.is_none());
    }

    #[test]
    fn malformed_value_fails_the_whole_read() {
        let bad_rate = env(&[(VAULT_ADDR, "https://ok:8200"), (VAULT_RATE_LIMIT, "lots")]);
        assert_eq!(
            EnvSettings::read(&bad_rate).unwrap_err(),
            ConfigError::InvalidRateLimit
        );

        let bad_retries = env(&[(VAULT_MAX_RETRIES, "-1")]);
        assert!(matches!(
            EnvSettings::read(&bad_retries),
            Err(ConfigError::InvalidInteger { var: VAULT_MAX_RETRIES, .. })
        ));
    }

    #[test]
    fn half_a_client_identity_fails() {
        let vars = env(&[(VAULT_CLIENT_CERT, "/etc/cert.pem")]);
        assert_eq!(
            EnvSettings::read(&vars).unwrap_err(),
            ConfigError::MissingClientKey
        );
    }
}
