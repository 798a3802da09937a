//! Configuration module for gateway accounts and runtime settings
//!
//! All configuration is loaded from environment variables following the pattern
//! `MAIL_GW_<SEGMENT>_<KEY>`. Account segments are discovered by scanning for
//! `MAIL_GW_*_KIND` variables; the `KIND` value (`gmail` or `imap`) selects
//! which further variables the segment requires. Classification is explicit —
//! the gateway never infers a protocol from an account's name.

use std::env;
use std::env::VarError;
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;

use crate::errors::{AppError, AppResult};
use crate::registry::{Account, BackendConfig, GmailConfig, ImapConfig};

/// Gateway-wide configuration
///
/// Built once at startup and injected into components via `Arc`; no code
/// reads the environment after load. Timeout defaults: 30s connect, 60s
/// operation, 25s fan-out branch, 45s fan-out deadline.
#[derive(Debug)]
pub struct GatewayConfig {
    /// All configured accounts in declaration order
    pub accounts: Vec<Account>,
    /// Vault master secret for encrypted credentials
    pub master_secret: Option<SecretString>,
    /// Session connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-operation timeout in milliseconds (independent of connect)
    pub operation_timeout_ms: u64,
    /// Per-account branch timeout inside fan-out search, milliseconds
    pub fanout_branch_timeout_ms: u64,
    /// Overall fan-out deadline in milliseconds
    pub fanout_deadline_ms: u64,
    /// Explicit process timezone override (offset form, e.g. `+02:00`)
    pub process_timezone: Option<String>,
    /// App-level default timezone (offset form)
    pub default_timezone: Option<String>,
}

impl GatewayConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers accounts by scanning for `MAIL_GW_*_KIND` patterns. At
    /// least one account must be configured.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if required environment variables are missing
    /// or malformed, no accounts are defined, or the fan-out branch timeout
    /// is not shorter than the overall deadline.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_GW_PERSONAL_KIND=gmail
    /// MAIL_GW_PERSONAL_USER=user@gmail.com
    /// MAIL_GW_PERSONAL_CLIENT_ID=...apps.googleusercontent.com
    /// MAIL_GW_PERSONAL_CLIENT_SECRET=...
    /// MAIL_GW_PERSONAL_REFRESH_TOKEN=<iv-hex>:<ciphertext-hex>
    /// MAIL_GW_WORK_KIND=imap
    /// MAIL_GW_WORK_HOST=imap.company.com
    /// MAIL_GW_WORK_USER=user@company.com
    /// MAIL_GW_WORK_PASS=app-password
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let account_pattern = Regex::new(r"^MAIL_GW_([A-Z0-9_]+)_KIND$")
            .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;

        let mut account_segments: Vec<String> = env::vars()
            .filter_map(|(k, _)| {
                account_pattern
                    .captures(&k)
                    .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
            })
            .collect();
        account_segments.sort();
        account_segments.dedup();

        if account_segments.is_empty() {
            return Err(AppError::invalid(
                "no accounts configured; define at least one MAIL_GW_<NAME>_KIND",
            ));
        }

        let mut accounts = Vec::with_capacity(account_segments.len());
        for seg in account_segments {
            accounts.push(load_account(&seg)?);
        }

        let config = Self {
            accounts,
            master_secret: optional_env("MAIL_GW_MASTER_SECRET")
                .map(|s| SecretString::new(s.into())),
            connect_timeout_ms: parse_u64_env("MAIL_GW_CONNECT_TIMEOUT_MS", 30_000)?,
            operation_timeout_ms: parse_u64_env("MAIL_GW_OPERATION_TIMEOUT_MS", 60_000)?,
            fanout_branch_timeout_ms: parse_u64_env("MAIL_GW_FANOUT_BRANCH_TIMEOUT_MS", 25_000)?,
            fanout_deadline_ms: parse_u64_env("MAIL_GW_FANOUT_DEADLINE_MS", 45_000)?,
            process_timezone: optional_env("MAIL_GW_TZ"),
            default_timezone: optional_env("MAIL_GW_DEFAULT_TZ"),
        };

        if config.fanout_branch_timeout_ms >= config.fanout_deadline_ms {
            return Err(AppError::invalid(
                "MAIL_GW_FANOUT_BRANCH_TIMEOUT_MS must be shorter than MAIL_GW_FANOUT_DEADLINE_MS",
            ));
        }

        Ok(config)
    }

    /// Session connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-operation timeout
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Per-account branch timeout for fan-out search
    pub fn fanout_branch_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_branch_timeout_ms)
    }

    /// Overall fan-out deadline
    pub fn fanout_deadline(&self) -> Duration {
        Duration::from_millis(self.fanout_deadline_ms)
    }
}

/// Load a single account configuration from environment
///
/// Reads `MAIL_GW_<SEGMENT>_KIND` and the kind-specific variable set.
/// The segment name is normalized to lowercase for the account name.
fn load_account(segment: &str) -> AppResult<Account> {
    let prefix = format!("MAIL_GW_{segment}_");
    let name = segment.to_ascii_lowercase();
    let kind = required_env(&format!("{prefix}KIND"))?;

    let backend = match kind.trim().to_ascii_lowercase().as_str() {
        "gmail" => BackendConfig::Gmail(GmailConfig {
            user: required_env(&format!("{prefix}USER"))?,
            client_id: required_env(&format!("{prefix}CLIENT_ID"))?,
            client_secret: SecretString::new(
                required_env(&format!("{prefix}CLIENT_SECRET"))?.into(),
            ),
            refresh_token: SecretString::new(
                required_env(&format!("{prefix}REFRESH_TOKEN"))?.into(),
            ),
        }),
        "imap" => {
            let host = required_env(&format!("{prefix}HOST"))?;
            let smtp_host = optional_env(&format!("{prefix}SMTP_HOST"))
                .unwrap_or_else(|| default_smtp_host(&host));
            BackendConfig::Imap(ImapConfig {
                user: required_env(&format!("{prefix}USER"))?,
                pass: SecretString::new(required_env(&format!("{prefix}PASS"))?.into()),
                port: parse_u16_env(&format!("{prefix}PORT"), 993)?,
                secure: parse_bool_env(&format!("{prefix}SECURE"), true)?,
                smtp_host,
                smtp_port: parse_u16_env(&format!("{prefix}SMTP_PORT"), 465)?,
                host,
            })
        }
        other => {
            return Err(AppError::invalid(format!(
                "{prefix}KIND must be 'gmail' or 'imap', got '{other}'"
            )));
        }
    };

    Ok(Account { name, backend })
}

/// Derive an SMTP relay host from an IMAP host
///
/// Swaps a conventional `imap.` prefix for `smtp.`; hosts without the
/// prefix are used as-is (many providers serve both on one name).
fn default_smtp_host(imap_host: &str) -> String {
    match imap_host.strip_prefix("imap.") {
        Some(rest) => format!("smtp.{rest}"),
        None => imap_host.to_owned(),
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::invalid(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable, treating empty as unset
fn optional_env(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match env::var(key) {
        Ok(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::invalid(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u16` environment variable with default fallback
fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u16>()
            .map_err(|_| AppError::invalid(format!("invalid u16 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v
            .parse::<u64>()
            .map_err(|_| AppError::invalid(format!("invalid u64 environment variable {key}: '{v}'"))),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::invalid(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{default_smtp_host, parse_bool_value};

    #[test]
    fn parse_bool_value_accepts_common_truthy_and_falsy_values() {
        for truthy in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert_eq!(parse_bool_value(truthy), Some(true));
        }

        for falsy in ["0", "false", "FALSE", " no ", "N", "off"] {
            assert_eq!(parse_bool_value(falsy), Some(false));
        }
    }

    #[test]
    fn parse_bool_value_rejects_unrecognized_values() {
        for invalid in ["", "2", "maybe", "enabled", "disabled"] {
            assert_eq!(parse_bool_value(invalid), None);
        }
    }

    #[test]
    fn smtp_host_swaps_conventional_imap_prefix() {
        assert_eq!(default_smtp_host("imap.fastmail.com"), "smtp.fastmail.com");
        assert_eq!(default_smtp_host("mail.example.org"), "mail.example.org");
    }
}
