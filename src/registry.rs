//! Account registry and protocol classification
//!
//! Holds the immutable list of configured accounts and answers
//! lookup-by-name and lookup-by-kind queries. The protocol kind comes from
//! the explicit configuration tag carried in [`BackendConfig`]; the
//! registry performs no I/O and no name-based guessing.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

/// Protocol kind of a configured account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// OAuth2-authenticated Gmail REST API; pooled, reusable sessions
    Gmail,
    /// Raw IMAP over TLS with SMTP submission; one session per operation
    Imap,
}

impl AccountKind {
    /// Lowercase label used in summaries and stats
    pub fn label(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Imap => "imap",
        }
    }
}

/// Gmail account credentials
///
/// `client_secret` and `refresh_token` hold the *stored* values, which may
/// be vault-encrypted; they are resolved through the vault when a session
/// is constructed, so a bad master key surfaces as `Auth` per operation
/// rather than at startup.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    /// Account email address
    pub user: String,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret (stored form)
    pub client_secret: SecretString,
    /// OAuth2 refresh token (stored form)
    pub refresh_token: SecretString,
}

/// IMAP + SMTP account configuration
#[derive(Debug, Clone)]
pub struct ImapConfig {
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (typically 993)
    pub port: u16,
    /// Whether to use TLS (enforced to `true`)
    pub secure: bool,
    /// Login username
    pub user: String,
    /// Password (stored form, may be vault-encrypted)
    pub pass: SecretString,
    /// SMTP submission relay hostname
    pub smtp_host: String,
    /// SMTP submission port (465 implicit TLS, 587 STARTTLS)
    pub smtp_port: u16,
}

/// Protocol-specific backend configuration
///
/// The single source of truth for an account's kind.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    Gmail(GmailConfig),
    Imap(ImapConfig),
}

/// One configured account
///
/// Immutable after load; never mutated; lives for the process lifetime.
#[derive(Debug, Clone)]
pub struct Account {
    /// Unique account name (lowercase config segment)
    pub name: String,
    /// Protocol-specific configuration
    pub backend: BackendConfig,
}

impl Account {
    /// Protocol kind derived from the backend configuration
    pub fn kind(&self) -> AccountKind {
        match self.backend {
            BackendConfig::Gmail(_) => AccountKind::Gmail,
            BackendConfig::Imap(_) => AccountKind::Imap,
        }
    }
}

/// Immutable account lookup table
///
/// Keyed by account name; at most one entry per name (later duplicates are
/// rejected at load).
#[derive(Debug)]
pub struct AccountRegistry {
    accounts: BTreeMap<String, Account>,
}

impl AccountRegistry {
    /// Build the registry from loaded account configs
    ///
    /// Pure and idempotent; the only failure is a duplicate name, which
    /// indicates a broken config scan.
    pub fn load(accounts: Vec<Account>) -> AppResult<Self> {
        let mut map = BTreeMap::new();
        for account in accounts {
            let name = account.name.clone();
            if map.insert(name.clone(), account).is_some() {
                return Err(AppError::Internal(format!(
                    "duplicate account name '{name}'"
                )));
            }
        }
        Ok(Self { accounts: map })
    }

    /// Get account by name
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account name is not configured.
    pub fn get(&self, name: &str) -> AppResult<&Account> {
        self.accounts
            .get(name)
            .ok_or_else(|| AppError::NotFound(format!("account '{name}' is not configured")))
    }

    /// All accounts in name order
    pub fn all(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Accounts of one protocol kind, in name order
    pub fn of_kind(&self, kind: AccountKind) -> Vec<&Account> {
        self.accounts.values().filter(|a| a.kind() == kind).collect()
    }

    /// Number of configured accounts
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether the registry holds no accounts
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::{Account, AccountKind, AccountRegistry, BackendConfig, GmailConfig, ImapConfig};
    use crate::errors::ErrorKind;

    fn gmail_account(name: &str) -> Account {
        Account {
            name: name.to_owned(),
            backend: BackendConfig::Gmail(GmailConfig {
                user: format!("{name}@gmail.com"),
                client_id: "client-id".to_owned(),
                client_secret: SecretString::new("client-secret".to_owned().into()),
                refresh_token: SecretString::new("refresh-token".to_owned().into()),
            }),
        }
    }

    fn imap_account(name: &str) -> Account {
        Account {
            name: name.to_owned(),
            backend: BackendConfig::Imap(ImapConfig {
                host: "imap.example.com".to_owned(),
                port: 993,
                secure: true,
                user: format!("{name}@example.com"),
                pass: SecretString::new("app-password".to_owned().into()),
                smtp_host: "smtp.example.com".to_owned(),
                smtp_port: 465,
            }),
        }
    }

    #[test]
    fn kind_comes_from_backend_config_not_name() {
        // A gmail-sounding name configured as IMAP stays IMAP.
        let account = imap_account("gmail_backup");
        assert_eq!(account.kind(), AccountKind::Imap);
    }

    #[test]
    fn lookup_by_name_and_kind() {
        let registry = AccountRegistry::load(vec![
            gmail_account("personal"),
            imap_account("work"),
            imap_account("archive"),
        ])
        .expect("load");

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.get("work").expect("present").kind(), AccountKind::Imap);
        assert_eq!(registry.of_kind(AccountKind::Imap).len(), 2);
        assert_eq!(registry.of_kind(AccountKind::Gmail).len(), 1);

        let err = registry.get("missing").expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = AccountRegistry::load(vec![gmail_account("dup"), imap_account("dup")])
            .expect_err("must fail");
        assert!(err.to_string().contains("duplicate"));
    }
}
