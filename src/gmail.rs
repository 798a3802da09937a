//! Gmail API transport and protocol handler
//!
//! Sessions are stateless HTTPS request wrappers around `reqwest` carrying
//! an OAuth2 access token refreshed lazily from the account's refresh
//! token. Unlike IMAP sessions they hold no server-side state, so the
//! session pool caches and reuses them indefinitely until an operation
//! fails with a connection-class error.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use crate::mime;
use crate::models::{EmailDetail, EmailMessage, ListParams, SearchParams, SendParams, SendReceipt};
use crate::pool::Connect;
use crate::registry::{Account, AccountKind, BackendConfig, GmailConfig};
use crate::smtp;
use crate::vault::CredentialVault;

const API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Safety margin subtracted from token lifetimes before refresh
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Access token with its expiry instant
struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// Live Gmail API session
///
/// Owned by one pool slot per account and shared via `Arc`; all methods
/// take `&self`. The token cache is the only interior mutability.
pub struct GmailSession {
    http: reqwest::Client,
    account_name: String,
    user: String,
    client_id: String,
    client_secret: SecretString,
    refresh_token: SecretString,
    access_token: tokio::sync::Mutex<Option<CachedToken>>,
}

/// Pool connector for Gmail-kind accounts
///
/// Resolves vault-encrypted credentials and performs the initial token
/// exchange as the connect handshake, so a dead or misconfigured account
/// fails inside the pool's connect timeout instead of on first use.
pub struct GmailConnector {
    config: std::sync::Arc<GatewayConfig>,
    vault: std::sync::Arc<CredentialVault>,
}

impl GmailConnector {
    pub fn new(
        config: std::sync::Arc<GatewayConfig>,
        vault: std::sync::Arc<CredentialVault>,
    ) -> Self {
        Self { config, vault }
    }
}

#[async_trait]
impl Connect for GmailConnector {
    type Session = GmailSession;

    async fn connect(&self, account: &Account) -> AppResult<GmailSession> {
        let BackendConfig::Gmail(gmail) = &account.backend else {
            return Err(AppError::Internal(format!(
                "account '{}' routed to the gmail connector without gmail config",
                account.name
            )));
        };
        let session = GmailSession::new(&self.config, &account.name, gmail, &self.vault)?;
        // Token exchange doubles as the connect handshake.
        session.access_token().await?;
        debug!(account = %account.name, "gmail session opened");
        Ok(session)
    }
}

impl GmailSession {
    /// Build a session, resolving stored credentials through the vault
    fn new(
        config: &GatewayConfig,
        account_name: &str,
        gmail: &GmailConfig,
        vault: &CredentialVault,
    ) -> AppResult<Self> {
        let client_secret = vault.resolve(gmail.client_secret.expose_secret())?;
        let refresh_token = vault.resolve(gmail.refresh_token.expose_secret())?;
        let http = reqwest::Client::builder()
            .timeout(config.operation_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| AppError::Internal(format!("http client build failed: {e}")))?;

        Ok(Self {
            http,
            account_name: account_name.to_owned(),
            user: gmail.user.clone(),
            client_id: gmail.client_id.clone(),
            client_secret,
            refresh_token,
            access_token: tokio::sync::Mutex::new(None),
        })
    }

    /// Current access token, refreshing through the OAuth2 endpoint when
    /// missing or near expiry
    async fn access_token(&self) -> AppResult<SecretString> {
        let mut cache = self.access_token.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN
        {
            return Ok(cached.token.clone());
        }

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", self.refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
                AppError::Auth(format!("token refresh rejected ({status}): {body}"))
            } else {
                AppError::Protocol(format!("token refresh failed ({status})"))
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::Protocol(format!("token response malformed: {e}")))?;

        let secret = SecretString::new(token.access_token.into());
        *cache = Some(CachedToken {
            token: secret.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(secret)
    }

    /// Authenticated GET returning a decoded JSON body
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
        context: &str,
    ) -> AppResult<T> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;
        decode_response(response, context).await
    }

    /// List recent messages in a folder/label
    pub async fn list_emails(&self, params: &ListParams) -> AppResult<Vec<EmailMessage>> {
        let mut q = vec![folder_clause(params.folder.as_deref())];
        if params.unread_only {
            q.push("is:unread".to_owned());
        }
        self.query_messages(&q.join(" "), params.limit).await
    }

    /// Search messages using Gmail's native query syntax
    ///
    /// Date bounds are translated to epoch-second `after:`/`before:`
    /// tokens, which Gmail evaluates precisely regardless of the user's
    /// calendar timezone. Without explicit folders the query spans all
    /// mail (Gmail's default scope, inbox + archive).
    pub async fn search_emails(&self, params: &SearchParams) -> AppResult<Vec<EmailMessage>> {
        let mut q = Vec::new();
        if !params.text.is_empty() {
            q.push(params.text.clone());
        }
        if let Some(since) = params.since {
            q.push(format!("after:{}", since.timestamp()));
        }
        if let Some(before) = params.before {
            q.push(format!("before:{}", before.timestamp()));
        }
        if let Some(folders) = &params.folders
            && !folders.is_empty()
        {
            let clauses: Vec<String> = folders.iter().map(|f| folder_clause(Some(f))).collect();
            q.push(format!("{{{}}}", clauses.join(" ")));
        }
        self.query_messages(&q.join(" "), params.limit).await
    }

    /// Shared list/search implementation
    async fn query_messages(&self, q: &str, limit: usize) -> AppResult<Vec<EmailMessage>> {
        let list: MessageListResponse = self
            .get_json(
                &format!("{API_BASE}/messages"),
                &[
                    ("maxResults", limit.to_string()),
                    ("q", q.to_owned()),
                ],
                "list messages",
            )
            .await?;

        let mut messages = Vec::new();
        for item in list.messages.unwrap_or_default().into_iter().take(limit) {
            let meta: MessageMetadataResponse = self
                .get_json(
                    &format!("{API_BASE}/messages/{}", item.id),
                    &[
                        ("format", "metadata".to_owned()),
                        ("metadataHeaders", "Subject".to_owned()),
                        ("metadataHeaders", "From".to_owned()),
                        ("metadataHeaders", "To".to_owned()),
                        ("metadataHeaders", "Date".to_owned()),
                        ("metadataHeaders", "Content-Type".to_owned()),
                    ],
                    "get message metadata",
                )
                .await?;
            messages.push(self.summary_from_metadata(meta));
        }
        Ok(messages)
    }

    /// Fetch full message detail
    pub async fn get_detail(&self, email_id: &str) -> AppResult<EmailDetail> {
        let raw: MessageRawResponse = self
            .get_json(
                &format!("{API_BASE}/messages/{email_id}"),
                &[("format", "raw".to_owned())],
                "get message",
            )
            .await?;

        let encoded = raw
            .raw
            .ok_or_else(|| AppError::Protocol("message response missing raw body".to_owned()))?;
        let bytes = decode_raw(&encoded)?;
        let parsed = mime::parse_message(&bytes)?;
        let label_ids = raw.label_ids.unwrap_or_default();

        Ok(EmailDetail {
            id: raw.id,
            account_name: self.account_name.clone(),
            account_kind: AccountKind::Gmail,
            subject: parsed.subject,
            from: parsed.from,
            to: parsed.to,
            cc: parsed.cc,
            date: raw
                .internal_date
                .as_deref()
                .and_then(parse_internal_date)
                .or(parsed.date)
                .map(|d| d.to_rfc3339()),
            is_unread: label_ids.iter().any(|l| l == "UNREAD"),
            body_text: parsed.body_text,
            body_html: parsed.body_html,
            attachments: parsed.attachments,
        })
    }

    /// Archive a message by label mutation
    ///
    /// Removes the `INBOX` marker (and `UNREAD` when requested); the
    /// message stays reachable under All Mail.
    pub async fn archive(&self, email_id: &str, remove_unread: bool) -> AppResult<bool> {
        let mut remove = vec!["INBOX"];
        if remove_unread {
            remove.push("UNREAD");
        }

        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{API_BASE}/messages/{email_id}/modify"))
            .bearer_auth(token.expose_secret())
            .json(&serde_json::json!({ "removeLabelIds": remove }))
            .send()
            .await
            .map_err(classify_transport)?;
        let _: serde_json::Value = decode_response(response, "archive message").await?;
        Ok(true)
    }

    /// Send a message through the Gmail API
    pub async fn send(&self, params: &SendParams) -> AppResult<SendReceipt> {
        let (message, _generated_id) = smtp::build_mime_message(&self.user, params)?;
        let raw = URL_SAFE_NO_PAD.encode(message.formatted());

        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{API_BASE}/messages/send"))
            .bearer_auth(token.expose_secret())
            .json(&serde_json::json!({ "raw": raw }))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    AppError::Auth(format!("send rejected ({status}): {body}"))
                } else {
                    AppError::Send(format!("send failed ({status}): {body}"))
                },
            );
        }

        let sent: SentMessageResponse = response
            .json()
            .await
            .map_err(|e| AppError::Protocol(format!("send response malformed: {e}")))?;
        Ok(SendReceipt {
            message_id: sent.id,
        })
    }

    /// Fetch the account profile (used by `test_connection`)
    pub async fn profile(&self) -> AppResult<serde_json::Value> {
        let profile: ProfileResponse = self
            .get_json(&format!("{API_BASE}/profile"), &[], "get profile")
            .await?;
        Ok(serde_json::json!({
            "email_address": profile.email_address,
            "messages_total": profile.messages_total,
        }))
    }

    /// Build an [`EmailMessage`] from a metadata fetch
    fn summary_from_metadata(&self, meta: MessageMetadataResponse) -> EmailMessage {
        let headers = meta
            .payload
            .map(|p| p.headers)
            .unwrap_or_default()
            .into_iter()
            .map(|h| (h.name, h.value))
            .collect::<Vec<_>>();
        let map = mime::to_header_map(&headers);
        let label_ids = meta.label_ids.unwrap_or_default();

        EmailMessage {
            id: meta.id,
            account_name: self.account_name.clone(),
            account_kind: AccountKind::Gmail,
            subject: map.get("subject").cloned().unwrap_or_default(),
            from: map.get("from").cloned().unwrap_or_default(),
            to: mime::split_addresses(map.get("to").map(String::as_str).unwrap_or_default()),
            date: meta
                .internal_date
                .as_deref()
                .and_then(parse_internal_date)
                .or_else(|| map.get("date").and_then(|d| mime::parse_mail_date(d)))
                .map(|d| d.to_rfc3339()),
            snippet: mime::snippet_from(&meta.snippet.unwrap_or_default()),
            is_unread: label_ids.iter().any(|l| l == "UNREAD"),
            has_attachments: map
                .get("content-type")
                .is_some_and(|ct| ct.to_ascii_lowercase().contains("multipart/mixed")),
        }
    }
}

/// Translate a folder name to a Gmail query clause
///
/// `INBOX` and the well-known system folders map to `in:`; anything else
/// is treated as a user label.
fn folder_clause(folder: Option<&str>) -> String {
    let folder = folder.unwrap_or("INBOX");
    match folder.to_ascii_lowercase().as_str() {
        "inbox" | "sent" | "trash" | "spam" | "drafts" => format!("in:{}", folder.to_lowercase()),
        "archive" | "all mail" | "[gmail]/all mail" => "-in:inbox -in:trash -in:spam".to_owned(),
        other => format!("label:{}", other.replace(' ', "-")),
    }
}

/// Decode Gmail's base64url raw message payload
fn decode_raw(encoded: &str) -> AppResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.as_bytes())
        .or_else(|_| URL_SAFE.decode(encoded.as_bytes()))
        .map_err(|e| AppError::Protocol(format!("invalid raw message payload: {e}")))
}

/// Parse Gmail's `internalDate` (epoch milliseconds as a string)
fn parse_internal_date(raw: &str) -> Option<DateTime<Utc>> {
    let millis = raw.parse::<i64>().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Classify a reqwest transport error into the gateway taxonomy
fn classify_transport(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(format!("gmail api request timed out: {e}"))
    } else if e.is_connect() {
        AppError::Connection(format!("gmail api connect failed: {e}"))
    } else {
        AppError::Connection(format!("gmail api request failed: {e}"))
    }
}

/// Decode a response, mapping HTTP status classes to the error taxonomy
async fn decode_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    context: &str,
) -> AppResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                AppError::Auth(format!("{context} rejected ({status}): {body}"))
            } else if status == StatusCode::NOT_FOUND {
                AppError::NotFound(format!("{context}: message not found"))
            } else {
                AppError::Protocol(format!("{context} failed ({status})"))
            },
        );
    }
    response
        .json()
        .await
        .map_err(|e| AppError::Protocol(format!("{context} response malformed: {e}")))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageMetadataResponse {
    id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    snippet: Option<String>,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize, Default)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<MessageHeader>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct MessageRawResponse {
    id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    raw: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessageResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "messagesTotal")]
    messages_total: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::{decode_raw, folder_clause, parse_internal_date};

    #[test]
    fn folder_clauses_cover_system_and_user_labels() {
        assert_eq!(folder_clause(None), "in:inbox");
        assert_eq!(folder_clause(Some("Sent")), "in:sent");
        assert_eq!(folder_clause(Some("Archive")), "-in:inbox -in:trash -in:spam");
        assert_eq!(folder_clause(Some("Project X")), "label:project-x");
    }

    #[test]
    fn raw_decoding_accepts_padded_and_unpadded() {
        use base64::Engine as _;
        use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};

        let plain = b"From: a@b.c\r\n\r\nhi";
        assert_eq!(
            decode_raw(&URL_SAFE_NO_PAD.encode(plain)).expect("no pad"),
            plain
        );
        assert_eq!(decode_raw(&URL_SAFE.encode(plain)).expect("padded"), plain);
        assert!(decode_raw("!!!not-base64!!!").is_err());
    }

    #[test]
    fn internal_date_is_epoch_millis() {
        let dt = parse_internal_date("1735689600000").expect("millis");
        assert_eq!(dt.to_rfc3339(), "2025-01-01T00:00:00+00:00");
        assert!(parse_internal_date("not-a-number").is_none());
    }
}
