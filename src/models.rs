//! Input/output DTOs and schema-bearing types
//!
//! Defines all data structures used in MCP tool contracts plus the
//! normalized parameter shapes handed to protocol handlers. Each wire type
//! is annotated with `JsonSchema` for automatic schema generation. Result
//! shapes are identical regardless of backend protocol.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::registry::AccountKind;

/// Metadata included in all tool responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Tool execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope for all tools
///
/// Wraps tool-specific data with human-readable summary and execution metadata.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolEnvelope<T>
where
    T: JsonSchema,
{
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Tool-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// One email in list/search results
///
/// The `id` is protocol-native (IMAP UID rendered as a string, opaque Gmail
/// id) and is only meaningful together with `account_name`; ids are never
/// comparable across accounts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailMessage {
    /// Protocol-native message identifier
    pub id: String,
    /// Account this message belongs to
    pub account_name: String,
    /// Protocol kind of the account
    pub account_kind: AccountKind,
    /// Decoded Subject header
    pub subject: String,
    /// Decoded From header
    pub from: String,
    /// Decoded To recipients
    pub to: Vec<String>,
    /// Message date, RFC 3339 in UTC
    pub date: Option<String>,
    /// Short body/subject preview
    pub snippet: String,
    /// Whether the message is unread
    pub is_unread: bool,
    /// Whether the message carries attachments
    pub has_attachments: bool,
}

/// Attachment metadata in message details
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailAttachment {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`)
    pub content_type: String,
    /// Attachment size in bytes
    pub size_bytes: usize,
}

/// Full message detail
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EmailDetail {
    /// Protocol-native message identifier
    pub id: String,
    /// Account this message belongs to
    pub account_name: String,
    /// Protocol kind of the account
    pub account_kind: AccountKind,
    /// Decoded Subject header
    pub subject: String,
    /// Decoded From header
    pub from: String,
    /// Decoded To recipients
    pub to: Vec<String>,
    /// Decoded Cc recipients
    pub cc: Vec<String>,
    /// Message date, RFC 3339 in UTC
    pub date: Option<String>,
    /// Whether the message is unread
    pub is_unread: bool,
    /// Plain text body
    pub body_text: Option<String>,
    /// Sanitized HTML body
    pub body_html: Option<String>,
    /// Attachment metadata
    pub attachments: Vec<EmailAttachment>,
}

/// Send operation receipt
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SendReceipt {
    /// Backend message id (Gmail) or generated Message-ID (SMTP)
    pub message_id: String,
}

/// Per-id outcome of an archive call
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveOutcome {
    /// The id the caller supplied
    pub email_id: String,
    /// Whether the backend applied the archive mutation
    pub archived: bool,
    /// Failure classification when `archived` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

/// Aggregated result of an all-accounts search
///
/// Never represents a wholesale failure: unreachable accounts appear in
/// `per_account_errors` while reachable accounts still contribute messages.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FanOutResult {
    /// Merged messages, sorted and truncated to the requested limit
    pub messages: Vec<EmailMessage>,
    /// Total messages found across accounts before truncation
    pub total_found: usize,
    /// Failure classification per unreachable account
    pub per_account_errors: BTreeMap<String, ErrorKind>,
}

/// Account metadata (no credentials)
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountInfo {
    /// Account name
    pub name: String,
    /// Protocol kind
    pub kind: AccountKind,
}

/// Per-account pool statistics
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountStats {
    /// Account name
    pub name: String,
    /// Protocol kind
    pub kind: AccountKind,
    /// Whether a live pooled session exists (always false for IMAP kind,
    /// whose sessions are one-shot)
    pub session_cached: bool,
    /// Milliseconds since the pooled session was last used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_ms: Option<u64>,
}

/// One id or a batch of ids
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OneOrMany {
    /// A single value
    One(String),
    /// A list of values
    Many(Vec<String>),
}

impl OneOrMany {
    /// Flatten into a vector
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

/// Account selector for fan-out search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccountFilter {
    /// Every configured account
    #[default]
    All,
    /// Gmail-kind accounts only
    GmailOnly,
    /// IMAP-kind accounts only
    ImapOnly,
}

/// Sort order for fan-out search results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    /// Newest first
    #[default]
    Date,
    /// Query-in-subject matches first, then newest first
    Relevance,
}

/// Input: list recent emails in a folder
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListEmailsInput {
    /// Account name
    pub account_name: String,
    /// Maximum messages to return (1..100, default 20)
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Folder/label to list (default INBOX)
    pub folder: Option<String>,
    /// Only return unread messages
    #[serde(default)]
    pub unread_only: bool,
}

/// Input: search one account
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchEmailsInput {
    /// Account name
    pub account_name: String,
    /// Free-text query (accepted under either name)
    #[serde(alias = "text")]
    pub query: String,
    /// Lower date bound (epoch seconds, RFC 3339, or YYYY-MM-DD)
    pub since: Option<String>,
    /// Exclusive upper date bound (same shapes as `since`)
    pub before: Option<String>,
    /// Folders to search; defaults to inbox + conventional archive folders
    pub folders: Option<Vec<String>>,
    /// Maximum messages to return (1..100, default 20)
    #[serde(default = "default_limit")]
    pub limit: usize,
}

/// Input: fetch one message's details
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetEmailDetailInput {
    /// Account name
    pub account_name: String,
    /// Protocol-native message id from a previous list/search
    pub email_id: String,
}

/// Input: archive one or more messages
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ArchiveEmailInput {
    /// Account name
    pub account_name: String,
    /// One id or a batch of ids
    pub email_id: OneOrMany,
    /// Also clear the unread marker
    #[serde(default)]
    pub remove_unread: bool,
}

/// Input: send an email from an account
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SendEmailInput {
    /// Account name (selects the submission route)
    pub account_name: String,
    /// Recipient address(es)
    pub to: OneOrMany,
    /// Subject line
    pub subject: String,
    /// Plain text body
    pub text: Option<String>,
    /// HTML body
    pub html: Option<String>,
    /// Cc address(es)
    pub cc: Option<OneOrMany>,
    /// Bcc address(es)
    pub bcc: Option<OneOrMany>,
    /// In-Reply-To header for threading
    pub in_reply_to: Option<String>,
    /// References header for threading
    pub references: Option<String>,
}

/// Input: account name only
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AccountOnlyInput {
    /// Account name
    pub account_name: String,
}

/// Input: search every configured account
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchAllInput {
    /// Free-text query
    pub query: String,
    /// Which accounts to include (default all)
    #[serde(default)]
    pub accounts: AccountFilter,
    /// Maximum merged messages to return (1..200, default 50)
    #[serde(default = "default_fanout_limit")]
    pub limit: usize,
    /// Sort order (default date)
    #[serde(default)]
    pub sort_by: SortBy,
}

/// Normalized list parameters handed to protocol handlers
#[derive(Debug, Clone)]
pub struct ListParams {
    pub folder: Option<String>,
    pub limit: usize,
    pub unread_only: bool,
}

/// Normalized search parameters with resolved date bounds
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub text: String,
    pub since: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub folders: Option<Vec<String>>,
    pub limit: usize,
}

/// Normalized send parameters
#[derive(Debug, Clone)]
pub struct SendParams {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

/// Default value for single-account `limit`
fn default_limit() -> usize {
    20
}

/// Default value for fan-out `limit`
fn default_fanout_limit() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::{ArchiveEmailInput, OneOrMany, SearchAllInput};

    #[test]
    fn archive_input_accepts_string_or_array() {
        let single: ArchiveEmailInput =
            serde_json::from_str(r#"{"account_name":"a","email_id":"5"}"#).expect("single");
        assert_eq!(single.email_id.into_vec(), vec!["5"]);

        let batch: ArchiveEmailInput =
            serde_json::from_str(r#"{"account_name":"a","email_id":["5","6"],"remove_unread":true}"#)
                .expect("batch");
        assert_eq!(batch.email_id.into_vec(), vec!["5", "6"]);
        assert!(batch.remove_unread);
    }

    #[test]
    fn search_all_defaults() {
        let input: SearchAllInput = serde_json::from_str(r#"{"query":"invoice"}"#).expect("input");
        assert_eq!(input.limit, 50);
        assert_eq!(input.accounts, super::AccountFilter::All);
        assert_eq!(input.sort_by, super::SortBy::Date);
    }

    #[test]
    fn one_or_many_flattens() {
        let one: OneOrMany = serde_json::from_str(r#""x@y.z""#).expect("one");
        assert_eq!(one.into_vec(), vec!["x@y.z"]);
        let many: OneOrMany = serde_json::from_str(r#"["a@b.c","d@e.f"]"#).expect("many");
        assert_eq!(many.into_vec().len(), 2);
    }
}
