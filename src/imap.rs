//! IMAP transport and protocol handler
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! mailbox-protocol implementations of the gateway operations. All network
//! calls are enforced to use TLS.
//!
//! Sessions here are one-shot: the dispatcher opens a fresh session for
//! every logical operation and closes it in a guaranteed-cleanup path.
//! Folder state (selection, cursors) is cheap to reopen and expensive to
//! keep consistent across consumers, so nothing is cached.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use chrono::{DateTime, NaiveDate, Utc};
use futures::TryStreamExt;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use crate::mime;
use crate::models::{EmailDetail, EmailMessage, ListParams, SearchParams};
use crate::registry::{AccountKind, ImapConfig};
use crate::vault::CredentialVault;

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

/// Conventional archive/all-mail folder names probed when the caller does
/// not specify folders. Compared case-insensitively against the server's
/// folder list.
const FOLDER_CANDIDATES: &[&str] = &[
    "INBOX",
    "Archive",
    "Archives",
    "All Mail",
    "[Gmail]/All Mail",
    "[Google Mail]/All Mail",
];

/// Fetch query for message summaries (headers + flags, no body download)
const SUMMARY_QUERY: &str =
    "UID FLAGS BODY.PEEK[HEADER.FIELDS (DATE FROM TO CC SUBJECT CONTENT-TYPE)]";

/// Fetch query for search candidates: summary headers plus the first 2 KiB
/// of body text for local free-text matching
const CANDIDATE_QUERY: &str =
    "UID FLAGS BODY.PEEK[HEADER.FIELDS (DATE FROM TO CC SUBJECT CONTENT-TYPE)] BODY.PEEK[TEXT]<0.2048>";

/// Per-folder cap on candidates fetched for local filtering
const MAX_CANDIDATES_PER_FOLDER: usize = 100;

/// Socket I/O timeout for individual round trips
///
/// The dispatcher additionally races the whole operation against the same
/// budget, so a stuck stream cannot outlive the operation timeout.
fn io_timeout(config: &GatewayConfig) -> Duration {
    config.operation_timeout()
}

/// Connect to IMAP server and authenticate
///
/// Performs the full connection sequence under the connect timeout budget:
/// TCP connect, TLS handshake with webpki roots, IMAP greeting, LOGIN.
/// The password is resolved through the credential vault at this point, so
/// a wrong master key surfaces as `Auth` for this operation only.
///
/// # Errors
///
/// - `Validation` if `secure` is false or hostname is invalid for TLS SNI
/// - `Timeout` if any connection phase exceeds the connect timeout
/// - `Auth` if credential resolution or LOGIN fails
/// - `Connection` for TCP, TLS, or greeting failures
pub async fn connect_authenticated(
    config: &GatewayConfig,
    account_name: &str,
    imap: &ImapConfig,
    vault: &CredentialVault,
) -> AppResult<ImapSession> {
    if !imap.secure {
        return Err(AppError::invalid(
            "insecure IMAP is not supported; set MAIL_GW_<ACCOUNT>_SECURE=true",
        ));
    }

    let pass = vault.resolve(imap.pass.expose_secret())?;
    let connect_duration = config.connect_timeout();

    let tcp = timeout(
        connect_duration,
        TcpStream::connect((imap.host.as_str(), imap.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(imap.host.clone())
        .map_err(|_| AppError::invalid("invalid IMAP host for TLS SNI"))?;
    let tls_stream = timeout(connect_duration, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(connect_duration, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}"))))?;

    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    let session = timeout(
        connect_duration,
        client.login(imap.user.as_str(), pass.expose_secret()),
    )
    .await
    .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
    .and_then(|r| {
        r.map_err(|(e, _)| {
            let msg = e.to_string();
            if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                AppError::Auth(msg)
            } else {
                AppError::Connection(msg)
            }
        })
    })?;

    debug!(account = account_name, host = %imap.host, "imap session opened");
    Ok(session)
}

/// Close a session, ignoring failures
///
/// Called from the dispatcher's cleanup path on both success and failure;
/// a broken stream must not mask the operation's own result.
pub async fn close(config: &GatewayConfig, mut session: ImapSession) {
    let _ = timeout(io_timeout(config), session.logout()).await;
}

/// Send NOOP to test connection liveness
pub async fn noop(config: &GatewayConfig, session: &mut ImapSession) -> AppResult<()> {
    timeout(io_timeout(config), session.noop())
        .await
        .map_err(|_| AppError::Timeout("NOOP timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("NOOP failed: {e}"))))
}

/// List all visible mailboxes/folders
async fn list_all_mailboxes(
    config: &GatewayConfig,
    session: &mut ImapSession,
) -> AppResult<Vec<String>> {
    let stream = timeout(io_timeout(config), session.list(None, Some("*")))
        .await
        .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("LIST failed: {e}"))))?;

    let names = timeout(io_timeout(config), stream.try_collect::<Vec<_>>())
        .await
        .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("LIST stream failed: {e}"))))?;

    Ok(names.iter().map(|n| n.name().to_owned()).collect())
}

/// Select mailbox in read-only mode (EXAMINE)
async fn select_readonly(
    config: &GatewayConfig,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<()> {
    timeout(io_timeout(config), session.examine(mailbox))
        .await
        .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for folder '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::Protocol(format!("cannot open folder '{mailbox}': {e}")))
        })?;
    Ok(())
}

/// Select mailbox in read-write mode (SELECT)
async fn select_readwrite(
    config: &GatewayConfig,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<()> {
    timeout(io_timeout(config), session.select(mailbox))
        .await
        .map_err(|_| AppError::Timeout(format!("SELECT timed out for folder '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::Protocol(format!("cannot select folder '{mailbox}': {e}")))
        })?;
    Ok(())
}

/// Search for messages matching query
///
/// Runs `UID SEARCH` and returns matching UIDs in descending order (newest
/// first).
async fn uid_search(
    config: &GatewayConfig,
    session: &mut ImapSession,
    query: &str,
) -> AppResult<Vec<u32>> {
    let set = timeout(io_timeout(config), session.uid_search(query))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid search failed: {e}"))))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(uids)
}

/// Fetch a single message with custom query
///
/// # Errors
///
/// - `NotFound` if the UID does not exist in the selected folder
async fn fetch_one(
    config: &GatewayConfig,
    session: &mut ImapSession,
    uid: u32,
    query: &str,
) -> AppResult<Fetch> {
    let stream = timeout(io_timeout(config), session.uid_fetch(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch failed: {e}"))))?;
    let fetches: Vec<Fetch> = timeout(io_timeout(config), stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid fetch stream failed: {e}"))))?;

    fetches
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("message id '{uid}' not found")))
}

/// Store flags on a message
///
/// Runs `UID STORE` with a flag query string (`+FLAGS.SILENT (...)`).
async fn uid_store(
    config: &GatewayConfig,
    session: &mut ImapSession,
    uid: u32,
    query: &str,
) -> AppResult<()> {
    let stream = timeout(io_timeout(config), session.uid_store(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid store failed: {e}"))))?;
    let _: Vec<Fetch> = timeout(io_timeout(config), stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID STORE stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Protocol(format!("uid store stream failed: {e}"))))?;
    Ok(())
}

/// List recent messages in one folder
///
/// Defaults to INBOX. Downloads headers only; the snippet is derived from
/// the subject.
pub async fn list_emails(
    config: &GatewayConfig,
    session: &mut ImapSession,
    account_name: &str,
    params: &ListParams,
) -> AppResult<Vec<EmailMessage>> {
    let folder = params.folder.as_deref().unwrap_or("INBOX");
    select_readonly(config, session, folder).await?;

    let query = if params.unread_only { "UNSEEN" } else { "ALL" };
    let uids = uid_search(config, session, query).await?;

    let mut messages = Vec::with_capacity(params.limit.min(uids.len()));
    for uid in uids.into_iter().take(params.limit) {
        let fetch = fetch_one(config, session, uid, SUMMARY_QUERY).await?;
        messages.push(summary_from_fetch(account_name, uid, &fetch)?);
    }
    Ok(messages)
}

/// Search messages across folders
///
/// Server-side search is restricted to date bounds and the unread flag;
/// free-text matching runs locally over MIME-decoded headers and a bounded
/// body prefix, because server-side `TEXT` support is unreliable across
/// implementations. Folders default to the discovered candidate list.
pub async fn search_emails(
    config: &GatewayConfig,
    session: &mut ImapSession,
    account_name: &str,
    params: &SearchParams,
) -> AppResult<Vec<EmailMessage>> {
    let (folders, folders_are_explicit) = match &params.folders {
        Some(folders) => (folders.clone(), true),
        None => {
            let available = list_all_mailboxes(config, session).await?;
            (candidate_folders(&available), false)
        }
    };

    let query = build_search_query(params.since, params.before);
    let needle = params.text.to_lowercase();

    let mut messages = Vec::new();
    for folder in folders {
        match select_readonly(config, session, &folder).await {
            Ok(()) => {}
            // Default candidates are speculative; a folder that cannot be
            // opened is skipped. Explicitly requested folders must open.
            Err(e) if !folders_are_explicit => {
                debug!(folder = %folder, error = %e, "skipping unopenable candidate folder");
                continue;
            }
            Err(e) => return Err(e),
        }

        let uids = uid_search(config, session, &query).await?;
        for uid in uids.into_iter().take(MAX_CANDIDATES_PER_FOLDER) {
            let fetch = fetch_one(config, session, uid, CANDIDATE_QUERY).await?;
            if !matches_text(&fetch, &needle)? {
                continue;
            }
            messages.push(summary_from_fetch(account_name, uid, &fetch)?);
            if messages.len() >= params.limit * 2 {
                break;
            }
        }
    }

    // Cross-folder merge: newest first, then truncate.
    messages.sort_by(|a, b| b.date.cmp(&a.date));
    messages.dedup_by(|a, b| a.id == b.id);
    messages.truncate(params.limit);
    Ok(messages)
}

/// Fetch full message detail by UID
///
/// UIDs are folder-scoped, so the candidate folders are probed in order;
/// the first folder containing the UID wins.
pub async fn get_detail(
    config: &GatewayConfig,
    session: &mut ImapSession,
    account_name: &str,
    email_id: &str,
) -> AppResult<EmailDetail> {
    let uid = parse_uid(email_id)?;
    let available = list_all_mailboxes(config, session).await?;

    for folder in candidate_folders(&available) {
        if select_readonly(config, session, &folder).await.is_err() {
            continue;
        }
        let fetch = match fetch_one(config, session, uid, "UID FLAGS RFC822").await {
            Ok(fetch) => fetch,
            Err(AppError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };

        let raw = fetch
            .body()
            .ok_or_else(|| AppError::Protocol("message has no RFC822 body".to_owned()))?;
        let parsed = mime::parse_message(raw)?;
        let is_unread = !fetch.flags().any(|f| f == Flag::Seen);

        return Ok(EmailDetail {
            id: uid.to_string(),
            account_name: account_name.to_owned(),
            account_kind: AccountKind::Imap,
            subject: parsed.subject,
            from: parsed.from,
            to: parsed.to,
            cc: parsed.cc,
            date: parsed.date.map(|d| d.to_rfc3339()),
            is_unread,
            body_text: parsed.body_text,
            body_html: parsed.body_html,
            attachments: parsed.attachments,
        });
    }

    Err(AppError::NotFound(format!(
        "message id '{email_id}' not found in any folder"
    )))
}

/// Archive a message by flag mutation
///
/// No universal "move to archive folder" primitive is reliable across
/// server implementations, so archive marks `\Deleted` (and `\Seen` when
/// `remove_unread`) in INBOX. Returns `true` once the store is applied.
pub async fn archive(
    config: &GatewayConfig,
    session: &mut ImapSession,
    email_id: &str,
    remove_unread: bool,
) -> AppResult<bool> {
    let uid = parse_uid(email_id)?;
    select_readwrite(config, session, "INBOX").await?;

    // Probe first: UID STORE on an absent UID is silently ignored by most
    // servers, which would turn a bad id into a false success.
    fetch_one(config, session, uid, "UID FLAGS").await?;

    let flags = if remove_unread {
        r"+FLAGS.SILENT (\Deleted \Seen)"
    } else {
        r"+FLAGS.SILENT (\Deleted)"
    };
    uid_store(config, session, uid, flags).await?;
    Ok(true)
}

/// Parse a protocol-native IMAP id (decimal UID)
fn parse_uid(email_id: &str) -> AppResult<u32> {
    email_id
        .parse::<u32>()
        .map_err(|_| AppError::invalid(format!("'{email_id}' is not a valid IMAP message id")))
}

/// Build the server-side UID SEARCH query from date bounds
///
/// `SINCE` is inclusive by date; `BEFORE` is exclusive, so bounds with a
/// time-of-day component round up one day and rely on local filtering for
/// precision within the day.
fn build_search_query(since: Option<DateTime<Utc>>, before: Option<DateTime<Utc>>) -> String {
    let mut parts = Vec::new();
    if let Some(since) = since {
        parts.push(format!("SINCE {}", imap_date(since.date_naive())));
    }
    if let Some(before) = before {
        let date = if before.time() == chrono::NaiveTime::MIN {
            before.date_naive()
        } else {
            before.date_naive() + chrono::Duration::days(1)
        };
        parts.push(format!("BEFORE {}", imap_date(date)));
    }
    if parts.is_empty() {
        "ALL".to_owned()
    } else {
        parts.join(" ")
    }
}

/// Format date as IMAP SEARCH date (e.g., "1-Jan-2025")
fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

/// Pick search folders from the server's folder list
///
/// Intersects the fixed candidate names with what the server actually
/// advertises, case-insensitively, preserving candidate order and
/// deduplicating.
fn candidate_folders(available: &[String]) -> Vec<String> {
    let mut folders = Vec::new();
    for candidate in FOLDER_CANDIDATES {
        let found = available
            .iter()
            .find(|name| name.eq_ignore_ascii_case(candidate));
        if let Some(name) = found
            && !folders.iter().any(|f: &String| f.eq_ignore_ascii_case(name))
        {
            folders.push(name.clone());
        }
    }
    if folders.is_empty() {
        folders.push("INBOX".to_owned());
    }
    folders
}

/// Local free-text match over decoded headers and body prefix
fn matches_text(fetch: &Fetch, needle: &str) -> AppResult<bool> {
    if needle.is_empty() {
        return Ok(true);
    }

    let headers = header_map(fetch)?;
    for key in ["subject", "from"] {
        if let Some(value) = headers.get(key)
            && value.to_lowercase().contains(needle)
        {
            return Ok(true);
        }
    }

    if let Some(text) = fetch.text() {
        let body = String::from_utf8_lossy(text);
        if body.to_lowercase().contains(needle) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Build an [`EmailMessage`] summary from a header fetch
fn summary_from_fetch(account_name: &str, uid: u32, fetch: &Fetch) -> AppResult<EmailMessage> {
    let headers = header_map(fetch)?;
    let subject = headers.get("subject").cloned().unwrap_or_default();
    let is_unread = !fetch.flags().any(|f| f == Flag::Seen);
    let has_attachments = headers
        .get("content-type")
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("multipart/mixed"));

    Ok(EmailMessage {
        id: uid.to_string(),
        account_name: account_name.to_owned(),
        account_kind: AccountKind::Imap,
        snippet: mime::snippet_from(&subject),
        subject,
        from: headers.get("from").cloned().unwrap_or_default(),
        to: mime::split_addresses(headers.get("to").map(String::as_str).unwrap_or_default()),
        date: headers
            .get("date")
            .and_then(|d| mime::parse_mail_date(d))
            .map(|d| d.to_rfc3339()),
        is_unread,
        has_attachments,
    })
}

/// Decode the fetched header block into a case-insensitive map
fn header_map(fetch: &Fetch) -> AppResult<std::collections::BTreeMap<String, String>> {
    let header_bytes = fetch
        .header()
        .or_else(|| fetch.body())
        .ok_or_else(|| AppError::Protocol("message headers not available".to_owned()))?;
    let headers = mime::parse_header_bytes(header_bytes)?;
    Ok(mime::to_header_map(&headers))
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::{build_search_query, candidate_folders, imap_date, parse_uid};

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s)
            .expect("rfc3339")
            .with_timezone(&Utc)
    }

    #[test]
    fn search_query_uses_date_bounds_only() {
        assert_eq!(build_search_query(None, None), "ALL");
        assert_eq!(
            build_search_query(Some(utc("2025-01-05T00:00:00Z")), None),
            "SINCE 5-Jan-2025"
        );
        // Midnight bound: BEFORE is already exclusive.
        assert_eq!(
            build_search_query(None, Some(utc("2025-02-01T00:00:00Z"))),
            "BEFORE 1-Feb-2025"
        );
        // Mid-day bound rounds up a day to avoid dropping same-day matches.
        assert_eq!(
            build_search_query(None, Some(utc("2025-02-01T12:30:00Z"))),
            "BEFORE 2-Feb-2025"
        );
    }

    #[test]
    fn imap_date_has_no_zero_padding() {
        assert_eq!(
            imap_date(chrono::NaiveDate::from_ymd_opt(2025, 1, 2).expect("date")),
            "2-Jan-2025"
        );
    }

    #[test]
    fn candidate_folders_intersect_with_server_list() {
        let available = vec![
            "INBOX".to_owned(),
            "Drafts".to_owned(),
            "archive".to_owned(),
            "[Gmail]/All Mail".to_owned(),
        ];
        let folders = candidate_folders(&available);
        assert_eq!(folders, vec!["INBOX", "archive", "[Gmail]/All Mail"]);
    }

    #[test]
    fn candidate_folders_fall_back_to_inbox() {
        let folders = candidate_folders(&["Weird".to_owned()]);
        assert_eq!(folders, vec!["INBOX"]);
    }

    #[test]
    fn uid_parsing_rejects_non_numeric_ids() {
        assert_eq!(parse_uid("42").expect("numeric"), 42);
        assert!(parse_uid("gmail-opaque-id").is_err());
        assert!(parse_uid("-1").is_err());
    }
}
