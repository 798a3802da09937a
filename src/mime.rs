//! Message parsing and MIME handling
//!
//! Parses RFC822 messages using `mailparse`, extracts body text/HTML, and
//! collects attachment metadata. HTML bodies are sanitized with `ammonia`.
//! Both backends funnel raw message bytes through here so details come out
//! in one shape regardless of protocol.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::EmailAttachment;

/// Maximum body characters carried into a detail response
pub const BODY_MAX_CHARS: usize = 20_000;
/// Snippet length for list/search previews
pub const SNIPPET_MAX_CHARS: usize = 200;

/// Parsed message representation
///
/// Headers are MIME-decoded (encoded words resolved) by `mailparse`.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Message date resolved to UTC
    pub date: Option<DateTime<Utc>>,
    /// Decoded From header
    pub from: String,
    /// Decoded To recipients
    pub to: Vec<String>,
    /// Decoded Cc recipients
    pub cc: Vec<String>,
    /// Decoded Subject header
    pub subject: String,
    /// Plain text body (truncated)
    pub body_text: Option<String>,
    /// Sanitized HTML body (truncated)
    pub body_html: Option<String>,
    /// Attachment metadata
    pub attachments: Vec<EmailAttachment>,
}

/// Parse RFC822 message into structured representation
///
/// # Errors
///
/// - `Protocol` if the backend returned bytes `mailparse` cannot parse
pub fn parse_message(raw: &[u8]) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Protocol(format!("failed to parse RFC822 message: {e}")))?;

    let headers = to_header_map(&to_tuples(&parsed.headers));
    let mut body_text = None;
    let mut body_html = None;
    let mut attachments = Vec::new();
    walk_parts(&parsed, &mut body_text, &mut body_html, &mut attachments);

    Ok(ParsedMessage {
        date: headers.get("date").and_then(|d| parse_mail_date(d)),
        from: headers.get("from").cloned().unwrap_or_default(),
        to: split_addresses(headers.get("to").map(String::as_str).unwrap_or_default()),
        cc: split_addresses(headers.get("cc").map(String::as_str).unwrap_or_default()),
        subject: headers.get("subject").cloned().unwrap_or_default(),
        body_text: body_text.map(|t| truncate_chars(t, BODY_MAX_CHARS)),
        body_html: body_html.map(|h| truncate_chars(h, BODY_MAX_CHARS)),
        attachments,
    })
}

/// Walk MIME part tree recursively
///
/// Extracts the first text/plain and text/html bodies and attachment
/// metadata. Attachment bodies are sized, never retained.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
    attachments: &mut Vec<EmailAttachment>,
) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let filename = attachment_filename(part, &disp.params);
        let is_attachment = disp.disposition == DispositionType::Attachment || filename.is_some();

        if !is_attachment {
            if ctype == "text/plain"
                && body_text.is_none()
                && let Ok(text) = part.get_body()
            {
                *body_text = Some(text);
            }

            if ctype == "text/html"
                && body_html.is_none()
                && let Ok(html) = part.get_body()
            {
                *body_html = Some(ammonia::clean(&html));
            }
        } else {
            let size_bytes = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
            attachments.push(EmailAttachment {
                filename,
                content_type: ctype,
                size_bytes,
            });
        }

        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, body_html, attachments);
    }
}

/// Extract attachment filename from part
///
/// Checks Content-Disposition parameter first, falls back to Content-Type
/// name parameter.
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

/// Parse header bytes into key-value pairs
///
/// Encoded words (`=?UTF-8?...?=`) are decoded by `mailparse`.
pub fn parse_header_bytes(header_bytes: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Protocol(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(&headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: &[MailHeader<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map
///
/// Returns first value for each header key (case-insensitive).
pub fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.clone());
    }
    map
}

/// Parse an RFC 2822 Date header value to UTC
pub fn parse_mail_date(raw: &str) -> Option<DateTime<Utc>> {
    let epoch = mailparse::dateparse(raw).ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

/// Split a recipient header into individual addresses
///
/// Comma-separated; display names with quoted commas are rare enough in
/// practice that header-level splitting matches what the backends return.
pub fn split_addresses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Build a single-line preview from body text
///
/// Collapses runs of whitespace and truncates to [`SNIPPET_MAX_CHARS`].
pub fn snippet_from(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(collapsed, SNIPPET_MAX_CHARS)
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::{parse_message, snippet_from, split_addresses, truncate_chars};

    #[test]
    fn truncates_unicode_by_character() {
        let input = "a😀b😀c".to_owned();
        let out = truncate_chars(input, 4);
        assert_eq!(out, "a😀b😀");
    }

    #[test]
    fn parses_simple_plain_text_message() {
        let raw = b"From: sender@example.com\r\nTo: user@example.com, second@example.com\r\nSubject: Hi\r\nDate: Wed, 1 Jan 2025 00:00:00 +0000\r\n\r\nHello there";
        let parsed = parse_message(raw).expect("parse should succeed");

        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.from, "sender@example.com");
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.body_text.as_deref(), Some("Hello there"));
        assert!(parsed.attachments.is_empty());
        assert!(parsed.date.is_some());
    }

    #[test]
    fn collects_attachment_metadata() {
        let raw = b"From: a@b.c\r\nTo: d@e.f\r\nSubject: att\r\nMIME-Version: 1.0\r\nContent-Type: multipart/mixed; boundary=\"XX\"\r\n\r\n--XX\r\nContent-Type: text/plain\r\n\r\nbody\r\n--XX\r\nContent-Type: application/pdf; name=\"report.pdf\"\r\nContent-Disposition: attachment; filename=\"report.pdf\"\r\n\r\n%PDF-1.4 fake\r\n--XX--\r\n";
        let parsed = parse_message(raw).expect("parse should succeed");

        assert_eq!(parsed.body_text.as_deref(), Some("body"));
        assert_eq!(parsed.attachments.len(), 1);
        let att = &parsed.attachments[0];
        assert_eq!(att.filename.as_deref(), Some("report.pdf"));
        assert_eq!(att.content_type, "application/pdf");
        assert!(att.size_bytes > 0);
    }

    #[test]
    fn snippet_collapses_whitespace() {
        assert_eq!(snippet_from("a\n\n  b\tc"), "a b c");
    }

    #[test]
    fn address_splitting_skips_empty_segments() {
        assert_eq!(split_addresses("a@b.c, ,d@e.f"), vec!["a@b.c", "d@e.f"]);
        assert!(split_addresses("").is_empty());
    }
}
