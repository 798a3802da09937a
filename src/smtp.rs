//! Message submission over SMTP
//!
//! IMAP-kind accounts send through their provider's submission relay using
//! `lettre`. The MIME builder here is shared with the Gmail handler, which
//! submits the same formatted message through the API instead; both routes
//! produce one receipt shape.

use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use secrecy::ExposeSecret;
use tracing::debug;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{SendParams, SendReceipt};
use crate::registry::ImapConfig;
use crate::vault::CredentialVault;

/// Build a MIME message from normalized send parameters
///
/// Returns the message plus the generated `Message-ID`, which becomes the
/// receipt for SMTP submission (the relay does not echo an id back).
///
/// # Errors
///
/// - `Validation` for unparseable addresses or a missing body
/// - `Send` if the builder rejects the assembled message
pub fn build_mime_message(from: &str, params: &SendParams) -> AppResult<(Message, String)> {
    let from_mailbox: Mailbox = from
        .parse()
        .map_err(|e| AppError::invalid(format!("invalid from address '{from}': {e}")))?;
    let domain = from
        .rsplit_once('@')
        .map(|(_, d)| d.to_owned())
        .unwrap_or_else(|| "mail.gateway".to_owned());
    let message_id = format!("<{}@{domain}>", Uuid::new_v4());

    fn parse_mailbox(addr: &str) -> AppResult<Mailbox> {
        addr.parse()
            .map_err(|e| AppError::invalid(format!("invalid address '{addr}': {e}")))
    }

    let mut builder = Message::builder()
        .from(from_mailbox)
        .subject(params.subject.clone())
        .message_id(Some(message_id.clone()));

    for to in &params.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    for cc in &params.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }
    for bcc in &params.bcc {
        builder = builder.bcc(parse_mailbox(bcc)?);
    }
    if let Some(in_reply_to) = &params.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if let Some(references) = &params.references {
        builder = builder.references(references.clone());
    }

    let message = match (&params.text, &params.html) {
        (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
            text.clone(),
            html.clone(),
        )),
        (Some(text), None) => builder.body(text.clone()),
        (None, Some(html)) => builder.singlepart(SinglePart::html(html.clone())),
        (None, None) => {
            return Err(AppError::invalid(
                "send requires at least one of text or html",
            ));
        }
    }
    .map_err(|e| AppError::Send(format!("message assembly failed: {e}")))?;

    Ok((message, message_id))
}

/// Submit a message through the account's SMTP relay
///
/// Port 587 negotiates STARTTLS; any other port (conventionally 465) uses
/// an implicit TLS wrapper.
///
/// The dispatcher races this call against the operation timeout; the
/// transport additionally carries its own socket timeout.
///
/// # Errors
///
/// - `Auth` on relay authentication failure (including vault resolution)
/// - `Send` for rejected submissions
/// - `Connection` for transport failures
pub async fn send(
    config: &GatewayConfig,
    account_name: &str,
    imap: &ImapConfig,
    vault: &CredentialVault,
    params: &SendParams,
) -> AppResult<SendReceipt> {
    let (message, message_id) = build_mime_message(&imap.user, params)?;

    let pass = vault.resolve(imap.pass.expose_secret())?;
    let creds = Credentials::new(imap.user.clone(), pass.expose_secret().to_owned());

    let builder = if imap.smtp_port == 587 {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&imap.smtp_host)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&imap.smtp_host)
    }
    .map_err(|e| AppError::Connection(format!("smtp relay setup failed: {e}")))?;

    let mailer = builder
        .port(imap.smtp_port)
        .credentials(creds)
        .timeout(Some(config.operation_timeout()))
        .build();

    mailer.send(message).await.map_err(classify_smtp_error)?;
    debug!(account = account_name, %message_id, "message submitted");
    Ok(SendReceipt { message_id })
}

/// Classify a lettre SMTP error into the gateway taxonomy
///
/// Response-level rejections (permanent or transient SMTP codes) are send
/// failures; anything else is a transport problem.
fn classify_smtp_error(e: lettre::transport::smtp::Error) -> AppError {
    let msg = e.to_string();
    if msg.to_ascii_lowercase().contains("auth") {
        AppError::Auth(msg)
    } else if e.is_permanent() || e.is_transient() {
        AppError::Send(format!("relay rejected message: {msg}"))
    } else {
        AppError::Connection(format!("smtp transport failed: {msg}"))
    }
}

#[cfg(test)]
mod tests {
    use super::build_mime_message;
    use crate::errors::ErrorKind;
    use crate::models::SendParams;

    fn params() -> SendParams {
        SendParams {
            to: vec!["rcpt@example.com".to_owned()],
            cc: vec![],
            bcc: vec![],
            subject: "Status".to_owned(),
            text: Some("All green.".to_owned()),
            html: None,
            in_reply_to: None,
            references: None,
        }
    }

    #[test]
    fn builds_plain_text_message_with_generated_message_id() {
        let (message, message_id) =
            build_mime_message("sender@example.com", &params()).expect("build");
        assert!(message_id.starts_with('<') && message_id.ends_with("@example.com>"));

        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("Subject: Status"));
        assert!(formatted.contains("All green."));
        assert!(formatted.contains(&message_id.trim_start_matches('<').trim_end_matches('>')[..8]));
    }

    #[test]
    fn threads_replies_via_headers() {
        let mut p = params();
        p.in_reply_to = Some("<orig@example.com>".to_owned());
        p.references = Some("<orig@example.com>".to_owned());
        let (message, _) = build_mime_message("sender@example.com", &p).expect("build");

        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(formatted.contains("In-Reply-To: <orig@example.com>"));
        assert!(formatted.contains("References: <orig@example.com>"));
    }

    #[test]
    fn missing_body_is_a_validation_error() {
        let mut p = params();
        p.text = None;
        let err = build_mime_message("sender@example.com", &p).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn bad_recipient_is_a_validation_error() {
        let mut p = params();
        p.to = vec!["not-an-address".to_owned()];
        let err = build_mime_message("sender@example.com", &p).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
