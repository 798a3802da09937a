//! MCP server implementation with tool handlers
//!
//! Implements the `ServerHandler` trait and registers the gateway tools.
//! Handles input validation (always before any session is touched),
//! operation construction, and response formatting. Protocol routing and
//! session lifecycles live in the dispatcher.

use std::sync::Arc;
use std::time::Instant;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{ErrorData, ServerCapabilities, ServerInfo};
use rmcp::{Json, ServerHandler, tool, tool_handler, tool_router};

use crate::config::GatewayConfig;
use crate::dates::{TimezonePolicy, parse_date_bound};
use crate::dispatch::{Dispatcher, Operation, OperationResult};
use crate::errors::{AppError, AppResult};
use crate::fanout::{self, FanOutOptions};
use crate::models::{
    AccountFilter, AccountInfo, AccountOnlyInput, AccountStats, ArchiveEmailInput, ArchiveOutcome,
    EmailDetail, EmailMessage, FanOutResult, GetEmailDetailInput, ListEmailsInput, ListParams,
    Meta, SearchAllInput, SearchEmailsInput, SearchParams, SendEmailInput, SendParams,
    SendReceipt, ToolEnvelope,
};
use crate::registry::{AccountKind, AccountRegistry};
use crate::vault::CredentialVault;

/// Upper bound on single-account list/search limits
const MAX_LIMIT: usize = 100;
/// Upper bound on fan-out merged result limits
const MAX_FANOUT_LIMIT: usize = 200;
/// Upper bound on ids in one archive batch
const MAX_ARCHIVE_BATCH: usize = 50;

/// Mail gateway MCP server
///
/// Holds shared configuration and the dispatcher (which owns the Gmail
/// session pool). Implements MCP tool handlers via the `#[tool]` attribute
/// macro and `ServerHandler` trait.
#[derive(Clone)]
pub struct MailGatewayServer {
    /// Gateway config (accounts, timeouts)
    config: Arc<GatewayConfig>,
    /// Operation router and session owner
    dispatcher: Arc<Dispatcher>,
    /// Timezone precedence for bare-date search bounds
    timezones: TimezonePolicy,
    /// Tool router for dispatching MCP tool calls
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MailGatewayServer {
    /// Create a new MCP server instance
    ///
    /// Builds the credential vault, account registry, and dispatcher from
    /// the loaded configuration.
    pub fn new(config: GatewayConfig) -> AppResult<Self> {
        let config = Arc::new(config);
        let vault = Arc::new(CredentialVault::from_secret(config.master_secret.as_ref())?);
        let registry = Arc::new(AccountRegistry::load(config.accounts.clone())?);
        let timezones = TimezonePolicy::from_config(&config)?;
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config), registry, vault));

        Ok(Self {
            config,
            dispatcher,
            timezones,
            tool_router: Self::tool_router(),
        })
    }

    /// Tool: List configured accounts
    #[tool(
        name = "list_accounts",
        description = "List configured email accounts and their protocol kinds"
    )]
    async fn list_accounts(&self) -> Result<Json<ToolEnvelope<Vec<AccountInfo>>>, ErrorData> {
        let started = Instant::now();
        let data = self
            .dispatcher
            .registry()
            .all()
            .map(|a| AccountInfo {
                name: a.name.clone(),
                kind: a.kind(),
            })
            .collect::<Vec<_>>();
        finalize_tool(
            started,
            Ok((format!("{} account(s) configured", data.len()), data)),
        )
    }

    /// Tool: Verify an account's connectivity
    #[tool(
        name = "test_connection",
        description = "Verify that an account's backend is reachable and credentials work"
    )]
    async fn test_connection(
        &self,
        Parameters(input): Parameters<AccountOnlyInput>,
    ) -> Result<Json<ToolEnvelope<serde_json::Value>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.test_connection_impl(input)
                .await
                .map(|data| ("Connection verified".to_owned(), data)),
        )
    }

    /// Tool: Per-account session pool statistics
    #[tool(
        name = "get_account_stats",
        description = "Report per-account protocol kind and pooled session state"
    )]
    async fn get_account_stats(&self) -> Result<Json<ToolEnvelope<Vec<AccountStats>>>, ErrorData> {
        let started = Instant::now();
        let mut data = Vec::new();
        for account in self.dispatcher.registry().all() {
            let idle = self.dispatcher.pooled_session_idle(&account.name).await;
            data.push(AccountStats {
                name: account.name.clone(),
                kind: account.kind(),
                session_cached: idle.is_some(),
                idle_ms: idle.map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64),
            });
        }
        finalize_tool(
            started,
            Ok((format!("{} account(s)", data.len()), data)),
        )
    }

    /// Tool: List recent emails
    #[tool(
        name = "list_emails",
        description = "List recent emails in a folder (default INBOX) of one account"
    )]
    async fn list_emails(
        &self,
        Parameters(input): Parameters<ListEmailsInput>,
    ) -> Result<Json<ToolEnvelope<Vec<EmailMessage>>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.list_emails_impl(input)
                .await
                .map(|data| (format!("{} message(s)", data.len()), data)),
        )
    }

    /// Tool: Search one account
    #[tool(
        name = "search_emails",
        description = "Search one account by free text with optional date bounds and folders"
    )]
    async fn search_emails(
        &self,
        Parameters(input): Parameters<SearchEmailsInput>,
    ) -> Result<Json<ToolEnvelope<Vec<EmailMessage>>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.search_emails_impl(input)
                .await
                .map(|data| (format!("{} message(s) matched", data.len()), data)),
        )
    }

    /// Tool: Fetch one message's details
    #[tool(
        name = "get_email_detail",
        description = "Fetch one message's full detail (bodies, recipients, attachments)"
    )]
    async fn get_email_detail(
        &self,
        Parameters(input): Parameters<GetEmailDetailInput>,
    ) -> Result<Json<ToolEnvelope<EmailDetail>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.get_email_detail_impl(input)
                .await
                .map(|data| ("Message retrieved".to_owned(), data)),
        )
    }

    /// Tool: Archive one or more messages
    #[tool(
        name = "archive_email",
        description = "Archive one message or a batch; optionally clear the unread marker"
    )]
    async fn archive_email(
        &self,
        Parameters(input): Parameters<ArchiveEmailInput>,
    ) -> Result<Json<ToolEnvelope<Vec<ArchiveOutcome>>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.archive_email_impl(input).await.map(|data| {
                let archived = data.iter().filter(|o| o.archived).count();
                (format!("{archived}/{} archived", data.len()), data)
            }),
        )
    }

    /// Tool: Send an email
    #[tool(
        name = "send_email",
        description = "Send an email from one account (Gmail API or SMTP, by account kind)"
    )]
    async fn send_email(
        &self,
        Parameters(input): Parameters<SendEmailInput>,
    ) -> Result<Json<ToolEnvelope<SendReceipt>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.send_email_impl(input)
                .await
                .map(|data| (format!("Sent as {}", data.message_id), data)),
        )
    }

    /// Tool: Search every configured account concurrently
    #[tool(
        name = "search_all_emails",
        description = "Search all accounts concurrently; returns merged results plus per-account errors"
    )]
    async fn search_all_emails(
        &self,
        Parameters(input): Parameters<SearchAllInput>,
    ) -> Result<Json<ToolEnvelope<FanOutResult>>, ErrorData> {
        let started = Instant::now();
        finalize_tool(
            started,
            self.search_all_impl(input).await.map(|data| {
                (
                    format!(
                        "{} message(s) from {} account(s), {} error(s)",
                        data.messages.len(),
                        self.dispatcher.registry().len(),
                        data.per_account_errors.len()
                    ),
                    data,
                )
            }),
        )
    }
}

/// MCP server handler implementation
#[tool_handler(router = self.tool_router)]
impl ServerHandler for MailGatewayServer {
    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.instructions = Some(
            "Multi-protocol mail gateway. Message ids are only valid together with their account_name; never reuse an id across accounts.".to_owned(),
        );
        info.capabilities = ServerCapabilities::builder().enable_tools().build();
        info
    }
}

/// Tool implementation methods
///
/// Private methods handle the actual business logic for each tool,
/// separated from the public `#[tool]` methods that handle response
/// formatting. All validation happens here, before any dispatch.
impl MailGatewayServer {
    async fn test_connection_impl(&self, input: AccountOnlyInput) -> AppResult<serde_json::Value> {
        validate_account_name(&input.account_name)?;
        let kind = self.dispatcher.registry().get(&input.account_name)?.kind();

        let started = Instant::now();
        let result = self
            .dispatcher
            .execute(&input.account_name, Operation::TestConnection)
            .await?;
        let OperationResult::Connection(backend) = result else {
            return Err(AppError::Internal("unexpected result variant".to_owned()));
        };

        Ok(serde_json::json!({
            "account_name": input.account_name,
            "kind": kind.label(),
            "ok": true,
            "latency_ms": duration_ms(started),
            "backend": backend,
        }))
    }

    async fn list_emails_impl(&self, input: ListEmailsInput) -> AppResult<Vec<EmailMessage>> {
        validate_account_name(&input.account_name)?;
        validate_range(input.limit, 1, MAX_LIMIT, "limit")?;
        if let Some(folder) = &input.folder {
            validate_text(folder, "folder")?;
        }

        let params = ListParams {
            folder: input.folder,
            limit: input.limit,
            unread_only: input.unread_only,
        };
        self.dispatcher
            .execute(&input.account_name, Operation::List(params))
            .await?
            .into_messages()
    }

    async fn search_emails_impl(&self, input: SearchEmailsInput) -> AppResult<Vec<EmailMessage>> {
        validate_account_name(&input.account_name)?;
        validate_range(input.limit, 1, MAX_LIMIT, "limit")?;
        let params = self.build_search_params(
            &input.query,
            input.since.as_deref(),
            input.before.as_deref(),
            input.folders,
            input.limit,
        )?;

        self.dispatcher
            .execute(&input.account_name, Operation::Search(params))
            .await?
            .into_messages()
    }

    async fn get_email_detail_impl(&self, input: GetEmailDetailInput) -> AppResult<EmailDetail> {
        validate_account_name(&input.account_name)?;
        validate_text(&input.email_id, "email_id")?;

        let result = self
            .dispatcher
            .execute(
                &input.account_name,
                Operation::Detail {
                    email_id: input.email_id,
                },
            )
            .await?;
        match result {
            OperationResult::Detail(detail) => Ok(*detail),
            _ => Err(AppError::Internal("unexpected result variant".to_owned())),
        }
    }

    async fn archive_email_impl(&self, input: ArchiveEmailInput) -> AppResult<Vec<ArchiveOutcome>> {
        validate_account_name(&input.account_name)?;
        let ids = input.email_id.into_vec();
        if ids.is_empty() {
            return Err(AppError::invalid("email_id must not be empty"));
        }
        validate_range(ids.len(), 1, MAX_ARCHIVE_BATCH, "email_id batch size")?;
        for id in &ids {
            validate_text(id, "email_id")?;
        }

        // Ids fail independently: one bad id must not abort the batch.
        let mut outcomes = Vec::with_capacity(ids.len());
        for email_id in ids {
            let result = self
                .dispatcher
                .execute(
                    &input.account_name,
                    Operation::Archive {
                        email_id: email_id.clone(),
                        remove_unread: input.remove_unread,
                    },
                )
                .await;
            outcomes.push(match result {
                Ok(OperationResult::Archived(archived)) => ArchiveOutcome {
                    email_id,
                    archived,
                    error: None,
                },
                Ok(_) => ArchiveOutcome {
                    email_id,
                    archived: false,
                    error: Some(crate::errors::ErrorKind::Internal),
                },
                Err(e) => ArchiveOutcome {
                    email_id,
                    archived: false,
                    error: Some(e.kind()),
                },
            });
        }
        Ok(outcomes)
    }

    async fn send_email_impl(&self, input: SendEmailInput) -> AppResult<SendReceipt> {
        validate_account_name(&input.account_name)?;
        validate_text(&input.subject, "subject")?;
        if input.text.is_none() && input.html.is_none() {
            return Err(AppError::invalid("provide at least one of text or html"));
        }

        let to = input.to.into_vec();
        if to.is_empty() {
            return Err(AppError::invalid("to must contain at least one recipient"));
        }
        let cc = input.cc.map(|v| v.into_vec()).unwrap_or_default();
        let bcc = input.bcc.map(|v| v.into_vec()).unwrap_or_default();
        for addr in to.iter().chain(&cc).chain(&bcc) {
            validate_text(addr, "recipient")?;
        }

        let params = SendParams {
            to,
            cc,
            bcc,
            subject: input.subject,
            text: input.text,
            html: input.html,
            in_reply_to: input.in_reply_to,
            references: input.references,
        };

        let result = self
            .dispatcher
            .execute(&input.account_name, Operation::Send(params))
            .await?;
        match result {
            OperationResult::Sent(receipt) => Ok(receipt),
            _ => Err(AppError::Internal("unexpected result variant".to_owned())),
        }
    }

    async fn search_all_impl(&self, input: SearchAllInput) -> AppResult<FanOutResult> {
        validate_range(input.limit, 1, MAX_FANOUT_LIMIT, "limit")?;
        let params = self.build_search_params(&input.query, None, None, None, input.limit)?;

        let registry = self.dispatcher.registry();
        let account_names: Vec<String> = match input.accounts {
            AccountFilter::All => registry.all().map(|a| a.name.clone()).collect(),
            AccountFilter::GmailOnly => registry
                .of_kind(AccountKind::Gmail)
                .iter()
                .map(|a| a.name.clone())
                .collect(),
            AccountFilter::ImapOnly => registry
                .of_kind(AccountKind::Imap)
                .iter()
                .map(|a| a.name.clone())
                .collect(),
        };

        let options = FanOutOptions {
            branch_timeout: self.config.fanout_branch_timeout(),
            deadline: self.config.fanout_deadline(),
            limit: input.limit,
            sort_by: input.sort_by,
            query: input.query.clone(),
        };

        let dispatcher = Arc::clone(&self.dispatcher);
        let result = fanout::search_all(account_names, options, move |name| {
            let dispatcher = Arc::clone(&dispatcher);
            let params = params.clone();
            async move {
                dispatcher
                    .execute(&name, Operation::Search(params))
                    .await?
                    .into_messages()
            }
        })
        .await;
        Ok(result)
    }

    /// Validate and normalize search inputs shared by both search tools
    fn build_search_params(
        &self,
        query: &str,
        since: Option<&str>,
        before: Option<&str>,
        folders: Option<Vec<String>>,
        limit: usize,
    ) -> AppResult<SearchParams> {
        validate_text(query, "query")?;
        if let Some(folders) = &folders {
            for folder in folders {
                validate_text(folder, "folder")?;
            }
        }

        let since = since
            .map(|raw| parse_date_bound(raw, &self.timezones))
            .transpose()?;
        let before = before
            .map(|raw| parse_date_bound(raw, &self.timezones))
            .transpose()?;
        if let (Some(since), Some(before)) = (since, before)
            && since >= before
        {
            return Err(AppError::invalid("since must be earlier than before"));
        }

        Ok(SearchParams {
            text: query.trim().to_owned(),
            since,
            before,
            folders,
            limit,
        })
    }
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64
}

/// Build a standardized MCP tool response envelope from business logic output
fn finalize_tool<T>(
    started: Instant,
    result: AppResult<(String, T)>,
) -> Result<Json<ToolEnvelope<T>>, ErrorData>
where
    T: schemars::JsonSchema,
{
    match result {
        Ok((summary, data)) => Ok(Json(ToolEnvelope {
            summary,
            data,
            meta: Meta::now(duration_ms(started)),
        })),
        Err(e) => Err(e.to_error_data()),
    }
}

/// Validate account name format
fn validate_account_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(AppError::invalid("account_name must be 1..64 characters"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::invalid(
            "account_name must match [A-Za-z0-9_-]+",
        ));
    }
    Ok(())
}

/// Validate a short text field: non-empty, bounded, no control characters
fn validate_text(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() || value.len() > 256 {
        return Err(AppError::invalid(format!(
            "{field} must be 1..256 characters"
        )));
    }
    if value.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::invalid(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

/// Validate numeric value in range
fn validate_range(value: usize, min: usize, max: usize, field: &str) -> AppResult<()> {
    if value < min || value > max {
        return Err(AppError::invalid(format!(
            "{field} must be in range {min}..{max}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_account_name, validate_range, validate_text};

    #[test]
    fn rejects_control_chars_in_text_fields() {
        let err = validate_text("hello\nworld", "query").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
    }

    #[test]
    fn rejects_oversized_and_empty_text() {
        assert!(validate_text("  ", "query").is_err());
        assert!(validate_text(&"x".repeat(300), "query").is_err());
        assert!(validate_text("invoice 42", "query").is_ok());
    }

    #[test]
    fn account_name_character_set_is_enforced() {
        assert!(validate_account_name("work-2").is_ok());
        assert!(validate_account_name("bad name").is_err());
        assert!(validate_account_name("").is_err());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(validate_range(1, 1, 100, "limit").is_ok());
        assert!(validate_range(100, 1, 100, "limit").is_ok());
        assert!(validate_range(0, 1, 100, "limit").is_err());
        assert!(validate_range(101, 1, 100, "limit").is_err());
    }
}
