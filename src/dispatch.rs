//! Operation dispatch across protocol backends
//!
//! Resolves an incoming generic operation to an account, routes it to the
//! matching protocol handler by the account's configured kind, and owns the
//! session lifecycle around the call: pooled acquire for Gmail, one-shot
//! connect/close for IMAP. Session release is unconditional — the cleanup
//! path runs on handler failure and on operation timeout alike.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::warn;

use crate::config::GatewayConfig;
use crate::errors::{AppError, AppResult, ErrorKind};
use crate::gmail::{GmailConnector, GmailSession};
use crate::models::{
    EmailDetail, EmailMessage, ListParams, SearchParams, SendParams, SendReceipt,
};
use crate::pool::SessionPool;
use crate::registry::{Account, AccountRegistry, BackendConfig, ImapConfig};
use crate::vault::CredentialVault;
use crate::{imap, smtp};

/// One generic gateway operation
///
/// Created per inbound tool call; lives for the duration of one dispatch.
#[derive(Debug, Clone)]
pub enum Operation {
    List(ListParams),
    Search(SearchParams),
    Detail { email_id: String },
    Archive { email_id: String, remove_unread: bool },
    Send(SendParams),
    TestConnection,
}

/// Normalized operation result, identical shape regardless of backend
#[derive(Debug)]
pub enum OperationResult {
    Messages(Vec<EmailMessage>),
    Detail(Box<EmailDetail>),
    Archived(bool),
    Sent(SendReceipt),
    Connection(serde_json::Value),
}

impl OperationResult {
    /// Unwrap a message list, or fail `Internal`
    ///
    /// Used by callers that issued a list/search operation; any other
    /// variant indicates a routing bug.
    pub fn into_messages(self) -> AppResult<Vec<EmailMessage>> {
        match self {
            Self::Messages(messages) => Ok(messages),
            other => Err(AppError::Internal(format!(
                "expected message list result, got {other:?}"
            ))),
        }
    }
}

/// Routes operations to protocol handlers and manages session lifecycles
pub struct Dispatcher {
    config: Arc<GatewayConfig>,
    registry: Arc<AccountRegistry>,
    vault: Arc<CredentialVault>,
    gmail_pool: SessionPool<GmailConnector>,
}

impl Dispatcher {
    /// Create the dispatcher with an empty Gmail session pool
    pub fn new(
        config: Arc<GatewayConfig>,
        registry: Arc<AccountRegistry>,
        vault: Arc<CredentialVault>,
    ) -> Self {
        let connector = GmailConnector::new(Arc::clone(&config), Arc::clone(&vault));
        let gmail_pool = SessionPool::new(connector, config.connect_timeout());
        Self {
            config,
            registry,
            vault,
            gmail_pool,
        }
    }

    /// Accounts visible to callers
    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    /// Whether a pooled session exists for the account, and its idle time
    pub async fn pooled_session_idle(&self, account_name: &str) -> Option<std::time::Duration> {
        self.gmail_pool.cached_idle(account_name).await
    }

    /// Drop every pooled session (process shutdown)
    pub async fn close_all(&self) {
        self.gmail_pool.close_all().await;
    }

    /// Execute one operation against one account
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown account name
    /// - `Timeout` when the operation budget elapses
    /// - classified handler errors otherwise
    pub async fn execute(&self, account_name: &str, op: Operation) -> AppResult<OperationResult> {
        let account = self.registry.get(account_name)?.clone();
        match &account.backend {
            BackendConfig::Gmail(_) => self.execute_gmail(&account, op).await,
            BackendConfig::Imap(imap_cfg) => {
                let imap_cfg = imap_cfg.clone();
                self.execute_imap(&account, &imap_cfg, op).await
            }
        }
    }

    /// Gmail route: pooled session, reused across operations
    async fn execute_gmail(&self, account: &Account, op: Operation) -> AppResult<OperationResult> {
        let session = self.gmail_pool.acquire(account).await?;

        let result = timeout(
            self.config.operation_timeout(),
            run_gmail_op(&session, op),
        )
        .await
        .map_err(|_| {
            AppError::Timeout(format!(
                "operation timed out after {}ms on account '{}'",
                self.config.operation_timeout_ms, account.name
            ))
        })
        .and_then(|r| r);

        // A session that produced a transport or auth failure is not worth
        // keeping; the next acquire opens a fresh one.
        if let Err(e) = &result
            && matches!(
                e.kind(),
                ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Auth
            )
        {
            warn!(account = %account.name, error = %e, "evicting pooled session");
            self.gmail_pool.invalidate(&account.name).await;
        }

        result
    }

    /// IMAP route: one session per operation, closed unconditionally
    async fn execute_imap(
        &self,
        account: &Account,
        imap_cfg: &ImapConfig,
        op: Operation,
    ) -> AppResult<OperationResult> {
        // Sending never touches IMAP; it goes straight to the SMTP relay,
        // under the same operation budget.
        if let Operation::Send(params) = &op {
            return timeout(
                self.config.operation_timeout(),
                smtp::send(&self.config, &account.name, imap_cfg, &self.vault, params),
            )
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "operation timed out after {}ms on account '{}'",
                    self.config.operation_timeout_ms, account.name
                ))
            })
            .and_then(|r| r)
            .map(OperationResult::Sent);
        }

        let mut session =
            imap::connect_authenticated(&self.config, &account.name, imap_cfg, &self.vault).await?;

        let result = timeout(
            self.config.operation_timeout(),
            run_imap_op(&self.config, &mut session, &account.name, op),
        )
        .await
        .map_err(|_| {
            AppError::Timeout(format!(
                "operation timed out after {}ms on account '{}'",
                self.config.operation_timeout_ms, account.name
            ))
        })
        .and_then(|r| r);

        // Guaranteed cleanup: the session is closed on success, handler
        // failure, and operation timeout alike.
        imap::close(&self.config, session).await;

        result
    }
}

/// Run one operation against a Gmail session
async fn run_gmail_op(session: &GmailSession, op: Operation) -> AppResult<OperationResult> {
    match op {
        Operation::List(params) => session
            .list_emails(&params)
            .await
            .map(OperationResult::Messages),
        Operation::Search(params) => session
            .search_emails(&params)
            .await
            .map(OperationResult::Messages),
        Operation::Detail { email_id } => session
            .get_detail(&email_id)
            .await
            .map(|d| OperationResult::Detail(Box::new(d))),
        Operation::Archive {
            email_id,
            remove_unread,
        } => session
            .archive(&email_id, remove_unread)
            .await
            .map(OperationResult::Archived),
        Operation::Send(params) => session.send(&params).await.map(OperationResult::Sent),
        Operation::TestConnection => session.profile().await.map(OperationResult::Connection),
    }
}

/// Run one operation against an IMAP session
async fn run_imap_op(
    config: &GatewayConfig,
    session: &mut imap::ImapSession,
    account_name: &str,
    op: Operation,
) -> AppResult<OperationResult> {
    match op {
        Operation::List(params) => imap::list_emails(config, session, account_name, &params)
            .await
            .map(OperationResult::Messages),
        Operation::Search(params) => imap::search_emails(config, session, account_name, &params)
            .await
            .map(OperationResult::Messages),
        Operation::Detail { email_id } => imap::get_detail(config, session, account_name, &email_id)
            .await
            .map(|d| OperationResult::Detail(Box::new(d))),
        Operation::Archive {
            email_id,
            remove_unread,
        } => imap::archive(config, session, &email_id, remove_unread)
            .await
            .map(OperationResult::Archived),
        Operation::Send(_) => Err(AppError::Internal(
            "imap send must be routed to smtp".to_owned(),
        )),
        Operation::TestConnection => {
            imap::noop(config, session).await?;
            Ok(OperationResult::Connection(serde_json::json!({ "ok": true })))
        }
    }
}
