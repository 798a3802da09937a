//! Per-account session pool
//!
//! Hides connect/reconnect/timeout mechanics behind `acquire`. Each account
//! owns at most one slot; a slot is either a pending connect attempt or a
//! live session. The pending attempt's shared handle is published into the
//! map *before* anyone awaits it, so N concurrent acquirers for a cold
//! account observe and await the same attempt instead of racing to open
//! duplicate sessions. No lock is held across a suspension point.
//!
//! Any connect failure (error, timeout) evicts the slot, so the next
//! `acquire` starts a fresh attempt — failed entries never linger.
//!
//! The pool is generic over a [`Connect`] implementation. In production it
//! caches Gmail API sessions, which are stateless request wrappers safe to
//! reuse indefinitely; IMAP sessions are deliberately not pooled (one
//! session per operation, opened and closed by the dispatcher).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::errors::{AppError, AppResult};
use crate::registry::Account;

/// Session factory for one protocol kind
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Live session type produced by this connector
    type Session: Send + Sync + 'static;

    /// Open and authenticate a new session
    ///
    /// The pool wraps this call in the connect timeout; implementations do
    /// not need their own overall deadline.
    async fn connect(&self, account: &Account) -> AppResult<Self::Session>;
}

/// A connect attempt shared by all concurrent acquirers
type SharedAttempt<S> = Shared<BoxFuture<'static, Result<Arc<S>, AppError>>>;

/// Per-account slot state
enum Slot<S> {
    /// Connect in flight; later acquirers await the same handle
    Connecting(SharedAttempt<S>),
    /// Live session available for reuse
    Ready {
        session: Arc<S>,
        last_used_at: Instant,
    },
}

/// Session pool keyed by account name
pub struct SessionPool<C: Connect> {
    connector: Arc<C>,
    connect_timeout: Duration,
    slots: Mutex<HashMap<String, Slot<C::Session>>>,
}

impl<C: Connect> SessionPool<C> {
    /// Create an empty pool
    pub fn new(connector: C, connect_timeout: Duration) -> Self {
        Self {
            connector: Arc::new(connector),
            connect_timeout,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a session for the account, connecting if necessary
    ///
    /// Reuses a cached session when present. Otherwise joins the in-flight
    /// connect attempt, or starts one and publishes its handle before
    /// awaiting.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the connect attempt exceeds the connect timeout
    /// - whatever classified error the connector produced
    pub async fn acquire(&self, account: &Account) -> AppResult<Arc<C::Session>> {
        let attempt = {
            let mut slots = self.slots.lock().await;
            match slots.get_mut(&account.name) {
                Some(Slot::Ready {
                    session,
                    last_used_at,
                }) => {
                    *last_used_at = Instant::now();
                    return Ok(Arc::clone(session));
                }
                Some(Slot::Connecting(shared)) => shared.clone(),
                None => {
                    let fut = connect_attempt(
                        Arc::clone(&self.connector),
                        account.clone(),
                        self.connect_timeout,
                    )
                    .boxed()
                    .shared();
                    slots.insert(account.name.clone(), Slot::Connecting(fut.clone()));
                    fut
                }
            }
        };

        let outcome = attempt.clone().await;

        // Transition the slot, but only if it still belongs to our attempt;
        // a later acquire may already have replaced an evicted slot.
        let mut slots = self.slots.lock().await;
        let ours = matches!(
            slots.get(&account.name),
            Some(Slot::Connecting(current)) if current.ptr_eq(&attempt)
        );
        match outcome {
            Ok(session) => {
                if ours {
                    slots.insert(
                        account.name.clone(),
                        Slot::Ready {
                            session: Arc::clone(&session),
                            last_used_at: Instant::now(),
                        },
                    );
                }
                Ok(session)
            }
            Err(err) => {
                if ours {
                    slots.remove(&account.name);
                }
                Err(err)
            }
        }
    }

    /// Evict a cached session after an operation-level failure
    ///
    /// The next `acquire` will open a fresh session. In-flight connect
    /// attempts are left alone; they evict themselves on failure.
    pub async fn invalidate(&self, account_name: &str) {
        let mut slots = self.slots.lock().await;
        if matches!(slots.get(account_name), Some(Slot::Ready { .. })) {
            slots.remove(account_name);
        }
    }

    /// Idle time of the cached session, if one exists
    pub async fn cached_idle(&self, account_name: &str) -> Option<Duration> {
        let slots = self.slots.lock().await;
        match slots.get(account_name) {
            Some(Slot::Ready { last_used_at, .. }) => Some(last_used_at.elapsed()),
            _ => None,
        }
    }

    /// Drop all cached sessions and pending attempts
    pub async fn close_all(&self) {
        self.slots.lock().await.clear();
    }
}

/// One timeout-bounded connect attempt
///
/// Runs outside the pool lock. The result is cloned to every awaiter of
/// the shared handle.
async fn connect_attempt<C: Connect>(
    connector: Arc<C>,
    account: Account,
    connect_timeout: Duration,
) -> Result<Arc<C::Session>, AppError> {
    match timeout(connect_timeout, connector.connect(&account)).await {
        Ok(Ok(session)) => Ok(Arc::new(session)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AppError::Timeout(format!(
            "connect timed out after {}ms for account '{}'",
            connect_timeout.as_millis(),
            account.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{Connect, SessionPool};
    use crate::errors::{AppError, AppResult, ErrorKind};
    use crate::registry::{Account, BackendConfig, GmailConfig};
    use secrecy::SecretString;

    fn account(name: &str) -> Account {
        Account {
            name: name.to_owned(),
            backend: BackendConfig::Gmail(GmailConfig {
                user: format!("{name}@gmail.com"),
                client_id: "id".to_owned(),
                client_secret: SecretString::new("secret".to_owned().into()),
                refresh_token: SecretString::new("token".to_owned().into()),
            }),
        }
    }

    /// Session that records which connect attempt produced it
    #[derive(Debug)]
    struct StubSession {
        attempt: usize,
    }

    /// Connector with a controllable delay and failure budget
    struct StubConnector {
        connects: AtomicUsize,
        delay: Duration,
        fail_first: usize,
    }

    impl StubConnector {
        fn new(delay: Duration, fail_first: usize) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                delay,
                fail_first,
            }
        }
    }

    #[async_trait]
    impl Connect for StubConnector {
        type Session = StubSession;

        async fn connect(&self, _account: &Account) -> AppResult<StubSession> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if attempt <= self.fail_first {
                return Err(AppError::Connection("stub refused".to_owned()));
            }
            Ok(StubSession { attempt })
        }
    }

    #[tokio::test]
    async fn sequential_acquires_reuse_one_session() {
        let pool = SessionPool::new(
            StubConnector::new(Duration::ZERO, 0),
            Duration::from_secs(5),
        );
        let acct = account("personal");

        let first = pool.acquire(&acct).await.expect("first acquire");
        let second = pool.acquire(&acct).await.expect("second acquire");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 1);
        assert!(pool.cached_idle("personal").await.is_some());
    }

    #[tokio::test]
    async fn concurrent_acquires_share_one_connect_attempt() {
        let pool = Arc::new(SessionPool::new(
            StubConnector::new(Duration::from_millis(20), 0),
            Duration::from_secs(5),
        ));
        let acct = account("cold");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let acct = acct.clone();
            handles.push(tokio::spawn(async move { pool.acquire(&acct).await }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.expect("join").expect("acquire"));
        }

        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_times_out_and_evicts_the_slot() {
        // Connect takes 10 minutes; the budget is 50ms.
        let pool = SessionPool::new(
            StubConnector::new(Duration::from_secs(600), 0),
            Duration::from_millis(50),
        );
        let acct = account("slow");

        let err = pool.acquire(&acct).await.expect_err("must time out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(pool.cached_idle("slow").await.is_none());

        // The next acquire starts a fresh attempt rather than re-awaiting
        // the hung one.
        let _ = pool.acquire(&acct).await.expect_err("second timeout");
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_connect_is_retried_fresh_on_next_acquire() {
        let pool = SessionPool::new(
            StubConnector::new(Duration::ZERO, 1),
            Duration::from_secs(5),
        );
        let acct = account("flaky");

        let err = pool.acquire(&acct).await.expect_err("first fails");
        assert_eq!(err.kind(), ErrorKind::Connection);

        let session = pool.acquire(&acct).await.expect("second succeeds");
        assert_eq!(session.attempt, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_session() {
        let pool = SessionPool::new(
            StubConnector::new(Duration::ZERO, 0),
            Duration::from_secs(5),
        );
        let acct = account("revoked");

        let first = pool.acquire(&acct).await.expect("first");
        pool.invalidate("revoked").await;
        let second = pool.acquire(&acct).await.expect("second");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connector.connects.load(Ordering::SeqCst), 2);
    }
}
