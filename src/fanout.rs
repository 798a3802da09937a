//! Fan-out search across accounts
//!
//! Runs one dispatcher branch per account concurrently and merges whatever
//! settles in time. Two timeout layers apply: each branch races a fixed
//! per-account budget (so one slow account cannot stall the rest), and the
//! whole aggregation races an overall deadline. Branch failures become
//! per-account error entries — this is the only place in the gateway where
//! a failure turns into data instead of propagating.
//!
//! The aggregator is generic over the branch-future factory; production
//! passes a closure invoking the dispatcher, tests pass stubs.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::debug;

use crate::errors::{AppError, AppResult, ErrorKind};
use crate::models::{EmailMessage, FanOutResult, SortBy};

/// Aggregation knobs
///
/// `branch_timeout` must be shorter than `deadline`; configuration load
/// enforces this.
#[derive(Debug, Clone)]
pub struct FanOutOptions {
    /// Per-account branch budget
    pub branch_timeout: Duration,
    /// Overall aggregation deadline
    pub deadline: Duration,
    /// Maximum merged messages returned
    pub limit: usize,
    /// Result ordering
    pub sort_by: SortBy,
    /// Query text, used by relevance ordering
    pub query: String,
}

/// Search the given accounts concurrently and merge the results
///
/// Never fails wholesale: every branch failure — including branches still
/// unsettled when the deadline fires — contributes one `per_account_errors`
/// entry keyed by account name, classified without string matching.
pub async fn search_all<F, Fut>(
    account_names: Vec<String>,
    options: FanOutOptions,
    run_branch: F,
) -> FanOutResult
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = AppResult<Vec<EmailMessage>>>,
{
    let overall_deadline = Instant::now() + options.deadline;
    let mut unsettled: BTreeSet<String> = account_names.iter().cloned().collect();
    let mut messages: Vec<EmailMessage> = Vec::new();
    let mut per_account_errors: BTreeMap<String, ErrorKind> = BTreeMap::new();

    let mut branches: FuturesUnordered<_> = account_names
        .iter()
        .map(|name| {
            let branch = run_branch(name.clone());
            let branch_timeout = options.branch_timeout;
            let name = name.clone();
            async move {
                let outcome = match timeout(branch_timeout, branch).await {
                    Ok(result) => result,
                    Err(_) => Err(AppError::Timeout(format!(
                        "fan-out branch timed out after {}ms",
                        branch_timeout.as_millis()
                    ))),
                };
                (name, outcome)
            }
        })
        .collect();

    while !branches.is_empty() {
        match timeout_at(overall_deadline, branches.next()).await {
            Ok(Some((name, Ok(found)))) => {
                unsettled.remove(&name);
                messages.extend(found);
            }
            Ok(Some((name, Err(e)))) => {
                debug!(account = %name, error = %e, "fan-out branch failed");
                unsettled.remove(&name);
                per_account_errors.insert(name, e.kind());
            }
            Ok(None) => break,
            Err(_) => {
                // Overall deadline fired: report whatever settled, mark the
                // stragglers, and stop polling their branches.
                for name in unsettled {
                    per_account_errors.entry(name).or_insert(ErrorKind::Timeout);
                }
                break;
            }
        }
    }

    let total_found = messages.len();
    sort_messages(&mut messages, options.sort_by, &options.query);
    messages.truncate(options.limit);

    FanOutResult {
        messages,
        total_found,
        per_account_errors,
    }
}

/// Order merged messages
///
/// Date: newest first, undated last. Relevance: messages whose subject
/// contains the query text rank first, then newest first.
fn sort_messages(messages: &mut [EmailMessage], sort_by: SortBy, query: &str) {
    let needle = query.to_lowercase();
    match sort_by {
        SortBy::Date => {
            messages.sort_by(|a, b| message_date(b).cmp(&message_date(a)));
        }
        SortBy::Relevance => {
            messages.sort_by(|a, b| {
                let a_hit = !needle.is_empty() && a.subject.to_lowercase().contains(&needle);
                let b_hit = !needle.is_empty() && b.subject.to_lowercase().contains(&needle);
                b_hit
                    .cmp(&a_hit)
                    .then_with(|| message_date(b).cmp(&message_date(a)))
            });
        }
    }
}

/// Parse a message's RFC 3339 date for ordering
fn message_date(message: &EmailMessage) -> Option<DateTime<Utc>> {
    message
        .date
        .as_deref()
        .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{FanOutOptions, search_all};
    use crate::errors::{AppError, AppResult, ErrorKind};
    use crate::models::{EmailMessage, SortBy};
    use crate::registry::AccountKind;

    fn message(account: &str, id: &str, subject: &str, date: &str) -> EmailMessage {
        EmailMessage {
            id: id.to_owned(),
            account_name: account.to_owned(),
            account_kind: AccountKind::Gmail,
            subject: subject.to_owned(),
            from: "sender@example.com".to_owned(),
            to: vec!["user@example.com".to_owned()],
            date: Some(date.to_owned()),
            snippet: subject.to_owned(),
            is_unread: false,
            has_attachments: false,
        }
    }

    fn options(branch_ms: u64, deadline_ms: u64) -> FanOutOptions {
        FanOutOptions {
            branch_timeout: Duration::from_millis(branch_ms),
            deadline: Duration::from_millis(deadline_ms),
            limit: 10,
            sort_by: SortBy::Date,
            query: "x".to_owned(),
        }
    }

    async fn branch_for(name: String) -> AppResult<Vec<EmailMessage>> {
        match name.as_str() {
            // Account A answers immediately with two dated messages.
            "a" => Ok(vec![
                message("a", "1", "yesterday mail", "2026-08-05T09:00:00+00:00"),
                message("a", "2", "today mail", "2026-08-06T09:00:00+00:00"),
            ]),
            // Account B hangs past any branch budget used in these tests.
            "b" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(vec![])
            }
            _ => Err(AppError::Auth("bad credentials".to_owned())),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_failure_returns_data_plus_error_map() {
        let result = search_all(
            vec!["a".to_owned(), "b".to_owned()],
            options(100, 5_000),
            branch_for,
        )
        .await;

        assert_eq!(result.total_found, 2);
        // Newest first.
        assert_eq!(result.messages[0].id, "2");
        assert_eq!(result.messages[1].id, "1");
        assert_eq!(result.per_account_errors.len(), 1);
        assert_eq!(result.per_account_errors["b"], ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn branch_errors_are_classified_not_thrown() {
        let result = search_all(
            vec!["a".to_owned(), "broken".to_owned()],
            options(100, 5_000),
            branch_for,
        )
        .await;

        assert_eq!(result.messages.len(), 2);
        assert_eq!(result.per_account_errors["broken"], ErrorKind::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_marks_stragglers_and_keeps_settled_results() {
        // Branch budget larger than the deadline: only the deadline can
        // reap the slow account.
        let result = search_all(
            vec!["a".to_owned(), "b".to_owned()],
            options(10_000, 50),
            branch_for,
        )
        .await;

        assert_eq!(result.total_found, 2);
        assert_eq!(result.per_account_errors["b"], ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn all_branches_failing_still_returns_a_result() {
        let result = search_all(
            vec!["broken1".to_owned(), "broken2".to_owned()],
            options(100, 5_000),
            branch_for,
        )
        .await;

        assert!(result.messages.is_empty());
        assert_eq!(result.total_found, 0);
        assert_eq!(result.per_account_errors.len(), 2);
    }

    #[tokio::test]
    async fn relevance_ranks_subject_hits_above_newer_mail() {
        let mut opts = options(100, 5_000);
        opts.sort_by = SortBy::Relevance;
        opts.query = "invoice".to_owned();

        let result = search_all(
            vec!["stub".to_owned()],
            opts,
            |_name| async {
                Ok(vec![
                    message("stub", "1", "Lunch plans", "2026-08-06T12:00:00+00:00"),
                    message("stub", "2", "Invoice #42", "2026-08-01T12:00:00+00:00"),
                ])
            },
        )
        .await;

        assert_eq!(result.messages[0].id, "2", "subject hit ranks first");
        assert_eq!(result.messages[1].id, "1");
    }

    #[tokio::test]
    async fn identical_ids_on_two_accounts_stay_distinguishable() {
        let result = search_all(
            vec!["left".to_owned(), "right".to_owned()],
            options(100, 5_000),
            |name| async move {
                Ok(vec![message(
                    &name,
                    "5",
                    "same id",
                    "2026-08-06T10:00:00+00:00",
                )])
            },
        )
        .await;

        assert_eq!(result.messages.len(), 2);
        let pairs: Vec<(String, String)> = result
            .messages
            .iter()
            .map(|m| (m.account_name.clone(), m.id.clone()))
            .collect();
        assert!(pairs.contains(&("left".to_owned(), "5".to_owned())));
        assert!(pairs.contains(&("right".to_owned(), "5".to_owned())));
        // The bare id alone is ambiguous by design.
        assert_eq!(result.messages[0].id, result.messages[1].id);
    }

    #[tokio::test]
    async fn truncates_to_limit_but_reports_total_found() {
        let mut opts = options(100, 5_000);
        opts.limit = 1;

        let result = search_all(vec!["a".to_owned()], opts, branch_for).await;
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.total_found, 2);
    }
}
