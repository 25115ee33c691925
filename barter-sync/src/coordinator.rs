//! Request coordination partitioned by logical data class.
//!
//! Every load goes through [`RequestCoordinator::issue`], which opens a scope for the load's
//! [`ClassTag`]. Opening a scope for a non-isolated class cancels the class's outstanding scope
//! before the new operation is polled, and bumps the class generation. Settlements are checked
//! against the generation so a superseded load can never deliver anything but
//! [`Outcome::Cancelled`], even if its underlying work finishes after the newer load started.

use crate::{error::SyncError, outcome::Outcome};
use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time a load may take before it resolves [`Outcome::Timeout`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Logical partition of requests sharing one cancellation & ordering scope.
///
/// Isolated tags (eg/ background prefetch) get a fresh scope per request and never cancel, nor
/// are cancelled by, other requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, Deserialize, Serialize)]
#[display("{name}")]
pub struct ClassTag {
    name: SmolStr,
    isolated: bool,
}

impl ClassTag {
    pub fn new(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            isolated: false,
        }
    }

    pub fn isolated(name: impl Into<SmolStr>) -> Self {
        Self {
            name: name.into(),
            isolated: true,
        }
    }

    /// Class of the main history load feeding the chart.
    pub fn primary() -> Self {
        Self::new("primary")
    }

    /// Class of auxiliary analytics loads.
    pub fn secondary() -> Self {
        Self::new("secondary")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }
}

/// Timeout configuration for a [`RequestCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub default_timeout: Duration,
    pub timeouts: HashMap<ClassTag, Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            timeouts: HashMap::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Override the timeout for one class.
    pub fn with_timeout(mut self, class: ClassTag, timeout: Duration) -> Self {
        self.timeouts.insert(class, timeout);
        self
    }

    pub fn timeout_for(&self, class: &ClassTag) -> Duration {
        self.timeouts
            .get(class)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

/// Caller-side handle on an opened scope.
#[derive(Debug, Clone)]
pub struct ScopeTicket {
    class: ClassTag,
    generation: u64,
    token: CancellationToken,
}

impl ScopeTicket {
    pub fn class(&self) -> &ClassTag {
        &self.class
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Cancellation signal of the scope, for operations that want to abandon work cooperatively.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct RequestScope {
    generation: u64,
    token: CancellationToken,
    timeout: Duration,
    created_at: Instant,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    generations: HashMap<ClassTag, u64>,
    active: HashMap<ClassTag, RequestScope>,
    isolated: HashMap<(ClassTag, u64), RequestScope>,
}

impl CoordinatorState {
    fn is_current(&self, ticket: &ScopeTicket) -> bool {
        if ticket.token.is_cancelled() {
            return false;
        }
        if ticket.class.is_isolated() {
            return true;
        }
        self.generations.get(&ticket.class) == Some(&ticket.generation)
    }

    fn release(&mut self, ticket: &ScopeTicket) {
        if ticket.class.is_isolated() {
            self.isolated
                .remove(&(ticket.class.clone(), ticket.generation));
        } else if self
            .active
            .get(&ticket.class)
            .is_some_and(|scope| scope.generation == ticket.generation)
        {
            self.active.remove(&ticket.class);
        }
    }
}

/// Removes a scope from the coordinator if the issuing future is dropped before it settles.
struct ScopeRelease<'a> {
    state: &'a Mutex<CoordinatorState>,
    ticket: &'a ScopeTicket,
}

impl Drop for ScopeRelease<'_> {
    fn drop(&mut self) {
        self.state.lock().release(self.ticket);
    }
}

/// Coordinates overlapping asynchronous loads. Cheap to clone, clones share state.
#[derive(Debug, Clone, Default)]
pub struct RequestCoordinator {
    config: Arc<CoordinatorConfig>,
    state: Arc<Mutex<CoordinatorState>>,
}

impl RequestCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    /// Run `operation` inside a fresh scope for `class`, cancelling the class's previous scope
    /// first if the class is not isolated.
    pub async fn issue<T, Fut>(&self, class: &ClassTag, operation: Fut) -> Outcome<T>
    where
        Fut: Future<Output = Result<T, SyncError>>,
    {
        self.issue_scoped(class, operation).await.1
    }

    /// As [`Self::issue`], also returning the [`ScopeTicket`] so the caller can
    /// [`commit`](Self::commit) side effects against it.
    pub async fn issue_scoped<T, Fut>(
        &self,
        class: &ClassTag,
        operation: Fut,
    ) -> (ScopeTicket, Outcome<T>)
    where
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let ticket = self.open(class);
        let release = ScopeRelease {
            state: &self.state,
            ticket: &ticket,
        };
        let timeout = self.config.timeout_for(class);

        let raced = tokio::select! {
            biased;
            _ = ticket.token.cancelled() => Outcome::Cancelled,
            result = tokio::time::timeout(timeout, operation) => match result {
                Ok(result) => Outcome::from(result),
                Err(_) => Outcome::Timeout,
            },
        };

        let outcome = self.settle(&ticket, raced);
        drop(release);
        (ticket, outcome)
    }

    fn open(&self, class: &ClassTag) -> ScopeTicket {
        let timeout = self.config.timeout_for(class);
        let mut state = self.state.lock();

        let generation = {
            let counter = state.generations.entry(class.clone()).or_insert(0);
            *counter += 1;
            *counter
        };

        let scope = RequestScope {
            generation,
            token: CancellationToken::new(),
            timeout,
            created_at: Instant::now(),
        };
        let ticket = ScopeTicket {
            class: class.clone(),
            generation,
            token: scope.token.clone(),
        };

        if class.is_isolated() {
            state.isolated.insert((class.clone(), generation), scope);
        } else if let Some(prior) = state.active.insert(class.clone(), scope) {
            // Cancel before the new operation is ever polled
            prior.token.cancel();
            debug!(
                class = %class,
                superseded = prior.generation,
                generation,
                age_ms = prior.created_at.elapsed().as_millis() as u64,
                "superseding outstanding request"
            );
        }

        debug!(class = %class, generation, timeout_ms = timeout.as_millis() as u64, "request issued");
        ticket
    }

    fn settle<T>(&self, ticket: &ScopeTicket, raced: Outcome<T>) -> Outcome<T> {
        let (current, scope_timeout) = {
            let mut state = self.state.lock();
            let current = state.is_current(ticket);
            let scope_timeout = state
                .active
                .get(&ticket.class)
                .filter(|scope| scope.generation == ticket.generation)
                .or_else(|| {
                    state
                        .isolated
                        .get(&(ticket.class.clone(), ticket.generation))
                })
                .map(|scope| scope.timeout);
            state.release(ticket);
            (current, scope_timeout)
        };

        match raced {
            Outcome::Timeout if current => {
                // Timeout is a derived cancellation of the scope
                ticket.token.cancel();
                warn!(
                    class = %ticket.class,
                    generation = ticket.generation,
                    timeout_ms = scope_timeout.map(|t| t.as_millis() as u64),
                    "request timed out"
                );
                Outcome::Timeout
            }
            outcome if !current => {
                debug!(
                    class = %ticket.class,
                    generation = ticket.generation,
                    raced = outcome.label(),
                    "discarding stale settlement"
                );
                Outcome::Cancelled
            }
            outcome => outcome,
        }
    }

    /// Run `apply` only if `ticket` is still the latest, non-cancelled scope of its class.
    ///
    /// Runs while holding the coordinator lock so no newer request can be issued between the
    /// check and the mutation. `apply` must not call back into the coordinator.
    pub fn commit<R, F>(&self, ticket: &ScopeTicket, apply: F) -> Option<R>
    where
        F: FnOnce() -> R,
    {
        let state = self.state.lock();
        if !state.is_current(ticket) {
            debug!(
                class = %ticket.class,
                generation = ticket.generation,
                "refusing to commit stale result"
            );
            return None;
        }
        Some(apply())
    }

    /// Cancel the outstanding scope(s) of one class, returning how many were cancelled.
    pub fn cancel(&self, class: &ClassTag) -> usize {
        let mut state = self.state.lock();
        let mut cancelled = 0;

        if let Some(scope) = state.active.remove(class) {
            scope.token.cancel();
            cancelled += 1;
        }
        state.isolated.retain(|(tag, _), scope| {
            if tag == class {
                scope.token.cancel();
                cancelled += 1;
                false
            } else {
                true
            }
        });

        if cancelled > 0 {
            debug!(class = %class, cancelled, "cancelled outstanding requests");
        }
        cancelled
    }

    /// Cancel every outstanding scope, eg/ on unmount.
    pub fn cancel_all(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let scopes = state
            .active
            .drain()
            .map(|(_, scope)| scope)
            .chain(state.isolated.drain().map(|(_, scope)| scope))
            .collect::<Vec<_>>();

        for scope in &scopes {
            scope.token.cancel();
        }

        if !scopes.is_empty() {
            debug!(cancelled = scopes.len(), "cancelled all outstanding requests");
        }
        scopes.len()
    }

    /// Latest generation issued for `class` (0 if never issued).
    pub fn generation(&self, class: &ClassTag) -> u64 {
        self.state
            .lock()
            .generations
            .get(class)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_outstanding(&self, class: &ClassTag) -> bool {
        let state = self.state.lock();
        state.active.contains_key(class) || state.isolated.keys().any(|(tag, _)| tag == class)
    }

    /// Number of outstanding scopes across all classes.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.active.len() + state.isolated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn coordinator() -> RequestCoordinator {
        RequestCoordinator::new(CoordinatorConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_issue_supersedes_outstanding_request() {
        let coordinator = coordinator();
        let tag = ClassTag::primary();

        let first = coordinator.issue(&tag, async {
            sleep(Duration::from_millis(100)).await;
            Ok(1)
        });
        let second = async {
            sleep(Duration::from_millis(10)).await;
            coordinator
                .issue(&tag, async {
                    sleep(Duration::from_millis(50)).await;
                    Ok(2)
                })
                .await
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first, Outcome::Cancelled);
        assert_eq!(second, Outcome::Success(2));
        assert_eq!(coordinator.generation(&tag), 2);
        assert!(!coordinator.is_outstanding(&tag));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_last_of_many_issues_commits() {
        let coordinator = coordinator();
        let tag = ClassTag::primary();
        let applied = Mutex::new(Vec::new());

        // Later issues finish sooner, so completions arrive in reverse order
        let issues = (0..5u64).map(|index| {
            let coordinator = &coordinator;
            let tag = &tag;
            let applied = &applied;
            async move {
                sleep(Duration::from_millis(index * 5)).await;
                let (ticket, outcome) = coordinator
                    .issue_scoped(tag, async move {
                        sleep(Duration::from_millis(100 - index * 10)).await;
                        Ok(index)
                    })
                    .await;
                if let Outcome::Success(value) = &outcome {
                    coordinator.commit(&ticket, || applied.lock().push(*value));
                }
                outcome
            }
        });

        let outcomes = futures::future::join_all(issues).await;
        assert_eq!(
            outcomes,
            vec![
                Outcome::Cancelled,
                Outcome::Cancelled,
                Outcome::Cancelled,
                Outcome::Cancelled,
                Outcome::Success(4),
            ]
        );
        assert_eq!(*applied.lock(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_refuses_superseded_ticket() {
        let coordinator = coordinator();
        let tag = ClassTag::primary();

        let (old_ticket, outcome) = coordinator.issue_scoped(&tag, async { Ok(()) }).await;
        assert!(outcome.is_success());

        let (new_ticket, _) = coordinator.issue_scoped(&tag, async { Ok(()) }).await;

        assert_eq!(coordinator.commit(&old_ticket, || "old"), None);
        assert_eq!(coordinator.commit(&new_ticket, || "new"), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_once_as_timeout() {
        let coordinator = RequestCoordinator::new(
            CoordinatorConfig::default().with_timeout(ClassTag::primary(), Duration::from_secs(1)),
        );
        let tag = ClassTag::primary();

        let (ticket, outcome) = coordinator
            .issue_scoped(&tag, async {
                sleep(Duration::from_secs(20)).await;
                Ok(())
            })
            .await;

        assert_eq!(outcome, Outcome::Timeout);
        assert!(ticket.is_cancelled());
        assert!(!coordinator.is_outstanding(&tag));
        assert_eq!(coordinator.commit(&ticket, || ()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_passes_through() {
        let coordinator = coordinator();
        let outcome: Outcome<()> = coordinator
            .issue(&ClassTag::primary(), async {
                Err(SyncError::Http("connection refused".to_string()))
            })
            .await;

        assert_eq!(
            outcome,
            Outcome::Failure(SyncError::Http("connection refused".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_isolated_and_independent_classes_do_not_cancel_each_other() {
        let coordinator = coordinator();
        let primary = ClassTag::primary();
        let secondary = ClassTag::secondary();
        let prefetch = ClassTag::isolated("prefetch");

        let slow = |value: u8| async move {
            sleep(Duration::from_millis(50)).await;
            Ok::<_, SyncError>(value)
        };

        let (a, b, c, d) = tokio::join!(
            coordinator.issue(&primary, slow(1)),
            coordinator.issue(&secondary, slow(2)),
            coordinator.issue(&prefetch, slow(3)),
            coordinator.issue(&prefetch, slow(4)),
        );

        assert_eq!(a, Outcome::Success(1));
        assert_eq!(b, Outcome::Success(2));
        assert_eq!(c, Outcome::Success(3));
        assert_eq!(d, Outcome::Success(4));
        assert_eq!(coordinator.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_cancels_every_scope() {
        let coordinator = coordinator();
        let slow = || async {
            sleep(Duration::from_secs(1)).await;
            Ok::<_, SyncError>(())
        };

        let primary = ClassTag::primary();
        let prefetch = ClassTag::isolated("prefetch");

        let (a, b, cancelled) = tokio::join!(
            coordinator.issue(&primary, slow()),
            coordinator.issue(&prefetch, slow()),
            async {
                sleep(Duration::from_millis(10)).await;
                coordinator.cancel_all()
            }
        );

        assert_eq!(a, Outcome::Cancelled);
        assert_eq!(b, Outcome::Cancelled);
        assert_eq!(cancelled, 2);
        assert_eq!(coordinator.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_issue_releases_scope() {
        let coordinator = coordinator();
        let tag = ClassTag::primary();

        let dropped = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.issue(&tag, async {
                sleep(Duration::from_secs(1)).await;
                Ok(())
            }),
        )
        .await;

        assert!(dropped.is_err());
        assert!(!coordinator.is_outstanding(&tag));
    }

    #[test]
    fn test_timeout_for_class_override() {
        let config = CoordinatorConfig::default()
            .with_default_timeout(Duration::from_secs(5))
            .with_timeout(ClassTag::secondary(), Duration::from_secs(30));

        assert_eq!(config.timeout_for(&ClassTag::primary()), Duration::from_secs(5));
        assert_eq!(config.timeout_for(&ClassTag::secondary()), Duration::from_secs(30));
    }
}
