use crate::cbs::ClaimsBasedSecurityNode;
use crate::common::{AmqpError, AmqpResult};
use crate::observer::{ConnectionObserver, NoopObserver};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Refresh interval used until the first authorization computes one
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 60_000;

/// Lower bound for the timer so an already-expired token cannot spin the loop
const MIN_REFRESH_DELAY: Duration = Duration::from_secs(1);

const OUTCOME_BUFFER: usize = 16;

/// Result of a scheduled re-authorization, as seen by outcome subscribers.
#[derive(Clone, Debug)]
pub enum AuthorizationOutcome {
    /// The CBS node accepted the refreshed token
    Accepted,
    /// A non-transient failure; the schedule has been disarmed
    Failed(AmqpError),
}

/// Delay until the next refresh: 90% of the remaining token lifetime, in whole
/// seconds.
pub fn refresh_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let seconds_until_expiry = (expires_at - now).num_seconds().max(0) as u64;
    Duration::from_millis(seconds_until_expiry * 9 / 10 * 1000)
}

struct RefreshState {
    cbs: Arc<dyn ClaimsBasedSecurityNode>,
    audience: String,
    scopes: String,
    observer: Mutex<Arc<dyn ConnectionObserver>>,
    last_refresh_interval_ms: AtomicU64,
    armed: AtomicBool,
    disposed: AtomicBool,
    shutdown: CancellationToken,
    outcomes: Mutex<Option<broadcast::Sender<AuthorizationOutcome>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one audience authorized on a connection's CBS node.
///
/// The first successful [`authorize`](Self::authorize) arms a background task
/// that re-authorizes at 90% of each token's lifetime. Transient failures are
/// retried after the last known interval without being reported; other
/// failures are published on the outcome stream and disarm the schedule until
/// `authorize` is called again.
///
/// # Examples
///
/// ```no_run
/// use amqp::auth::TokenRefreshManager;
/// use futures::StreamExt;
///
/// # async fn example(manager: TokenRefreshManager) -> amqp::common::AmqpResult<()> {
/// let mut outcomes = manager.outcomes();
/// let next_refresh = manager.authorize().await?;
/// println!("refreshing again in {next_refresh:?}");
///
/// while let Some(outcome) = outcomes.next().await {
///     println!("refresh outcome: {outcome:?}");
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TokenRefreshManager {
    inner: Arc<RefreshState>,
}

impl fmt::Debug for TokenRefreshManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRefreshManager")
            .field("audience", &self.inner.audience)
            .field("armed", &self.is_armed())
            .field("disposed", &self.is_disposed())
            .field("last_refresh_interval", &self.last_refresh_interval())
            .finish()
    }
}

impl TokenRefreshManager {
    pub fn new(
        cbs: Arc<dyn ClaimsBasedSecurityNode>,
        audience: impl Into<String>,
        scopes: impl Into<String>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_BUFFER);
        Self {
            inner: Arc::new(RefreshState {
                cbs,
                audience: audience.into(),
                scopes: scopes.into(),
                observer: Mutex::new(Arc::new(NoopObserver)),
                last_refresh_interval_ms: AtomicU64::new(DEFAULT_REFRESH_INTERVAL_MS),
                armed: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                outcomes: Mutex::new(Some(outcomes)),
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// Attach an observer, replacing the current one for every clone of this manager.
    pub fn with_observer(self, observer: Arc<dyn ConnectionObserver>) -> Self {
        if let Ok(mut current) = self.inner.observer.lock() {
            *current = observer;
        }
        self
    }

    pub fn audience(&self) -> &str {
        &self.inner.audience
    }

    /// Authorize the audience now and arm the refresh schedule if needed.
    ///
    /// Returns the delay until the next scheduled refresh.
    ///
    /// # Errors
    ///
    /// Fails immediately with [`AmqpError::Disposed`] once the manager is
    /// closed, otherwise with whatever the CBS node reported.
    pub async fn authorize(&self) -> AmqpResult<Duration> {
        if self.inner.is_disposed() {
            return Err(self.inner.disposed_error());
        }

        let delay = self.inner.request_authorization().await?;

        if self
            .inner
            .armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            log::debug!(
                "Arming token refresh for '{}' in {delay:?}",
                self.inner.audience
            );
            RefreshState::schedule_refresh(self.inner.clone(), delay);
        }

        Ok(delay)
    }

    /// Stream of outcomes from scheduled refreshes.
    ///
    /// Every call returns an independent subscriber that sees outcomes
    /// published after it subscribed. The stream ends when the manager is
    /// closed.
    pub fn outcomes(&self) -> BoxStream<'static, AuthorizationOutcome> {
        let receiver = self
            .inner
            .outcomes
            .lock()
            .ok()
            .and_then(|sender| sender.as_ref().map(broadcast::Sender::subscribe));
        let audience = self.inner.audience.clone();

        futures::stream::unfold(receiver, move |receiver| {
            let audience = audience.clone();
            async move {
                let mut receiver = receiver?;
                loop {
                    match receiver.recv().await {
                        Ok(outcome) => return Some((outcome, Some(receiver))),
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!(
                                "Outcome subscriber for '{audience}' skipped {skipped} outcomes"
                            );
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }

    /// Interval stored by the most recent successful authorization
    pub fn last_refresh_interval(&self) -> Duration {
        self.inner.last_refresh_interval()
    }

    pub fn is_armed(&self) -> bool {
        self.inner.armed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Dispose the manager: cancel the pending refresh and end the outcome
    /// stream. Safe to call repeatedly.
    pub fn close(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        log::debug!("Closing token refresh for '{}'", self.inner.audience);
        self.inner.shutdown.cancel();
        self.inner.armed.store(false, Ordering::SeqCst);

        if let Ok(mut task) = self.inner.refresh_task.lock() {
            task.take();
        }
        if let Ok(mut outcomes) = self.inner.outcomes.lock() {
            outcomes.take();
        }
    }
}

impl RefreshState {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn disposed_error(&self) -> AmqpError {
        AmqpError::disposed(format!("token refresh manager for '{}'", self.audience))
    }

    fn last_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.last_refresh_interval_ms.load(Ordering::SeqCst))
    }

    fn observer(&self) -> Arc<dyn ConnectionObserver> {
        match self.observer.lock() {
            Ok(observer) => observer.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// One CBS round-trip; stores the computed interval on success.
    async fn request_authorization(&self) -> AmqpResult<Duration> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }

        match self.cbs.authorize(&self.audience, &self.scopes).await {
            Ok(expires_at) => {
                let delay = refresh_delay(expires_at, Utc::now());
                self.last_refresh_interval_ms
                    .store(delay.as_millis() as u64, Ordering::SeqCst);
                self.observer().on_authorization_succeeded(&self.audience, delay);
                Ok(delay)
            }
            Err(e) => {
                self.observer().on_authorization_failed(&self.audience, &e);
                Err(e)
            }
        }
    }

    fn publish(&self, outcome: AuthorizationOutcome) {
        let Ok(outcomes) = self.outcomes.lock() else {
            return;
        };
        if let Some(sender) = outcomes.as_ref() {
            // No subscribers is not an error
            let _ = sender.send(outcome);
        }
    }

    /// Start the refresh loop; `delay` counts from now, not from when the task first runs
    fn schedule_refresh(state: Arc<Self>, delay: Duration) {
        let deadline = Instant::now() + delay.max(MIN_REFRESH_DELAY);
        let task = tokio::spawn(state.clone().refresh_loop(deadline));
        if let Ok(mut refresh_task) = state.refresh_task.lock() {
            *refresh_task = Some(task);
        }
    }

    async fn refresh_loop(self: Arc<Self>, mut deadline: Instant) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep_until(deadline) => {}
            }

            log::debug!("Refreshing token for '{}'", self.audience);

            match self.request_authorization().await {
                Ok(next) => {
                    self.publish(AuthorizationOutcome::Accepted);
                    if self.is_disposed() {
                        return;
                    }
                    deadline = Instant::now() + next.max(MIN_REFRESH_DELAY);
                }
                Err(_) if self.is_disposed() => return,
                Err(e) if e.is_transient() => {
                    let delay = self.last_refresh_interval();
                    deadline = Instant::now() + delay.max(MIN_REFRESH_DELAY);
                    log::warn!(
                        "Transient failure refreshing '{}', retrying in {delay:?}: {e}",
                        self.audience
                    );
                }
                Err(e) => {
                    log::error!("Token refresh for '{}' failed: {e}", self.audience);
                    self.armed.store(false, Ordering::SeqCst);
                    self.publish(AuthorizationOutcome::Failed(e));
                    return;
                }
            }
        }
    }
}
